// SPDX-License-Identifier: BSD-3-Clause

//! The Qualcomm boot-ROM Sahara protocol: a binary request/response
//! dialogue that transfers the stage-2 "loader" into device SRAM and
//! optionally answers chip-identity queries before doing so.
//!
//! Every packet is `command:u32 LE | length:u32 LE | body`. The state
//! machine here implements `WaitHello -> SendHelloResp -> ImageTransfer
//! -> (optional CommandMode) -> Done -> Handoff` from the spec.

use std::io::{Read, Write};

use crate::codec::{read_u32_le, write_u32_le};
use crate::errors::{Result, SaharaError, TransportError};
use crate::types::QdlChan;

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESP: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_IMAGE_TX: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESP: u32 = 0x06;
const CMD_RESET: u32 = 0x07;
const CMD_RESET_RESP: u32 = 0x08;
const CMD_MEMORY_DEBUG: u32 = 0x09;
const CMD_MEMORY_READ: u32 = 0x0A;
const CMD_CMD_READY: u32 = 0x0B;
const CMD_CMD_SWITCH_MODE: u32 = 0x0C;
const CMD_CMD_EXEC: u32 = 0x0D;
const CMD_CMD_EXEC_RESP: u32 = 0x0E;
const CMD_CMD_EXEC_DATA: u32 = 0x0F;
const CMD_READ_DATA_64: u32 = 0x12;

const HEADER_LEN: usize = 8;

/// `HELLO_RESP.mode`: which sub-protocol the host wants the device to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaMode {
    WaitingForImage = 0,
    MemoryDebug = 2,
    Command = 3,
}

/// `CMD_EXEC` sub-commands available in command mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 1,
    ReadMsmHwId = 2,
    ReadOemKeyHash = 3,
}

fn read_packet<T: Read>(rw: &mut T) -> Result<(u32, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    rw.read_exact(&mut header).map_err(TransportError::classify)?;
    let command = read_u32_le(&header[0..4]).expect("slice is 4 bytes");
    let length = read_u32_le(&header[4..8]).expect("slice is 4 bytes") as usize;
    if length < HEADER_LEN {
        return Err(SaharaError::UnexpectedCommand(command, "packet shorter than header").into());
    }
    let mut body = vec![0u8; length - HEADER_LEN];
    rw.read_exact(&mut body).map_err(TransportError::classify)?;
    Ok((command, body))
}

fn write_packet<T: Write>(rw: &mut T, command: u32, body: &[u8]) -> Result<()> {
    let length = (HEADER_LEN + body.len()) as u32;
    let mut packet = write_u32_le(command);
    packet.extend(write_u32_le(length));
    packet.extend_from_slice(body);
    rw.write_all(&packet).map_err(TransportError::classify)?;
    Ok(())
}

/// Sends `HELLO_RESP` echoing the hello fields back with the chosen mode:
/// `version, version_min, max_cmd_pkt_len, reserved x6` are passed
/// through unchanged, only `mode` is ours to choose.
fn send_hello_resp_fields<T: Read + Write>(
    rw: &mut T,
    version: u32,
    version_min: u32,
    max_cmd_pkt_len: u32,
    mode: SaharaMode,
) -> Result<()> {
    let mut body = Vec::with_capacity(40);
    body.extend(write_u32_le(version));
    body.extend(write_u32_le(version_min));
    body.extend(write_u32_le(max_cmd_pkt_len));
    body.extend(write_u32_le(mode as u32));
    body.extend([0u8; 24]); // reserved x6 u32
    write_packet(rw, CMD_HELLO_RESP, &body)
}

/// Work-around for a device that already consumed `HELLO` before we
/// attached (e.g. a previous tool's session). Sends a plausible
/// `HELLO_RESP` without having seen the matching `HELLO`.
pub fn sahara_send_hello_rsp<T: QdlChan + Read + Write>(channel: &mut T, mode: SaharaMode) -> Result<()> {
    send_hello_resp_fields(channel, 2, 1, 0, mode)
}

fn image_chunk_response<T: Read + Write>(rw: &mut T, images: &mut [Vec<u8>], body: &[u8], is_64bit: bool) -> Result<()> {
    let (image_id, offset, length) = if is_64bit {
        let image_id = read_u32_le(&body[0..4]).unwrap();
        let offset = crate::codec::read_u64_le(&body[8..16]).unwrap();
        let length = crate::codec::read_u64_le(&body[16..24]).unwrap();
        (image_id, offset, length)
    } else {
        let image_id = read_u32_le(&body[0..4]).unwrap();
        let offset = read_u32_le(&body[4..8]).unwrap() as u64;
        let length = read_u32_le(&body[8..12]).unwrap() as u64;
        (image_id, offset, length)
    };

    // Devices request images by an opaque id that need not match our
    // upload order; when only one image was handed in, it's always the
    // one being served regardless of the requested id.
    let image = if images.len() == 1 {
        &images[0]
    } else {
        images
            .get(image_id as usize)
            .ok_or(SaharaError::UnknownImage(image_id))?
    };
    let start = offset as usize;
    let end = start + length as usize;
    let slice = image
        .get(start..end)
        .ok_or(SaharaError::UnknownImage(image_id))?;
    rw.write_all(slice).map_err(TransportError::classify)?;
    Ok(())
}

/// Runs the Sahara state machine to completion for one of three purposes:
///
/// - `mode = WaitingForImage`: transfer `images` (the loader, and any
///   further images the device requests by id) and hand off execution.
/// - `mode = Command`: switch to command mode and run a single
///   `cmd_mode_cmd` (serial number / HW id / OEM key hash read), returning
///   its raw response bytes.
/// - `mode = MemoryDebug`: switch to memory-debug mode and request each
///   named region in `mem_regions`, returning the concatenated bytes.
///
/// Implements the `RESET`/`RESET_RESP` mid-session recovery path: if the
/// device is found already mid-dialogue the caller can invoke this again
/// after a `sahara_reset`.
pub fn sahara_run<T: QdlChan + Read + Write>(
    channel: &mut T,
    mode: SaharaMode,
    cmd_mode_cmd: Option<SaharaCmdModeCmd>,
    images: &mut [Vec<u8>],
    mem_regions: Vec<String>,
    verbose: bool,
) -> Result<Vec<u8>> {
    let (command, body) = read_packet(channel)?;
    if command != CMD_HELLO {
        return Err(SaharaError::UnexpectedCommand(command, "WaitHello").into());
    }
    if verbose {
        tracing::debug!("sahara: got HELLO, {} byte body", body.len());
    }
    let version = read_u32_le(&body[0..4]).unwrap_or(2);
    let version_min = read_u32_le(&body[4..8]).unwrap_or(1);
    let max_cmd_pkt_len = read_u32_le(&body[8..12]).unwrap_or(0);

    send_hello_resp_fields(channel, version, version_min, max_cmd_pkt_len, mode)?;

    match mode {
        SaharaMode::WaitingForImage => {
            loop {
                let (command, body) = read_packet(channel)?;
                match command {
                    CMD_READ_DATA => image_chunk_response(channel, images, &body, false)?,
                    CMD_READ_DATA_64 => image_chunk_response(channel, images, &body, true)?,
                    CMD_END_IMAGE_TX => {
                        let image_id = read_u32_le(&body[0..4]).unwrap_or(0);
                        let status = read_u32_le(&body[8..12]).unwrap_or(0);
                        if status != 0 {
                            return Err(SaharaError::LoaderRejected(status).into());
                        }
                        if verbose {
                            tracing::debug!("sahara: image {image_id} transfer complete");
                        }
                        write_packet(channel, CMD_DONE, &[])?;
                        let (done_resp, done_body) = read_packet(channel)?;
                        if done_resp != CMD_DONE_RESP {
                            return Err(SaharaError::UnexpectedCommand(done_resp, "Done").into());
                        }
                        let status = read_u32_le(&done_body[0..4]).unwrap_or(0);
                        if status != 0 {
                            return Err(SaharaError::LoaderRejected(status).into());
                        }
                        return Ok(Vec::new());
                    }
                    CMD_RESET_RESP => return Ok(Vec::new()),
                    other => return Err(SaharaError::UnexpectedCommand(other, "ImageTransfer").into()),
                }
            }
        }
        SaharaMode::Command => {
            let (ready, _) = read_packet(channel)?;
            if ready != CMD_CMD_READY {
                return Err(SaharaError::UnexpectedCommand(ready, "CommandMode").into());
            }
            let cmd = cmd_mode_cmd.ok_or(SaharaError::UnexpectedCommand(0, "CommandMode needs a cmd_mode_cmd"))?;
            write_packet(channel, CMD_CMD_EXEC, &write_u32_le(cmd as u32))?;
            let (resp, resp_body) = read_packet(channel)?;
            if resp != CMD_CMD_EXEC_RESP {
                return Err(SaharaError::UnexpectedCommand(resp, "CmdExecResp").into());
            }
            let data_len = read_u32_le(&resp_body[4..8]).unwrap_or(0) as usize;
            let (data_cmd, data) = read_packet(channel)?;
            if data_cmd != CMD_CMD_EXEC_DATA {
                return Err(SaharaError::UnexpectedCommand(data_cmd, "CmdExecData").into());
            }
            Ok(data.into_iter().take(data_len).collect())
        }
        SaharaMode::MemoryDebug => {
            let (ready, ready_body) = read_packet(channel)?;
            if ready != CMD_MEMORY_DEBUG {
                return Err(SaharaError::UnexpectedCommand(ready, "MemoryDebug").into());
            }
            let table_addr = read_u32_le(&ready_body[0..4]).unwrap_or(0);
            if verbose {
                tracing::debug!("sahara: memory debug table at {table_addr:#x}, {} regions requested", mem_regions.len());
            }
            let mut out = Vec::new();
            for region in &mem_regions {
                tracing::info!("sahara: requesting memory-debug region {region}");
                write_packet(channel, CMD_MEMORY_READ, &write_u32_le(table_addr))?;
                let (cmd, body) = read_packet(channel)?;
                if cmd != CMD_MEMORY_READ {
                    return Err(SaharaError::UnexpectedCommand(cmd, "MemoryRead").into());
                }
                out.extend(body);
            }
            Ok(out)
        }
    }
}

/// Sends `RESET` and waits for `RESET_RESP`; the only recovery path when a
/// mid-session device is found unexpectedly, per the spec.
pub fn sahara_reset<T: QdlChan + Read + Write>(channel: &mut T) -> Result<()> {
    write_packet(channel, CMD_RESET, &[])?;
    let (command, body) = read_packet(channel)?;
    if command != CMD_RESET_RESP {
        return Err(SaharaError::UnexpectedCommand(command, "Reset").into());
    }
    let status = read_u32_le(&body[0..4]).unwrap_or(0);
    if status != 0 {
        return Err(SaharaError::LoaderRejected(status).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Loopback {
        inbound: Cursor<Vec<u8>>,
        pub outbound: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn hello_packet() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend(write_u32_le(2)); // version
        body.extend(write_u32_le(1)); // version_min
        body.extend(write_u32_le(0)); // max_cmd_pkt_len
        body.extend(write_u32_le(0)); // mode
        body.extend([0u8; 24]); // reserved x6
        let mut packet = write_u32_le(CMD_HELLO);
        packet.extend(write_u32_le((HEADER_LEN + body.len()) as u32));
        packet.extend(body);
        packet
    }

    #[test]
    fn s1_hello_roundtrip() {
        let (cmd, body) = read_packet(&mut Cursor::new(hello_packet())).unwrap();
        assert_eq!(cmd, CMD_HELLO);
        let version = read_u32_le(&body[0..4]).unwrap();
        let version_min = read_u32_le(&body[4..8]).unwrap();
        let max_cmd_pkt_len = read_u32_le(&body[8..12]).unwrap();
        let mode = read_u32_le(&body[12..16]).unwrap();
        assert_eq!((version, version_min, max_cmd_pkt_len, mode), (2, 1, 0, 0));

        let mut lb = Loopback { inbound: Cursor::new(Vec::new()), outbound: Vec::new() };
        send_hello_resp_fields(&mut lb, version, version_min, max_cmd_pkt_len, SaharaMode::WaitingForImage).unwrap();
        let (resp_cmd, resp_body) = read_packet(&mut Cursor::new(lb.outbound)).unwrap();
        assert_eq!(resp_cmd, CMD_HELLO_RESP);
        assert_eq!(read_u32_le(&resp_body[0..4]).unwrap(), version);
        assert_eq!(read_u32_le(&resp_body[12..16]).unwrap(), SaharaMode::WaitingForImage as u32);
    }

    #[test]
    fn s2_image_chunk_service() {
        let loader = vec![0xAAu8; 4096];
        let mut images = vec![loader.clone()];

        let mut read_data = write_u32_le(CMD_READ_DATA);
        let mut body = write_u32_le(13); // image_id
        body.extend(write_u32_le(0)); // offset
        body.extend(write_u32_le(4096)); // length
        read_data.extend(write_u32_le((HEADER_LEN + body.len()) as u32));
        read_data.extend(body);

        let mut lb = Loopback { inbound: Cursor::new(Vec::new()), outbound: Vec::new() };
        let (_, body) = read_packet(&mut Cursor::new(read_data)).unwrap();
        image_chunk_response(&mut lb, &mut images, &body, false).unwrap();
        assert_eq!(lb.outbound, loader);
    }
}

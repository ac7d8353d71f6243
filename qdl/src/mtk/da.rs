// SPDX-License-Identifier: BSD-3-Clause

use std::io::{Read, Write};

use crate::codec::{read_u16_be, read_u16_le, read_u32_le, write_u16_be, write_u32_be, xor16};
use crate::errors::{BromError, Result, TransportError};
use crate::mtk::handshake::HwInfo;
use crate::types::CancelToken;

const DA_MAGIC_ASCII: &[u8] = b"MTK_DOWNLOAD_AGENT";
const DA_MAGIC_OFFSET: usize = 0x60;
const DA_MAGIC_WORD: u32 = 0x9988_6622;
const DA_SOC_COUNT_OFFSET: usize = 0x68;
const DA_ENTRY_TABLE_OFFSET: usize = 0x6A;

const ENTRY_MAGIC: u16 = 0xADDA;
const ENTRY_HEADER_LEN: usize = 0x14;
const REGION_LEN: usize = 0x20;
const MAX_REGIONS: usize = 6;
const LEGACY_ENTRY_SIZE: usize = 0xD8;
const V5_ENTRY_SIZE: usize = 0xDC;

/// One flashable region within a DA entry: DA1 is the preloader
/// helper, DA2 the full download agent; `load_address` is where BROM/DA1
/// will place it before executing.
#[derive(Debug, Clone, Copy)]
pub struct DaRegion {
    pub file_offset: u32,
    pub total_len: u32,
    pub load_address: u32,
    pub payload_len: u32,
    pub sig_len: u32,
}

#[derive(Debug, Clone)]
pub struct DaEntry {
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub regions: Vec<DaRegion>,
}

#[derive(Debug, Clone)]
pub struct DaFile<'a> {
    bytes: &'a [u8],
    entries: Vec<DaEntry>,
}

impl<'a> DaFile<'a> {
    /// Parses a multi-SoC DA file. Validates the ASCII banner and the magic
    /// word at 0x60; per-entry layout is auto-detected between the legacy
    /// (0xD8) and v5/v6 (0xDC) entry sizes by checking which stride keeps
    /// `ENTRY_MAGIC` aligned for every entry.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < DA_MAGIC_OFFSET + 8 || &bytes[0..DA_MAGIC_ASCII.len()] != DA_MAGIC_ASCII {
            return Err(BromError::BadMagic { expected: 0, got: 0 }.into());
        }
        let magic = read_u32_le(&bytes[DA_MAGIC_OFFSET..DA_MAGIC_OFFSET + 4]).unwrap_or(0);
        if magic != DA_MAGIC_WORD {
            return Err(BromError::BadMagic { expected: DA_MAGIC_WORD, got: magic }.into());
        }
        let soc_count = read_u16_le(&bytes[DA_SOC_COUNT_OFFSET..DA_SOC_COUNT_OFFSET + 2]).unwrap_or(0) as usize;

        let entry_size = detect_entry_size(bytes, DA_ENTRY_TABLE_OFFSET, soc_count)
            .ok_or(BromError::BadMagic { expected: ENTRY_MAGIC as u32, got: 0 })?;

        let mut entries = Vec::with_capacity(soc_count);
        let mut pos = DA_ENTRY_TABLE_OFFSET;
        for _ in 0..soc_count {
            entries.push(parse_entry(bytes, pos)?);
            pos += entry_size;
        }

        Ok(DaFile { bytes, entries })
    }

    pub fn entry_for(&self, hw_code: u16) -> Option<&DaEntry> {
        self.entries.iter().find(|e| e.hw_code == hw_code)
    }

    pub fn region_bytes(&self, region: &DaRegion) -> &'a [u8] {
        let start = region.file_offset as usize;
        let end = start + region.total_len as usize;
        &self.bytes[start..end]
    }
}

fn detect_entry_size(bytes: &[u8], table_offset: usize, soc_count: usize) -> Option<usize> {
    for candidate in [V5_ENTRY_SIZE, LEGACY_ENTRY_SIZE] {
        if soc_count == 0 {
            return Some(candidate);
        }
        let needed = table_offset + candidate * soc_count;
        if needed > bytes.len() {
            continue;
        }
        let magic = read_u16_le(&bytes[table_offset..table_offset + 2]).unwrap_or(0);
        if magic == ENTRY_MAGIC {
            return Some(candidate);
        }
    }
    None
}

fn parse_entry(bytes: &[u8], offset: usize) -> Result<DaEntry> {
    let magic = read_u16_le(&bytes[offset..offset + 2]).unwrap_or(0);
    if magic != ENTRY_MAGIC {
        return Err(BromError::BadMagic { expected: ENTRY_MAGIC as u32, got: magic as u32 }.into());
    }
    let hw_code = read_u16_le(&bytes[offset + 2..offset + 4]).unwrap_or(0);
    let hw_sub_code = read_u16_le(&bytes[offset + 4..offset + 6]).unwrap_or(0);
    let hw_version = read_u16_le(&bytes[offset + 6..offset + 8]).unwrap_or(0);
    let region_index = read_u16_le(&bytes[offset + 16..offset + 18]).unwrap_or(0) as usize;
    let region_count = read_u16_le(&bytes[offset + 18..offset + 20]).unwrap_or(0) as usize;

    let table_start = offset + ENTRY_HEADER_LEN;
    let mut regions = Vec::with_capacity(region_count.min(MAX_REGIONS));
    for i in 0..region_count.min(MAX_REGIONS) {
        let r = table_start + i * REGION_LEN;
        regions.push(DaRegion {
            file_offset: read_u32_le(&bytes[r..r + 4]).unwrap_or(0),
            total_len: read_u32_le(&bytes[r + 4..r + 8]).unwrap_or(0),
            load_address: read_u32_le(&bytes[r + 8..r + 12]).unwrap_or(0),
            payload_len: read_u32_le(&bytes[r + 12..r + 16]).unwrap_or(0),
            sig_len: read_u32_le(&bytes[r + 16..r + 20]).unwrap_or(0),
        });
    }
    let _ = region_index;

    Ok(DaEntry { hw_code, hw_sub_code, hw_version, regions })
}

fn checked<T>(cancel: &CancelToken, f: impl FnOnce() -> std::io::Result<T>) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled.into());
    }
    let r = f().map_err(TransportError::classify)?;
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled.into());
    }
    Ok(r)
}

/// Uploads one DA region: `{addr, size, sig_len}` big-endian, a
/// 2-byte status, then `size + sig_len` bytes of payload, then a 2-byte
/// XOR-16 checksum the device must echo back matching `xor16(payload)`.
pub fn upload_region<T: Read + Write>(
    channel: &mut T,
    cancel: &CancelToken,
    region: &DaRegion,
    payload: &[u8],
) -> Result<()> {
    let mut header = write_u32_be(region.load_address);
    header.extend(write_u32_be(region.payload_len));
    header.extend(write_u32_be(region.sig_len));
    checked(cancel, || channel.write_all(&header))?;

    let mut status = [0u8; 2];
    checked(cancel, || channel.read_exact(&mut status))?;
    if read_u16_be(&status).unwrap_or(0) != 0 {
        return Err(BromError::Status(read_u16_be(&status).unwrap_or(0)).into());
    }

    checked(cancel, || channel.write_all(payload))?;

    let expected = xor16(payload);
    let mut checksum_bytes = [0u8; 2];
    checked(cancel, || channel.read_exact(&mut checksum_bytes))?;
    let got = read_u16_be(&checksum_bytes).unwrap_or(0);
    if got != expected {
        return Err(BromError::DaChecksumMismatch { expected, got }.into());
    }

    Ok(())
}

const CMD_JUMP_DA: u16 = 0xD5;

pub fn send_jump<T: Read + Write>(channel: &mut T, cancel: &CancelToken, load_address: u32) -> Result<()> {
    checked(cancel, || channel.write_all(&write_u16_be(CMD_JUMP_DA)))?;
    checked(cancel, || channel.write_all(&write_u32_be(load_address)))?;
    let mut status = [0u8; 2];
    checked(cancel, || channel.read_exact(&mut status))?;
    let status = read_u16_be(&status).unwrap_or(0);
    if status != 0 {
        return Err(BromError::Status(status).into());
    }
    Ok(())
}

const SYNC_DUMP_ACK: u32 = 0xC1C2_C3C4;
const SYNC_BYPASS_ACK: u32 = 0xA1A2_A3A4;

/// Which of the two recognised sync words the DA answered with after jump.
/// Both are accepted as "ready"; which one fired is reported so callers
/// can tell production from exploit flow rather than the driver silently
/// picking one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaSyncKind {
    DumpAck,
    BypassAck,
}

pub fn wait_for_sync<T: Read + Write>(channel: &mut T, cancel: &CancelToken) -> Result<DaSyncKind> {
    let mut word = [0u8; 4];
    checked(cancel, || channel.read_exact(&mut word))?;
    let value = u32::from_be_bytes(word);
    match value {
        SYNC_DUMP_ACK => {
            tracing::info!("mtk: DA sync word {value:#010x} (dump ack)");
            Ok(DaSyncKind::DumpAck)
        }
        SYNC_BYPASS_ACK => {
            tracing::info!("mtk: DA sync word {value:#010x} (bypass ack)");
            Ok(DaSyncKind::BypassAck)
        }
        other => Err(BromError::BadSync(other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Loopback {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
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

    #[test]
    fn s6_region_upload() {
        let payload = vec![0x42u8; 0x10000];
        let sig = vec![0x99u8; 0x100];
        let mut whole = payload.clone();
        whole.extend_from_slice(&sig);
        let checksum = xor16(&whole);

        let region = DaRegion {
            file_offset: 0x2000,
            total_len: 0x10100,
            load_address: 0x200000,
            payload_len: 0x10000,
            sig_len: 0x100,
        };

        let mut inbound = vec![0u8, 0u8]; // status word after header
        inbound.extend(checksum.to_be_bytes());
        let cancel = CancelToken::new();
        let mut lb = Loopback { inbound: Cursor::new(inbound), outbound: Vec::new() };
        upload_region(&mut lb, &cancel, &region, &whole).unwrap();

        assert_eq!(&lb.outbound[0..4], &0x200000u32.to_be_bytes());
        assert_eq!(&lb.outbound[4..8], &0x10000u32.to_be_bytes());
        assert_eq!(&lb.outbound[8..12], &0x100u32.to_be_bytes());
        assert_eq!(&lb.outbound[12..], &whole[..]);
    }

    #[test]
    fn sync_accepts_both_known_words() {
        let cancel = CancelToken::new();
        let mut lb = Loopback { inbound: Cursor::new(SYNC_DUMP_ACK.to_be_bytes().to_vec()), outbound: Vec::new() };
        assert_eq!(wait_for_sync(&mut lb, &cancel).unwrap(), DaSyncKind::DumpAck);

        let mut lb = Loopback { inbound: Cursor::new(SYNC_BYPASS_ACK.to_be_bytes().to_vec()), outbound: Vec::new() };
        assert_eq!(wait_for_sync(&mut lb, &cancel).unwrap(), DaSyncKind::BypassAck);
    }
}

const CMD_SLA_CHALLENGE: u16 = 0xC1;
const CMD_DAA_CERT: u16 = 0xC2;

/// SLA: read a 16-byte challenge, hand it to `auth`, send back the signed
/// response (<= 256 bytes). DAA: send a length-prefixed X.509 root
/// certificate instead. Each step ends with a 2-byte status, matching the
/// rest of the BROM wire shape.
pub fn run_security_handshake<T: Read + Write>(
    channel: &mut T,
    cancel: &CancelToken,
    hw_info: &HwInfo,
    auth: &mut dyn FnMut(&[u8]) -> Result<Vec<u8>>,
) -> Result<()> {
    if hw_info.sla {
        checked(cancel, || channel.write_all(&write_u16_be(CMD_SLA_CHALLENGE)))?;
        let mut challenge = [0u8; 16];
        checked(cancel, || channel.read_exact(&mut challenge))?;
        let response = auth(&challenge)?;
        if response.len() > 256 {
            return Err(BromError::Status(0).into());
        }
        checked(cancel, || channel.write_all(&response))?;
        let mut status = [0u8; 2];
        checked(cancel, || channel.read_exact(&mut status))?;
        if read_u16_be(&status).unwrap_or(0) != 0 {
            return Err(BromError::Status(read_u16_be(&status).unwrap_or(0)).into());
        }
    }
    if hw_info.daa {
        checked(cancel, || channel.write_all(&write_u16_be(CMD_DAA_CERT)))?;
        let cert = auth(&[])?;
        checked(cancel, || channel.write_all(&write_u32_be(cert.len() as u32)))?;
        checked(cancel, || channel.write_all(&cert))?;
        let mut status = [0u8; 2];
        checked(cancel, || channel.read_exact(&mut status))?;
        if read_u16_be(&status).unwrap_or(0) != 0 {
            return Err(BromError::Status(read_u16_be(&status).unwrap_or(0)).into());
        }
    }
    Ok(())
}

// SPDX-License-Identifier: BSD-3-Clause

use std::io::{Read, Write};

use crate::codec::{read_u16_be, write_u16_be};
use crate::errors::{BromError, Result, TransportError};
use crate::types::CancelToken;

const HANDSHAKE_BYTES: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];

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

/// Sends the 4-byte BROM handshake one byte at a time, checking that each
/// echoed byte is the bitwise-NOT of what was sent.
pub fn brom_handshake<T: Read + Write>(channel: &mut T, cancel: &CancelToken) -> Result<()> {
    for (index, &sent) in HANDSHAKE_BYTES.iter().enumerate() {
        checked(cancel, || channel.write_all(&[sent]))?;
        let mut echo = [0u8; 1];
        checked(cancel, || channel.read_exact(&mut echo))?;
        let received = echo[0];
        if received != !sent {
            return Err(BromError::HandshakeFailed { index, sent, received }.into());
        }
    }
    Ok(())
}

/// Hardware-identity and security-posture query. `sbc`/`sla`/`daa`
/// come from bits 0/1/2 of the security-config byte.
#[derive(Debug, Clone)]
pub struct HwInfo {
    pub hw_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub sbc: bool,
    pub sla: bool,
    pub daa: bool,
    pub chip_name: String,
    pub meid: [u8; 16],
}

const CMD_GET_HW_CODE: u16 = 0xFD00;
const CMD_GET_HW_VERSION: u16 = 0xFD01;
const CMD_GET_SECURITY_CONFIG: u16 = 0xFD02;
const CMD_GET_CHIP_NAME: u16 = 0xFD03;
const CMD_GET_MEID: u16 = 0xFD04;

fn request_response<T: Read + Write>(
    channel: &mut T,
    cancel: &CancelToken,
    cmd: u16,
    datum_len: usize,
) -> Result<(Vec<u8>, u16)> {
    checked(cancel, || channel.write_all(&write_u16_be(cmd)))?;
    let mut echo = [0u8; 2];
    checked(cancel, || channel.read_exact(&mut echo))?;
    if read_u16_be(&echo).unwrap_or(0) != cmd {
        return Err(BromError::Status(read_u16_be(&echo).unwrap_or(0)).into());
    }
    let mut datum = vec![0u8; datum_len];
    checked(cancel, || channel.read_exact(&mut datum))?;
    let mut status_bytes = [0u8; 2];
    checked(cancel, || channel.read_exact(&mut status_bytes))?;
    let status = read_u16_be(&status_bytes).unwrap_or(0);
    if status != 0 {
        return Err(BromError::Status(status).into());
    }
    Ok((datum, status))
}

pub fn read_hw_info<T: Read + Write>(channel: &mut T, cancel: &CancelToken) -> Result<HwInfo> {
    let (hw_code_bytes, _) = request_response(channel, cancel, CMD_GET_HW_CODE, 2)?;
    let (hw_version_bytes, _) = request_response(channel, cancel, CMD_GET_HW_VERSION, 4)?;
    let (security_bytes, _) = request_response(channel, cancel, CMD_GET_SECURITY_CONFIG, 1)?;
    let (chip_name_bytes, _) = request_response(channel, cancel, CMD_GET_CHIP_NAME, 16)?;
    let (meid_bytes, _) = request_response(channel, cancel, CMD_GET_MEID, 16)?;

    let hw_code = read_u16_be(&hw_code_bytes).unwrap_or(0);
    let hw_version = read_u16_be(&hw_version_bytes[0..2]).unwrap_or(0);
    let sw_version = read_u16_be(&hw_version_bytes[2..4]).unwrap_or(0);
    let flags = security_bytes.first().copied().unwrap_or(0);
    let chip_name = String::from_utf8_lossy(&chip_name_bytes)
        .trim_end_matches('\0')
        .to_string();
    let mut meid = [0u8; 16];
    meid.copy_from_slice(&meid_bytes[..16.min(meid_bytes.len())]);

    Ok(HwInfo {
        hw_code,
        hw_version,
        sw_version,
        sbc: flags & 0b001 != 0,
        sla: flags & 0b010 != 0,
        daa: flags & 0b100 != 0,
        chip_name,
        meid,
    })
}

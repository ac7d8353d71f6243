// SPDX-License-Identifier: BSD-3-Clause

//! MediaTek BROM -> Download-Agent bring-up. Handshake, hardware-info
//! query, DA region selection and upload, jump, and sync, all expressed
//! as plain functions over a `Read + Write` channel the same way the
//! Sahara driver is.

pub mod da;
pub mod handshake;

pub use da::{DaEntry, DaFile, DaRegion, DaSyncKind};
pub use handshake::HwInfo;

use std::io::{Read, Write};

use crate::errors::{BromError, Result};
use crate::types::CancelToken;

/// Runs the full BROM bring-up: handshake, hardware-info query, DA region
/// selection by `hw_code`, upload of both DA stages, jump, and sync. `auth`
/// is invoked between hardware-info and DA1 upload if the security flags
/// require it; pass `None` when `hw_info.sla` and
/// `hw_info.daa` are both false, otherwise supplying `None` fails with
/// `BromError::Status` once the device rejects the unauthenticated upload.
pub fn bring_up<T: Read + Write>(
    channel: &mut T,
    cancel: &CancelToken,
    da_file: &[u8],
    auth: Option<&mut dyn FnMut(&[u8]) -> Result<Vec<u8>>>,
) -> Result<DaSyncKind> {
    handshake::brom_handshake(channel, cancel)?;
    let hw_info = handshake::read_hw_info(channel, cancel)?;
    tracing::info!(
        "mtk: hw_code={:#06x} hw_version={:#06x} sw_version={:#06x} sbc={} sla={} daa={}",
        hw_info.hw_code,
        hw_info.hw_version,
        hw_info.sw_version,
        hw_info.sbc,
        hw_info.sla,
        hw_info.daa
    );

    let da = DaFile::parse(da_file)?;
    let entry = da.entry_for(hw_info.hw_code).ok_or(BromError::NoMatchingSoc(hw_info.hw_code))?;

    if hw_info.sla || hw_info.daa {
        let auth = auth.ok_or(BromError::Status(0))?;
        da::run_security_handshake(channel, cancel, &hw_info, auth)?;
    }

    for region in &entry.regions {
        let payload = da.region_bytes(region);
        da::upload_region(channel, cancel, region, payload)?;
    }
    da::send_jump(channel, cancel, entry.regions.last().map(|r| r.load_address).unwrap_or(0))?;

    da::wait_for_sync(channel, cancel)
}

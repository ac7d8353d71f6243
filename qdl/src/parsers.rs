// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

use indexmap::IndexMap;

use owo_colors::OwoColorize;

use crate::errors::{FirehoseError, NakError};
use crate::types::{FirehoseResetMode, QdlChan};
use crate::{FirehoseStatus, firehose_configure, firehose_read, firehose_reset};

/// The highest protocol version currently supported by the library
pub(crate) const FH_PROTO_VERSION_SUPPORTED: u32 = 1;

// Parsers are kept separate for more flexibility (e.g. log replay analysis)

/// Check "value" for ack/nak (generic)
pub fn firehose_parser_ack_nak<T: QdlChan>(
    _: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, FirehoseError> {
    let val = attrs.get("value").to_owned();
    match val.map(String::as_str) {
        Some("ACK") => Ok(FirehoseStatus::Ack),
        Some("NAK") => Ok(FirehoseStatus::Nak),
        _ => Err(FirehoseError::MalformedData(attrs.clone())),
    }
}

/// Parse the \<configure\> response
pub fn firehose_parser_configure_response<T: QdlChan + std::io::Read + std::io::Write>(
    channel: &mut T,
    attrs: &IndexMap<String, String>,
) -> Result<FirehoseStatus, FirehoseError> {
    if let Ok(status) = firehose_parser_ack_nak(channel, attrs) {
        // The device can't handle that big of a buffer and it auto-reconfigures to the max it can
        if status == FirehoseStatus::Nak {
            if let Some(val) = attrs.get("MaxPayloadSizeToTargetInBytes").to_owned() {
                channel.mut_fh_config().send_buffer_size = val
                    .parse::<usize>()
                    .map_err(|_| FirehoseError::MalformedData(attrs.clone()))?;
            } else {
                firehose_reset(channel, &FirehoseResetMode::ResetToEdl, 0)?;
                return Err(FirehoseError::Nak(NakError::Configure, Vec::new()));
            }
        }
    }

    let device_max_write_payload_size = attrs
        .get("MaxPayloadSizeToTargetInBytesSupported")
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;

    let version = attrs
        .get("Version")
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;
    let min_version_supported = attrs
        .get("MinVersionSupported")
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;

    tracing::info!("firehose: device reports protocol version {}", version.bright_blue());

    if min_version_supported < FH_PROTO_VERSION_SUPPORTED {
        return Err(FirehoseError::ProtocolVersionIncompatibility {
            device_min_version: min_version_supported,
        });
    }

    // MaxPayloadSizeFromTargetInBytes is read back from device but kept informational only:
    // USB/serial transfers here are abstracted through the Read/Write traits, not raw libusb,
    // and older devices advertise a useless 1 KiB value for it.

    channel.mut_fh_config().xml_buf_size = attrs
        .get("MaxXMLSizeInBytes")
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;
    channel.mut_fh_config().send_buffer_size = attrs
        .get("MaxPayloadSizeToTargetInBytes")
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| FirehoseError::MalformedData(attrs.clone()))?;

    // If the device can take a larger buffer, reconfigure it.
    if channel.fh_config().send_buffer_size < device_max_write_payload_size {
        tracing::info!(
            "firehose: reconfiguring device to use a larger ({} kB) send buffer",
            device_max_write_payload_size / 1024
        );

        channel.mut_fh_config().send_buffer_size = device_max_write_payload_size;
        firehose_configure(channel, true)?;
        firehose_read(channel, firehose_parser_ack_nak)?;
    }

    Ok(FirehoseStatus::Ack)
}

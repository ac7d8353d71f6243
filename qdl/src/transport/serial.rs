// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use serial2::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;

use crate::types::QdlReadWrite;

use super::DEFAULT_BAUD;

pub struct QdlSerialConfig {
    serport: SerialPort,
}

impl Write for QdlSerialConfig {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        self.serport.write(buf)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.serport.flush()
    }
}

impl Read for QdlSerialConfig {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.serport.read(buf)
    }
}

impl QdlReadWrite for QdlSerialConfig {}

/// Opens a serial port at `baud` (115200 for Sahara/Firehose and the MTK
/// handshake, 921600 once MTK switches to bulk DA transfer) with a 30 s
/// read/write timeout matching the handshake default.
pub fn setup_serial_device(dev_path: Option<String>, baud: u32) -> Result<QdlSerialConfig> {
    let Some(dev_path) = dev_path else {
        bail!("Serial port path unspecified");
    };

    let serport = SerialPort::open(dev_path, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud)?;
        Ok(settings)
    })?;
    serport.set_read_timeout(Duration::from_secs(30))?;
    serport.set_write_timeout(Duration::from_secs(30))?;

    Ok(QdlSerialConfig { serport })
}

/// Convenience wrapper for the common case (Qualcomm Sahara/Firehose, always
/// 115200).
pub fn setup_default_serial_device(dev_path: Option<String>) -> Result<QdlSerialConfig> {
    setup_serial_device(dev_path, DEFAULT_BAUD)
}

/// Lists the serial port names currently enumerated by the OS. Used by
/// [`super::monitor::PortMonitor`] to detect a port disappearing mid-session.
pub fn available_port_names() -> Vec<String> {
    serial2::SerialPort::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

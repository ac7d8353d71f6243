// SPDX-License-Identifier: BSD-3-Clause

//! Byte-level endpoints: serial (MTK handshakes, some Sahara sessions) and
//! USB bulk (the common EDL case), plus a background port monitor that
//! turns "the OS stopped listing this device" into a `DeviceDisappeared`
//! notification instead of a silent hang on the next read.

pub mod monitor;
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

pub use monitor::{PortMonitor, PortMonitorHandle};
#[cfg(feature = "serial")]
pub use serial::QdlSerialConfig;
#[cfg(feature = "usb")]
pub use usb::QdlUsbConfig;

use crate::types::{QdlBackend, QdlReadWrite};

/// Opens whichever backend the caller selected, behind the crate's
/// `usb`/`serial` feature gates, and boxes it so the rest of the driver
/// never has to be generic over which one it got.
pub fn setup_target_device(backend: QdlBackend, serial_no: Option<String>, dev_path: Option<String>) -> anyhow::Result<Box<dyn QdlReadWrite>> {
    match backend {
        QdlBackend::Usb => {
            #[cfg(feature = "usb")]
            {
                Ok(Box::new(usb::setup_usb_device(serial_no)?))
            }
            #[cfg(not(feature = "usb"))]
            {
                let _ = serial_no;
                anyhow::bail!("this build was compiled without USB support")
            }
        }
        QdlBackend::Serial => {
            #[cfg(feature = "serial")]
            {
                Ok(Box::new(serial::setup_default_serial_device(dev_path)?))
            }
            #[cfg(not(feature = "serial"))]
            {
                let _ = dev_path;
                anyhow::bail!("this build was compiled without serial support")
            }
        }
    }
}

/// Default chunk size for bulk transfers.
pub const DEFAULT_BUFFER_SIZE: usize = 81_920;
/// Chunk size used once a session opts into large-transfer mode.
pub const LARGE_TRANSFER_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Baud rate used for the Qualcomm Sahara/Firehose session and the initial
/// MediaTek BROM handshake.
pub const DEFAULT_BAUD: u32 = 115_200;
/// Baud rate MediaTek switches to for DA bulk transfer.
pub const MTK_BULK_BAUD: u32 = 921_600;

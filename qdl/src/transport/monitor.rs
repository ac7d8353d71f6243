// SPDX-License-Identifier: BSD-3-Clause

//! Background observer that polls OS port/device enumeration and raises
//! `DeviceDisappeared` when the identifier the session attached to is no
//! longer listed. Neither `QdlSerialConfig` nor `QdlUsbConfig` detect
//! this on their own: a blocked `read()` on a vanished device can hang well
//! past any reasonable timeout, so a session that cares registers a monitor
//! alongside it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Which identifier to watch for in OS enumeration.
#[derive(Debug, Clone)]
pub enum WatchedPort {
    Serial(String),
    UsbSerialNumber(String),
    /// The "first EDL device found" case: watched by presence of *any*
    /// matching device rather than a specific serial number.
    UsbAny,
}

/// A running port monitor. Dropping this handle stops the background
/// thread; call [`PortMonitor::stop`] explicitly to stop it and observe
/// whether it had already fired.
pub struct PortMonitorHandle {
    stop_flag: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PortMonitorHandle {
    pub fn stop(mut self) -> bool {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.fired.load(Ordering::SeqCst)
    }

    /// True once the watched port has been observed missing.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for PortMonitorHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

pub struct PortMonitor;

impl PortMonitor {
    /// Spawns a background thread polling `watch` every 2 seconds; `on_disappear`
    /// runs (once) the first time the identifier is no longer enumerated.
    pub fn spawn<F>(watch: WatchedPort, on_disappear: F) -> PortMonitorHandle
    where
        F: Fn() + Send + 'static,
    {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));

        let stop_flag_thread = stop_flag.clone();
        let fired_thread = fired.clone();
        let join = std::thread::spawn(move || {
            while !stop_flag_thread.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
                if stop_flag_thread.load(Ordering::SeqCst) {
                    break;
                }
                let present = match &watch {
                    WatchedPort::Serial(_name) => {
                        #[cfg(feature = "serial")]
                        {
                            super::serial::available_port_names().iter().any(|p| p == _name)
                        }
                        #[cfg(not(feature = "serial"))]
                        {
                            true
                        }
                    }
                    WatchedPort::UsbSerialNumber(_sn) => {
                        #[cfg(feature = "usb")]
                        {
                            super::usb::available_serial_numbers().iter().any(|s| s == _sn)
                        }
                        #[cfg(not(feature = "usb"))]
                        {
                            true
                        }
                    }
                    WatchedPort::UsbAny => {
                        #[cfg(feature = "usb")]
                        {
                            !super::usb::available_serial_numbers().is_empty() || super::usb::edl_device_present()
                        }
                        #[cfg(not(feature = "usb"))]
                        {
                            true
                        }
                    }
                };
                if !present {
                    tracing::warn!("port monitor: watched device no longer enumerated");
                    fired_thread.store(true, Ordering::SeqCst);
                    on_disappear();
                    break;
                }
            }
        });

        PortMonitorHandle { stop_flag, fired, join: Some(join) }
    }
}

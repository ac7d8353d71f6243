// SPDX-License-Identifier: BSD-3-Clause

//! Shared types: the transport/channel traits every driver is generic
//! over, the runtime-negotiated Firehose configuration, and the plain
//! data types (`ChipIdentity`, `StorageProfile`, `PartitionEntry`,
//! `SlotState`) captured during a session.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marker trait for anything a Sahara/Firehose/BROM driver can talk over:
/// a concrete serial port, a USB bulk endpoint pair, or (in tests) an
/// in-memory loopback. Blanket-implemented for every `Read + Write`, so
/// `Box<dyn QdlReadWrite>` and `&mut dyn QdlReadWrite` both qualify.
pub trait QdlReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> QdlReadWrite for T {}

/// Cooperative cancellation flag shared between an `Orchestrator` and the
/// transport calls it makes on its worker thread. Checked at every
/// Transport `read`/`write` boundary per the suspension-point model in
/// the spec; nowhere else.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Which physical backend a session is talking over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdlBackend {
    #[default]
    Usb,
    Serial,
}

impl FromStr for QdlBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usb" => Ok(QdlBackend::Usb),
            "serial" => Ok(QdlBackend::Serial),
            other => anyhow::bail!("unknown backend {other:?}, expected usb/serial"),
        }
    }
}

impl fmt::Display for QdlBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QdlBackend::Usb => "usb",
            QdlBackend::Serial => "serial",
        })
    }
}

/// The storage technology behind the Firehose `<configure MemoryName=...>`
/// attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseStorageType {
    #[default]
    Ufs,
    Emmc,
    Nvme,
    Nand,
}

impl FromStr for FirehoseStorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ufs" => Ok(FirehoseStorageType::Ufs),
            "emmc" => Ok(FirehoseStorageType::Emmc),
            "nvme" => Ok(FirehoseStorageType::Nvme),
            "nand" => Ok(FirehoseStorageType::Nand),
            other => anyhow::bail!("unknown storage type {other:?}, expected emmc/ufs/nvme/nand"),
        }
    }
}

impl fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirehoseStorageType::Ufs => "ufs",
            FirehoseStorageType::Emmc => "emmc",
            FirehoseStorageType::Nvme => "nvme",
            FirehoseStorageType::Nand => "nand",
        })
    }
}

impl FirehoseStorageType {
    /// Mirrors `firehose_get_default_sector_size`: UFS/eMMC/NVMe use
    /// 512-byte LBAs, NAND's sector size can't be guessed.
    pub fn default_sector_size(&self) -> Option<usize> {
        match self {
            FirehoseStorageType::Ufs | FirehoseStorageType::Emmc | FirehoseStorageType::Nvme => Some(512),
            FirehoseStorageType::Nand => None,
        }
    }
}

/// `<power value="...">` target, also used for the final "all went well"
/// reset at the end of a CLI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseResetMode {
    Reset,
    ResetToEdl,
    PowerOff,
}

impl FromStr for FirehoseResetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" | "reset" => Ok(FirehoseResetMode::Reset),
            "edl" => Ok(FirehoseResetMode::ResetToEdl),
            "off" => Ok(FirehoseResetMode::PowerOff),
            other => anyhow::bail!("unknown reset mode {other:?}, expected edl/off/system"),
        }
    }
}

impl fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FirehoseResetMode::Reset => "system",
            FirehoseResetMode::ResetToEdl => "edl",
            FirehoseResetMode::PowerOff => "off",
        })
    }
}

impl FirehoseResetMode {
    pub fn xml_value(&self) -> &'static str {
        match self {
            FirehoseResetMode::Reset => "reset",
            FirehoseResetMode::ResetToEdl => "reset_to_edl",
            FirehoseResetMode::PowerOff => "off",
        }
    }
}

/// The in-session state negotiated by `<configure>` plus caller-supplied
/// knobs. Lives on `QdlDevice` and is mutated in place by the parsers as
/// the device's capabilities come back (`MaxPayloadSizeToTargetInBytes`,
/// `MaxXMLSizeInBytes`).
#[derive(Debug, Clone)]
pub struct FirehoseConfiguration {
    pub hash_packets: bool,
    pub read_back_verify: bool,
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    pub storage_slot: u8,
    pub bypass_storage: bool,
    pub backend: QdlBackend,
    pub skip_firehose_log: bool,
    pub verbose_firehose: bool,
    /// Chunk size used for bulk `program`/`read` payloads, clamped to 1 MiB
    /// per the spec. Overwritten by `firehose_parser_configure_response`.
    pub send_buffer_size: usize,
    /// Max size of a single command XML document, overwritten the same way.
    pub xml_buf_size: usize,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            hash_packets: false,
            read_back_verify: false,
            storage_type: FirehoseStorageType::default(),
            storage_sector_size: 512,
            storage_slot: 0,
            bypass_storage: false,
            backend: QdlBackend::default(),
            skip_firehose_log: true,
            verbose_firehose: false,
            send_buffer_size: 1024 * 1024,
            xml_buf_size: 4096,
        }
    }
}

/// The mode a session's device-side firmware is currently running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Sahara,
    Firehose,
    Brom,
    Preloader,
    Da,
}

/// Chip identity captured once during the Sahara command-mode handshake
/// (or the MediaTek hardware-info query). Immutable after capture.
#[derive(Debug, Clone)]
pub struct ChipIdentity {
    pub msm_id: u32,
    pub oem_id: u16,
    pub model_id: u16,
    pub hw_id: [u8; 8],
    pub pk_hash: [u8; 32],
    pub serial: [u8; 4],
    pub sbl_version: u32,
    pub mode: SessionMode,
}

/// Storage geometry discovered via Firehose `<configure>`.
#[derive(Debug, Clone, Copy)]
pub struct StorageProfile {
    pub kind: FirehoseStorageType,
    pub sector_size: u32,
    pub num_physical_partitions: u8,
}

/// A GPT partition entry, normalized from `gptman`'s representation plus
/// the LUN it was read from (UFS has several independently-partitioned
/// LUNs; eMMC has exactly one).
#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub name: String,
    pub lun: u8,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub guid_type: [u8; 16],
    pub attributes: u64,
}

impl PartitionEntry {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Derived from the `boot_a`/`boot_b` attribute bits per the Android A/B
/// spec (bits 48=priority, 49=active, 50=successful, as specified).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    NonExistent,
    Undefined,
    A,
    B,
}

pub(crate) fn attr_active(attributes: u64) -> bool {
    (attributes >> 49) & 1 != 0
}

/// What every Sahara/Firehose/BROM function is generic over: a handle
/// that knows the current `FirehoseConfiguration` and the session's
/// cancellation flag. Implemented by `QdlDevice`.
pub trait QdlChan {
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
    fn cancel(&self) -> &CancelToken;
}

/// A device session: the byte-level channel plus the negotiated Firehose
/// configuration. Generic over the concrete transport (`QdlSerialConfig`,
/// `QdlUsbConfig`, `Box<dyn QdlReadWrite>`, or an in-memory loopback in
/// tests) so the protocol layers never need to know which one they got.
///
/// When `reset_on_drop` is set, dropping the session while still attached
/// sends a Sahara/Firehose reset instead of leaving the device mid-session;
/// callers flip it off once they've already sent a deliberate reset.
pub struct QdlDevice<RW: QdlReadWrite> {
    pub rw: RW,
    pub fh_cfg: FirehoseConfiguration,
    pub reset_on_drop: bool,
    pub cancel: CancelToken,
}

impl<RW: QdlReadWrite> QdlChan for QdlDevice<RW> {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }

    fn cancel(&self) -> &CancelToken {
        &self.cancel
    }
}

fn cancelled_io_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled")
}

impl<RW: QdlReadWrite> Read for QdlDevice<RW> {
    /// Cancellation is checked immediately before and after the underlying
    /// syscall: the only place in the stack where it's physically observed,
    /// per the suspension-point model (every Transport read/write is a
    /// suspension point, nowhere else).
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_io_error());
        }
        let n = self.rw.read(buf)?;
        if self.cancel.is_cancelled() {
            return Err(cancelled_io_error());
        }
        Ok(n)
    }
}

impl<RW: QdlReadWrite> Write for QdlDevice<RW> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_io_error());
        }
        let n = self.rw.write(buf)?;
        if self.cancel.is_cancelled() {
            return Err(cancelled_io_error());
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rw.flush()
    }
}

impl<RW: QdlReadWrite> Drop for QdlDevice<RW> {
    fn drop(&mut self) {
        if self.reset_on_drop {
            if let Err(e) = crate::firehose_reset(self, &FirehoseResetMode::ResetToEdl, 0) {
                tracing::warn!("reset-on-drop failed: {e}");
            }
        }
    }
}

// SPDX-License-Identifier: BSD-3-Clause
use indexmap::IndexMap;

/// Errors raised by the byte-level transport (serial/USB) layer.
///
/// `DeviceDisappeared` is the only variant that is terminal for a session:
/// everything else is a per-call failure the caller may retry.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for data")]
    Timeout,
    #[error("port is closed")]
    PortClosed,
    #[error("device disappeared from the bus")]
    DeviceDisappeared,
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classifies a raw `io::Error`: a cancellation is surfaced as
    /// `Cancelled` (not folded into the generic `Io` variant), and a
    /// timed-out read/write as `Timeout`.
    pub fn classify(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::Interrupted => TransportError::Cancelled,
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => TransportError::DeviceDisappeared,
            _ => TransportError::Io(e),
        }
    }
}

/// Reasons a Firehose `<response value="NAK">` can carry no further detail
/// beyond "the device rejected something we asked for".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakError {
    Configure,
    Program,
    Read,
    Erase,
    Patch,
    SetBootableStorageDrive,
    Other,
}

impl std::fmt::Display for NakError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NakError::Configure => "configure",
            NakError::Program => "program",
            NakError::Read => "read",
            NakError::Erase => "erase",
            NakError::Patch => "patch",
            NakError::SetBootableStorageDrive => "setbootablestoragedrive",
            NakError::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by the Firehose XML command layer.
#[derive(thiserror::Error, Debug)]
pub enum FirehoseError {
    #[error("malformed response: {0:?}")]
    MalformedData(IndexMap<String, String>),
    #[error("device NAK during {0}, log: {1:?}")]
    Nak(NakError, Vec<String>),
    #[error("device requires at least protocol version {device_min_version}, which we don't support")]
    ProtocolVersionIncompatibility { device_min_version: u32 },
    #[error("configure rejected after {0} retries")]
    ConfigureRejected(u32),
    #[error("read rejected by device")]
    ReadRejected,
    #[error("checksum mismatch: expected {expected:#x}, got {got:#x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("xml error: {0}")]
    Xml(#[from] xmltree::ParseError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by the Sahara boot-ROM state machine.
#[derive(thiserror::Error, Debug)]
pub enum SaharaError {
    #[error("unexpected command {0:#x} in state {1}")]
    UnexpectedCommand(u32, &'static str),
    #[error("loader image rejected by device, status {0:#x}")]
    LoaderRejected(u32),
    #[error("device requested unknown image id {0}")]
    UnknownImage(u32),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by the MediaTek BROM/DA driver.
#[derive(thiserror::Error, Debug)]
pub enum BromError {
    #[error("handshake echo mismatch at byte {index}: sent {sent:#x}, got {received:#x}")]
    HandshakeFailed { index: usize, sent: u8, received: u8 },
    #[error("bad magic in DA file: expected {expected:#x}, got {got:#x}")]
    BadMagic { expected: u32, got: u32 },
    #[error("no DA entry for hw_code {0:#x}")]
    NoMatchingSoc(u16),
    #[error("DA checksum mismatch: expected {expected:#06x}, got {got:#06x}")]
    DaChecksumMismatch { expected: u16, got: u16 },
    #[error("DA sync returned unrecognised word {0:#010x}")]
    BadSync(u32),
    #[error("status word {0:#06x} from device")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by an `AuthStrategy`.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("signature or token rejected: {0}")]
    Rejected(String),
    #[error("external token needed: {0}")]
    TokenNeeded(String),
    #[error("no key available for {0}")]
    KeyNotFound(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by partition resolution.
#[derive(thiserror::Error, Debug)]
pub enum PartitionError {
    #[error("partition {0:?} not found in last GPT read")]
    NotFound(String),
    #[error("partition {0:?} is protected by the sensitive-partition deny-list")]
    Protected(String),
    #[error("gpt error: {0}")]
    Gpt(String),
}

/// Errors raised by session/job state tracking.
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("another job is already in flight")]
    Busy,
    #[error("cancelled")]
    Cancelled,
}

/// The crate-wide error type. Each protocol layer has its own enum above;
/// this aggregates them behind `?` so callers at the top (CLI, orchestrator)
/// can match on a single type when they don't care which layer failed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Firehose(#[from] FirehoseError),
    #[error(transparent)]
    Sahara(#[from] SaharaError),
    #[error(transparent)]
    Brom(#[from] BromError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(#[from] xmltree::ParseError),
}

pub type Result<T> = std::result::Result<T, Error>;

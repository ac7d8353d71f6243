// SPDX-License-Identifier: BSD-3-Clause

//! `qdl`: Qualcomm Sahara/Firehose and MediaTek BROM/DA emergency download
//! protocols, GPT-aware partition bookkeeping, and the authentication
//! strategies devices demand before they'll accept an unsigned loader.
//!
//! Every protocol driver is generic over [`types::QdlChan`] (a byte
//! channel plus the negotiated Firehose configuration and a cooperative
//! cancellation flag), so the same code path drives a real USB/serial
//! session or an in-memory loopback in tests.

pub mod auth;
pub mod codec;
pub mod errors;
pub mod firehose;
pub mod gpt;
pub mod mtk;
pub mod orchestrator;
pub mod parsers;
pub mod sahara;
pub mod sparse;
pub mod transport;
pub mod types;
pub mod vip;

pub use errors::{Error, Result};
pub use firehose::{
    FirehoseStatus, firehose_checksum_storage, firehose_configure, firehose_configure_with_retry, firehose_erase,
    firehose_get_default_sector_size, firehose_nop, firehose_patch, firehose_peek, firehose_program_storage,
    firehose_read, firehose_read_storage, firehose_reset, firehose_set_bootable, firehose_xml_setup,
};
pub use transport::setup_target_device;

// SPDX-License-Identifier: BSD-3-Clause

//! Pluggable challenge/response handlers, using RustCrypto-family crates
//! (`sha2`, `aes`, `rsa`) for the actual cryptography. Modeled as a tagged
//! capability set rather than a deep hierarchy.

pub mod mtk_sla;
pub mod oneplus;
pub mod oplus_vip;
pub mod xiaomi;

use crate::errors::AuthError;

/// External collaborator: looks up an opaque key/credential blob by a
/// vendor-specific identifier (`hw_code`, `proj_id`, ...). The core never
/// derives keys itself; this is the seam where a file-, resource-, or
/// network-backed lookup plugs in.
pub trait KeyProvider {
    fn key_for(&self, identifier: &str) -> Option<Vec<u8>>;
}

/// Restricted handle an `AuthStrategy` is given instead of the raw
/// transport, so a strategy can never re-enter Sahara/Firehose/BROM state
/// directly.
pub trait AuthChannel {
    fn send_xml(&mut self, tag: &str, args: &[(&str, &str)]) -> Result<(), AuthError>;
    fn read_response(&mut self) -> Result<indexmap::IndexMap<String, String>, AuthError>;
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), AuthError>;
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, AuthError>;
}

/// A policy object invoked at a protocol-defined phase (post-HELLO_RESP for
/// Sahara vendor challenges, post-configure for OPLUS VIP, post-hw-info for
/// MediaTek SLA/DAA). Single operation by design: avoid deep
/// hierarchies, a tagged-variant enum with per-variant data suffices for
/// dispatch at the call site.
pub trait AuthStrategy {
    fn authenticate(&mut self, channel: &mut dyn AuthChannel, challenge: &[u8]) -> Result<Vec<u8>, AuthError>;
}

// SPDX-License-Identifier: BSD-3-Clause

//! Slot (A/B) detection and GPT CRC-rewrite, kept as pure functions over
//! already-parsed GPT data so they're unit-testable without a device.
//! Actual GPT *reading* over a session goes through
//! `gptman::GPT::read_from` the same way `cli/src/util.rs` already does;
//! this module covers recomputing CRCs after a boundary-changing write
//! and picking the active A/B slot.

use crate::codec::crc32_ieee;
use crate::types::{PartitionEntry, SlotState};

const BOOT_SLOT_PRIORITY_BIT: u64 = 48;
const BOOT_SLOT_ACTIVE_BIT: u64 = 49;
const BOOT_SLOT_SUCCESSFUL_BIT: u64 = 50;

fn bit(attributes: u64, n: u64) -> bool {
    (attributes >> n) & 1 != 0
}

/// Derives the active A/B slot from a partition list's `boot_a`/`boot_b`
/// attribute bits. Case-insensitive name match; any other boot
/// slot naming convention (e.g. `_a`/`_b` suffixes on every partition) is
/// out of scope here: those are resolved per-partition by the caller via
/// `storage_slot`, not by this function.
pub fn detect_slot(partitions: &[PartitionEntry]) -> SlotState {
    let boot_a = partitions.iter().find(|p| p.matches_name("boot_a"));
    let boot_b = partitions.iter().find(|p| p.matches_name("boot_b"));

    match (boot_a, boot_b) {
        (None, None) => SlotState::NonExistent,
        (a, b) => {
            let a_active = a.is_some_and(|p| bit(p.attributes, BOOT_SLOT_ACTIVE_BIT));
            let b_active = b.is_some_and(|p| bit(p.attributes, BOOT_SLOT_ACTIVE_BIT));
            match (a_active, b_active) {
                (true, false) => SlotState::A,
                (false, true) => SlotState::B,
                _ => SlotState::Undefined,
            }
        }
    }
}

pub fn slot_priority(attributes: u64) -> bool {
    bit(attributes, BOOT_SLOT_PRIORITY_BIT)
}

pub fn slot_successful(attributes: u64) -> bool {
    bit(attributes, BOOT_SLOT_SUCCESSFUL_BIT)
}

/// One `<patch>` command's worth of a GPT CRC fixup: a byte offset within
/// the header or entry array, and the little-endian bytes to write there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptCrcPatch {
    pub byte_offset: u64,
    pub value: [u8; 4],
}

/// Recomputes `entry_array_crc32` (offset 0x58 of the 92-byte GPT header)
/// from the raw entry-array bytes, and `header_crc32` (offset 0x10) from the
/// header with that field zeroed, the standard UEFI GPT checksum chain.
/// Returns the two patches needed to write a self-consistent header back,
/// in the order they should be applied (entry array CRC first, since the
/// header CRC covers it only by reference, not content).
pub fn fix_gpt_header_crcs(mut header_bytes: [u8; 92], entry_array_bytes: &[u8]) -> (GptCrcPatch, GptCrcPatch) {
    let entry_array_crc = crc32_ieee(entry_array_bytes);
    header_bytes[0x58..0x5c].copy_from_slice(&entry_array_crc.to_le_bytes());

    header_bytes[0x10..0x14].copy_from_slice(&[0, 0, 0, 0]);
    let header_crc = crc32_ieee(&header_bytes);

    (
        GptCrcPatch { byte_offset: 0x58, value: entry_array_crc.to_le_bytes() },
        GptCrcPatch { byte_offset: 0x10, value: header_crc.to_le_bytes() },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, attributes: u64) -> PartitionEntry {
        PartitionEntry {
            name: name.to_string(),
            lun: 0,
            start_sector: 0,
            num_sectors: 1,
            guid_type: [0; 16],
            attributes,
        }
    }

    #[test]
    fn s4_slot_a_active() {
        let parts = vec![
            entry("xbl", 0),
            entry("aboot", 0),
            entry("boot_a", 1 << 49),
            entry("boot_b", 0),
        ];
        assert_eq!(detect_slot(&parts), SlotState::A);
    }

    #[test]
    fn no_boot_partitions_is_nonexistent() {
        let parts = vec![entry("xbl", 0)];
        assert_eq!(detect_slot(&parts), SlotState::NonExistent);
    }

    #[test]
    fn both_or_neither_active_is_undefined() {
        let parts = vec![entry("boot_a", 0), entry("boot_b", 0)];
        assert_eq!(detect_slot(&parts), SlotState::Undefined);

        let parts = vec![entry("boot_a", 1 << 49), entry("boot_b", 1 << 49)];
        assert_eq!(detect_slot(&parts), SlotState::Undefined);
    }

    #[test]
    fn header_crc_changes_when_entry_array_changes() {
        let header = [0u8; 92];
        let (entry_patch_a, header_patch_a) = fix_gpt_header_crcs(header, &[1, 2, 3]);
        let (entry_patch_b, header_patch_b) = fix_gpt_header_crcs(header, &[1, 2, 4]);
        assert_ne!(entry_patch_a.value, entry_patch_b.value);
        assert_ne!(header_patch_a.value, header_patch_b.value);
    }
}

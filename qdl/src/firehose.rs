// SPDX-License-Identifier: BSD-3-Clause

//! The Firehose XML command layer: command framing over
//! `Transport`, response parsing, chunked bulk read/write, GPT-adjacent
//! storage operations, and the sparse-aware `program` path.
//!
//! Every command is a single UTF-8 XML document wrapped as
//! `<?xml version="1.0" ?><data>...</data>`, written in one call; the
//! device answers with zero or more `<log>` lines followed by exactly one
//! `<response>`. The engine carries no session state beyond what's on
//! `FirehoseConfiguration`: sector_size, max_payload_size, and whether
//! configure succeeded.

use std::io::{Cursor, Read, Write};

use indexmap::IndexMap;

use crate::errors::{FirehoseError, NakError, TransportError};
use crate::parsers::firehose_parser_ack_nak;
use crate::sparse::{SparseData, SparseReader, is_sparse};
use crate::types::{FirehoseResetMode, FirehoseStorageType, QdlChan};

/// This module's own error type is `FirehoseError`, not the crate-wide
/// aggregate: every function here is one protocol layer, and callers
/// (the CLI's `anyhow`, the orchestrator's crate-wide `Error`) convert at
/// their own boundary rather than this layer doing it for them.
pub type Result<T> = std::result::Result<T, FirehoseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

const MAX_CONFIGURE_RETRIES: u32 = 3;

/// Builds one `<tag attr="val" .../>` command wrapped in the
/// `<?xml version="1.0" ?><data>...</data>` envelope. Kept
/// standalone (not tied to a channel) so `qviptblgen`/`vip::calc_hashes`
/// can hash the exact bytes a live session would send, without a device.
pub fn firehose_xml_setup(tag: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut elem = xmltree::Element::new(tag);
    for (k, v) in args {
        elem.attributes.insert((*k).to_string(), (*v).to_string());
    }
    let mut data = xmltree::Element::new("data");
    data.children.push(xmltree::XMLNode::Element(elem));

    let mut out = Vec::new();
    out.extend_from_slice(b"<?xml version=\"1.0\" ?>");
    data.write(&mut out)
        .map_err(|e| FirehoseError::Transport(TransportError::Io(std::io::Error::other(e.to_string()))))?;
    Ok(out)
}

fn write_command<T: QdlChan + Write>(channel: &mut T, tag: &str, args: &[(&str, &str)]) -> Result<()> {
    let packet = firehose_xml_setup(tag, args)?;
    if packet.len() > channel.fh_config().xml_buf_size.max(4096) {
        tracing::warn!("firehose: {tag} command ({} bytes) exceeds the negotiated XML buffer size", packet.len());
    }
    channel.write_all(&packet).map_err(TransportError::classify)?;
    Ok(())
}

/// Reads bytes until the document's closing `</data>` tag, without
/// assuming a length ahead of time (the device doesn't frame responses
/// with a byte count). Safe to call only between bulk transfers, never
/// during one: raw-mode bytes that happen to look like `<log>` are data,
/// not log lines, precisely because this function is never invoked until
/// the byte-count contract is satisfied.
fn read_document<T: Read>(channel: &mut T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = channel.read(&mut byte).map_err(TransportError::classify)?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() >= 7 && &buf[buf.len() - 7..] == b"</data>" {
            break;
        }
    }
    Ok(buf)
}

/// Reads one Firehose response document: every `<log>` child is emitted as
/// a tracing event, and the terminal `<response>` element's attributes are
/// handed to `parser`. Unknown tags are logged and ignored.
pub fn firehose_read<T, F>(channel: &mut T, parser: F) -> Result<FirehoseStatus>
where
    T: QdlChan + Read + Write,
    F: Fn(&mut T, &IndexMap<String, String>) -> std::result::Result<FirehoseStatus, FirehoseError>,
{
    let bytes = read_document(channel)?;
    let root = xmltree::Element::parse(&bytes[..]).map_err(FirehoseError::Xml)?;

    let mut result = None;
    for node in &root.children {
        let xmltree::XMLNode::Element(e) = node else { continue };
        match e.name.as_str() {
            "log" => {
                if let Some(v) = e.attributes.get("value") {
                    if channel.fh_config().skip_firehose_log {
                        tracing::debug!("firehose(log): {v}");
                    } else {
                        tracing::info!("firehose: {v}");
                    }
                }
            }
            "response" => {
                let attrs: IndexMap<String, String> = e.attributes.clone().into_iter().collect();
                result = Some(parser(channel, &attrs)?);
            }
            other => tracing::debug!("firehose: ignoring unknown tag <{other}>"),
        }
    }

    result.ok_or_else(|| FirehoseError::MalformedData(IndexMap::new()))
}

fn send_and_ack<T: QdlChan + Read + Write>(channel: &mut T, tag: &str, args: &[(&str, &str)], on_nak: NakError) -> Result<()> {
    write_command(channel, tag, args)?;
    let status = firehose_read(channel, firehose_parser_ack_nak)?;
    if status == FirehoseStatus::Nak {
        return Err(FirehoseError::Nak(on_nak, Vec::new()).into());
    }
    Ok(())
}

/// Sends the `<configure>` command only; pair with [`firehose_read`] and
/// [`crate::parsers::firehose_parser_configure_response`] to parse the
/// reply, exactly as `cli`'s `main.rs` does.
pub fn firehose_configure<T: QdlChan + Write>(channel: &mut T, skip_storage_init: bool) -> Result<()> {
    let cfg = channel.fh_config().clone();
    let memory_name = cfg.storage_type.to_string();
    let send_buffer_size = cfg.send_buffer_size.to_string();
    let verbose = if cfg.verbose_firehose { "1" } else { "0" };
    let skip_init = if skip_storage_init { "1" } else { "0" };

    let packet = firehose_xml_setup(
        "configure",
        &[
            ("MemoryName", memory_name.as_str()),
            ("MaxPayloadSizeToTargetInBytes", send_buffer_size.as_str()),
            ("ZLPAwareHost", "1"),
            ("SkipStorageInit", skip_init),
            ("SkipWrite", "0"),
            ("verbose", verbose),
        ],
    )?;
    channel.write_all(&packet).map_err(TransportError::classify)?;
    Ok(())
}

/// Runs `<configure>` to completion, retrying with a halved payload size
/// up to three times on NAK before giving up with `ConfigureRejected`.
/// A caller that wants to drive `firehose_configure`/`firehose_read` by
/// hand once (no retry) can still do so directly; this wrapper is for
/// library consumers (the orchestrator) that want the full retry
/// behavior in one call.
pub fn firehose_configure_with_retry<T: QdlChan + Read + Write>(channel: &mut T, skip_storage_init: bool) -> Result<FirehoseStatus> {
    for attempt in 0..MAX_CONFIGURE_RETRIES {
        firehose_configure(channel, skip_storage_init)?;
        let status = firehose_read(channel, crate::parsers::firehose_parser_configure_response)?;
        if status == FirehoseStatus::Ack {
            return Ok(status);
        }
        let halved = (channel.fh_config().send_buffer_size / 2).max(4096);
        tracing::warn!("firehose: configure NAK'd, retrying with a {halved} byte payload (attempt {})", attempt + 1);
        channel.mut_fh_config().send_buffer_size = halved;
    }
    Err(FirehoseError::ConfigureRejected(MAX_CONFIGURE_RETRIES).into())
}

/// `<power value="reset|reset_to_edl|off">`. The engine doesn't wait for a
/// further response: the device either acks briefly or simply disappears,
/// and blocking a read past that point risks hanging the session.
pub fn firehose_reset<T: QdlChan + Write>(channel: &mut T, mode: &FirehoseResetMode, delay_seconds: u32) -> Result<()> {
    let delay = delay_seconds.to_string();
    write_command(channel, "power", &[("value", mode.xml_value()), ("DelayInSeconds", delay.as_str())])
}

pub fn firehose_nop<T: QdlChan + Read + Write>(channel: &mut T) -> Result<()> {
    send_and_ack(channel, "nop", &[], NakError::Other)
}

/// Debug memory peek. Results surface as `<log>` lines, which
/// [`firehose_read`] already emits via `tracing`; this just drives the
/// command and surfaces a NAK as an error.
pub fn firehose_peek<T: QdlChan + Read + Write>(channel: &mut T, base: u64, len: u64) -> Result<()> {
    let base_str = format!("{base:#x}");
    let len_str = len.to_string();
    send_and_ack(channel, "peek", &[("address64", base_str.as_str()), ("SizeInBytes", len_str.as_str())], NakError::Other)
}

pub fn firehose_set_bootable<T: QdlChan + Read + Write>(channel: &mut T, idx: u8) -> Result<()> {
    let idx_str = idx.to_string();
    send_and_ack(channel, "setbootablestoragedrive", &[("value", idx_str.as_str())], NakError::SetBootableStorageDrive)
}

/// UFS/eMMC/NVMe use 512-byte LBAs; NAND's sector size can't be guessed
/// from the storage kind alone.
pub fn firehose_get_default_sector_size(storage_type: &str) -> Option<usize> {
    storage_type.parse::<FirehoseStorageType>().ok()?.default_sector_size()
}

/// `<erase …>`: ACK-only, no payload, used on whole partitions.
pub fn firehose_erase<T: QdlChan + Read + Write>(channel: &mut T, label: &str, phys_part_idx: u8, start_sector: &str, num_sectors: usize) -> Result<()> {
    if channel.fh_config().bypass_storage {
        tracing::debug!("firehose: bypass_storage set, skipping erase of {label}");
        return Ok(());
    }
    let sector_size = channel.fh_config().storage_sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let phys_str = phys_part_idx.to_string();
    send_and_ack(
        channel,
        "erase",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size.as_str()),
            ("num_partition_sectors", num_sectors_str.as_str()),
            ("physical_partition_number", phys_str.as_str()),
            ("start_sector", start_sector),
            ("label", label),
        ],
        NakError::Erase,
    )
}

/// `<patch byte_offset size_in_bytes filename physical_partition_number
/// start_sector value>`. The engine never computes the patch itself (see
/// [`crate::gpt::fix_gpt_header_crcs`] for the pure function that derives
/// the values); it only applies a caller-supplied one.
#[allow(clippy::too_many_arguments)]
pub fn firehose_patch<T: QdlChan + Read + Write>(
    channel: &mut T,
    byte_offset: u64,
    slot: u8,
    phys_part_idx: u8,
    size_in_bytes: u64,
    start_sector: &str,
    value: &str,
) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size.to_string();
    let byte_offset_str = byte_offset.to_string();
    let size_str = size_in_bytes.to_string();
    let phys_str = phys_part_idx.to_string();
    let slot_str = slot.to_string();
    send_and_ack(
        channel,
        "patch",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size.as_str()),
            ("byte_offset", byte_offset_str.as_str()),
            ("size_in_bytes", size_str.as_str()),
            ("physical_partition_number", phys_str.as_str()),
            ("slot", slot_str.as_str()),
            ("start_sector", start_sector),
            ("value", value),
            ("filename", "DISK"),
        ],
        NakError::Patch,
    )
}

/// `<getsha256digest …>`: asks the device to hash a sector range and
/// return the digest as a `<log>` line (surfaced by [`firehose_read`]
/// exactly as any other log text).
pub fn firehose_checksum_storage<T: QdlChan + Read + Write>(channel: &mut T, num_sectors: usize, phys_part_idx: u8, start_sector: u32) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let phys_str = phys_part_idx.to_string();
    let start_str = start_sector.to_string();
    send_and_ack(
        channel,
        "getsha256digest",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size.as_str()),
            ("num_partition_sectors", num_sectors_str.as_str()),
            ("physical_partition_number", phys_str.as_str()),
            ("start_sector", start_str.as_str()),
        ],
        NakError::Other,
    )
}

/// `<read …>`: after the initial ACK the host reads exactly
/// `num_partition_sectors * sector_size` bytes, then a terminal response.
/// A NAK on the terminal response discards the bytes already read
/// rather than surfacing them as a partial success.
pub fn firehose_read_storage<T: QdlChan + Read + Write>(
    channel: &mut T,
    out: &mut impl Write,
    num_sectors: usize,
    slot: u8,
    phys_part_idx: u8,
    start_sector: u32,
) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size;
    let total = num_sectors * sector_size;

    let sector_size_str = sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let phys_str = phys_part_idx.to_string();
    let slot_str = slot.to_string();
    let start_str = start_sector.to_string();

    write_command(
        channel,
        "read",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
            ("num_partition_sectors", num_sectors_str.as_str()),
            ("physical_partition_number", phys_str.as_str()),
            ("slot", slot_str.as_str()),
            ("start_sector", start_str.as_str()),
        ],
    )?;

    let status = firehose_read(channel, firehose_parser_ack_nak)?;
    if status == FirehoseStatus::Nak {
        return Err(FirehoseError::Nak(NakError::Read, Vec::new()).into());
    }

    if channel.fh_config().bypass_storage {
        tracing::debug!("firehose: bypass_storage set, not draining {total} bytes of read payload");
    } else {
        let chunk_size = channel.fh_config().send_buffer_size.max(sector_size).max(1);
        let mut remaining = total;
        let mut buf = vec![0u8; chunk_size.min(total.max(1))];
        while remaining > 0 {
            let this_chunk = remaining.min(buf.len());
            channel.read_exact(&mut buf[..this_chunk]).map_err(TransportError::classify)?;
            out.write_all(&buf[..this_chunk]).map_err(TransportError::classify)?;
            remaining -= this_chunk;
        }
    }

    let final_status = firehose_read(channel, firehose_parser_ack_nak)?;
    if final_status == FirehoseStatus::Nak {
        return Err(FirehoseError::ReadRejected.into());
    }
    Ok(())
}

/// Reads bytes from `inner`, and once it runs dry, serves zeroes forever.
/// This is what lets a one-byte all-zero source "erase" a whole partition
/// through `program` without a dedicated zero-fill code path: every
/// short read past the real content is padded rather than failing.
struct ZeroPadRead<'a, R: Read> {
    inner: &'a mut R,
    exhausted: bool,
}

impl<'a, R: Read> ZeroPadRead<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        ZeroPadRead { inner, exhausted: false }
    }
}

impl<'a, R: Read> Read for ZeroPadRead<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.exhausted {
            buf.fill(0);
            return Ok(buf.len());
        }
        let n = self.inner.read(buf)?;
        if n < buf.len() {
            buf[n..].fill(0);
            self.exhausted = true;
        }
        Ok(buf.len())
    }
}

fn stream_payload<T: QdlChan + Write>(channel: &mut T, src: &mut impl Read, total: usize, mut tee: Option<&mut Vec<u8>>) -> Result<()> {
    if total == 0 {
        return Ok(());
    }
    let chunk_size = channel.fh_config().send_buffer_size.max(1).min(total);
    let mut remaining = total;
    let mut buf = vec![0u8; chunk_size];
    while remaining > 0 {
        let this_chunk = remaining.min(buf.len());
        src.read_exact(&mut buf[..this_chunk]).map_err(TransportError::classify)?;
        channel.write_all(&buf[..this_chunk]).map_err(TransportError::classify)?;
        if let Some(t) = tee.as_deref_mut() {
            t.extend_from_slice(&buf[..this_chunk]);
        }
        remaining -= this_chunk;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn send_program_command<T: QdlChan + Write>(
    channel: &mut T,
    label: &str,
    sector_size: usize,
    num_sectors: usize,
    slot: u8,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<()> {
    let sector_size_str = sector_size.to_string();
    let num_sectors_str = num_sectors.to_string();
    let phys_str = phys_part_idx.to_string();
    let slot_str = slot.to_string();
    write_command(
        channel,
        "program",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size_str.as_str()),
            ("num_partition_sectors", num_sectors_str.as_str()),
            ("physical_partition_number", phys_str.as_str()),
            ("slot", slot_str.as_str()),
            ("start_sector", start_sector),
            ("label", label),
            ("filename", label),
        ],
    )
}

#[allow(clippy::too_many_arguments)]
fn program_flat<T: QdlChan + Read + Write>(
    channel: &mut T,
    mut src: impl Read,
    label: &str,
    num_sectors: usize,
    slot: u8,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size;
    let total = num_sectors * sector_size;

    if channel.fh_config().bypass_storage {
        tracing::debug!("firehose: bypass_storage set, skipping {total} byte program of {label}");
        return Ok(());
    }

    send_program_command(channel, label, sector_size, num_sectors, slot, phys_part_idx, start_sector)?;
    let status = firehose_read(channel, firehose_parser_ack_nak)?;
    if status == FirehoseStatus::Nak {
        return Err(FirehoseError::Nak(NakError::Program, Vec::new()).into());
    }

    let read_back_verify = channel.fh_config().read_back_verify;
    let mut tee = read_back_verify.then(Vec::new);
    let mut padded = ZeroPadRead::new(&mut src);
    stream_payload(channel, &mut padded, total, tee.as_mut())?;

    let final_status = firehose_read(channel, firehose_parser_ack_nak)?;
    if final_status == FirehoseStatus::Nak {
        return Err(FirehoseError::Nak(NakError::Program, Vec::new()).into());
    }

    if let Some(written) = tee {
        let start: u32 = start_sector.parse().unwrap_or(0);
        let mut readback = Vec::with_capacity(written.len());
        firehose_read_storage(channel, &mut readback, num_sectors, slot, phys_part_idx, start)?;
        let expected = crate::codec::crc32_ieee(&written);
        let got = crate::codec::crc32_ieee(&readback);
        if expected != got {
            return Err(FirehoseError::ChecksumMismatch { expected, got }.into());
        }
    }

    Ok(())
}

/// Walks a fully-buffered Android sparse image and emits one
/// `program` per non-`DONT_CARE` chunk, converting the sparse header's
/// block counts to storage sectors via `block_size / sector_size`. A
/// `DONT_CARE` gap simply advances the running `start_sector` for the next
/// emitted command instead of writing anything.
fn program_sparse<T: QdlChan + Read + Write>(channel: &mut T, image: &[u8], label: &str, slot: u8, phys_part_idx: u8, base_start_sector: &str) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size as u64;
    let base: u64 = base_start_sector.parse().unwrap_or(0);

    let reader = SparseReader::new(image)?;
    let block_size = reader.header().block_size as u64;
    let sectors_per_block = (block_size / sector_size.max(1)).max(1);

    for chunk in reader {
        let chunk = chunk?;
        let start_sector = base + chunk.start_sector * sectors_per_block;
        let num_sectors = (chunk.sector_count * sectors_per_block) as usize;
        let start_str = start_sector.to_string();

        match chunk.data {
            SparseData::Raw(bytes) => {
                program_flat(channel, Cursor::new(bytes), label, num_sectors, slot, phys_part_idx, &start_str)?;
            }
            SparseData::Fill(pattern) => {
                let byte_count = num_sectors * sector_size as usize;
                let filled: Vec<u8> = pattern.iter().copied().cycle().take(byte_count).collect();
                program_flat(channel, Cursor::new(filled), label, num_sectors, slot, phys_part_idx, &start_str)?;
            }
            SparseData::DontCare => {
                tracing::debug!("firehose: skipping {num_sectors} DONT_CARE sectors at {start_sector}");
            }
        }
    }
    Ok(())
}

/// `<program …>`: streams `num_partition_sectors * sector_size` bytes to
/// the device after the command ACK. Sparse sources (Android sparse
/// magic at the start of `src`) are expanded on the fly per chunk instead
/// of materializing the whole image; `num_sectors` is then derived from
/// the sparse header rather than trusted from the caller, since one sparse
/// source can fan out into several `program` commands with different
/// sector counts each.
pub fn firehose_program_storage<T: QdlChan + Read + Write>(
    channel: &mut T,
    src: &mut impl Read,
    label: &str,
    num_sectors: usize,
    slot: u8,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<()> {
    let mut probe = [0u8; 4];
    let n = src.read(&mut probe).map_err(TransportError::classify)?;

    if n == 4 && is_sparse(&probe) {
        let mut rest = Vec::new();
        src.read_to_end(&mut rest).map_err(TransportError::classify)?;
        let mut image = probe.to_vec();
        image.append(&mut rest);
        return program_sparse(channel, &image, label, slot, phys_part_idx, start_sector);
    }

    let chained = Cursor::new(probe[..n].to_vec()).chain(src);
    program_flat(channel, chained, label, num_sectors, slot, phys_part_idx, start_sector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    struct Loopback {
        inbound: IoCursor<Vec<u8>>,
        outbound: Vec<u8>,
    }
    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }
    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn xml_setup_wraps_single_element() {
        let packet = firehose_xml_setup("configure", &[("MemoryName", "ufs")]).unwrap();
        let text = String::from_utf8(packet).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\" ?>"));
        assert!(text.contains("<configure"));
        assert!(text.contains("MemoryName=\"ufs\""));
        assert!(text.ends_with("</data>"));
    }

    #[test]
    fn configure_response_parses_reconfigured_payload() {
        let mut lb = Loopback { inbound: IoCursor::new(Vec::new()), outbound: Vec::new() };
        lb.inbound = IoCursor::new(
            br#"<?xml version="1.0" ?><data><response value="ACK" MaxPayloadSizeToTargetInBytes="524288" MaxPayloadSizeToTargetInBytesSupported="524288" MaxXMLSizeInBytes="4096" Version="1" MinVersionSupported="1"/></data>"#
                .to_vec(),
        );
        let mut dev = crate::types::QdlDevice {
            rw: lb,
            fh_cfg: crate::types::FirehoseConfiguration::default(),
            reset_on_drop: false,
            cancel: crate::types::CancelToken::new(),
        };
        let status = firehose_read(&mut dev, crate::parsers::firehose_parser_configure_response).unwrap();
        assert_eq!(status, FirehoseStatus::Ack);
        assert_eq!(dev.fh_cfg.send_buffer_size, 524288);
    }

    #[test]
    fn zero_pad_read_fills_past_eof() {
        let mut src: &[u8] = &[0xAA];
        let mut padded = ZeroPadRead::new(&mut src);
        let mut buf = [0xFFu8; 8];
        padded.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0, 0, 0, 0, 0, 0, 0]);
    }
}

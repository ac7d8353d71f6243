// SPDX-License-Identifier: BSD-3-Clause

//! Single-device-serialized job queue. A CLI driving the Firehose
//! functions directly and sequentially from `main` works for a one-shot
//! invocation; this module instead wraps the same functions in a
//! `submit`/`Ticket` API with a dedicated worker thread so a caller (a
//! GUI, a batch-flashing script) can cancel a running job from another
//! thread without the protocol layer itself knowing anything about
//! threads.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use gptman::GPT;

use crate::errors::{Error, PartitionError, Result, StateError};
use crate::firehose::{firehose_erase, firehose_patch, firehose_program_storage, firehose_read_storage, firehose_set_bootable};
use crate::gpt::{detect_slot, fix_gpt_header_crcs};
use crate::types::{CancelToken, PartitionEntry, QdlChan, QdlDevice, QdlReadWrite, SlotState};

/// Default sensitive-partition deny-list. A `Vec<String>` field rather
/// than a `const`, since a caller running against an unfamiliar device
/// layout needs to extend or shrink it.
pub fn default_sensitive_partitions() -> Vec<String> {
    ["gpt*", "modem*", "sbl*", "xbl*", "aboot*", "devcfg*", "qcn", "fsc", "fsg", "modemst1", "modemst2", "persist"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name = name.to_ascii_lowercase();
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(&prefix.to_ascii_lowercase()),
        None => name == pattern.to_ascii_lowercase(),
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Physical partitions (UFS LUNs, or `[0]` for eMMC/NVMe) scanned when
    /// resolving a [`PartitionSelector::Name`] and when re-reading the GPT
    /// for [`Job::FixGpt`].
    pub phys_partitions: Vec<u8>,
    pub sensitive_partitions: Vec<String>,
    pub protect_sensitive: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig { phys_partitions: vec![0], sensitive_partitions: default_sensitive_partitions(), protect_sensitive: true }
    }
}

impl OrchestratorConfig {
    fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive_partitions.iter().any(|p| matches_pattern(name, p))
    }
}

/// Either a literal region or a name resolved against the last GPT read:
/// case-insensitive, first match scanning LUNs in
/// `OrchestratorConfig::phys_partitions` order.
#[derive(Debug, Clone)]
pub enum PartitionSelector {
    Literal { phys_part_idx: u8, start_sector: u64, num_sectors: u64 },
    Name(String),
}

fn resolve_selector(selector: &PartitionSelector, gpt: &[PartitionEntry]) -> Result<(u8, u64, u64, String)> {
    match selector {
        PartitionSelector::Literal { phys_part_idx, start_sector, num_sectors } => Ok((*phys_part_idx, *start_sector, *num_sectors, String::new())),
        PartitionSelector::Name(name) => gpt
            .iter()
            .find(|p| p.matches_name(name))
            .map(|p| (p.lun, p.start_sector, p.num_sectors, p.name.clone()))
            .ok_or_else(|| PartitionError::NotFound(name.clone()).into()),
    }
}

/// One `<patch>` to apply after a batch write, in the caller's own terms
/// rather than the GPT-fixup-specific [`crate::gpt::GptCrcPatch`].
#[derive(Debug, Clone)]
pub struct PatchSpec {
    pub byte_offset: u64,
    pub phys_part_idx: u8,
    pub size_in_bytes: u64,
    pub start_sector: String,
    pub value: String,
}

pub struct BatchEntry {
    pub selector: PartitionSelector,
    pub source: Box<dyn Read + Send>,
    pub num_sectors: usize,
    pub label: String,
}

pub enum Job {
    ReadPartition { selector: PartitionSelector, out: Box<dyn Write + Send> },
    ErasePartition { selector: PartitionSelector },
    BatchWrite { entries: Vec<BatchEntry>, patches: Vec<PatchSpec>, fix_gpt: bool, set_bootable: bool },
    RefreshGpt,
    Nop,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
}

pub type ProgressCallback = Box<dyn FnMut(Progress) + Send>;

#[derive(Debug)]
pub enum JobResult {
    Read,
    Erase,
    BatchWrite { slot_after: SlotState },
    Gpt(Vec<PartitionEntry>),
    Nop,
}

struct CountingReader<R> {
    inner: R,
    completed_before: u64,
    total: u64,
    progress: Option<Arc<std::sync::Mutex<ProgressCallback>>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(cb) = &self.progress {
            if let Ok(mut cb) = cb.lock() {
                cb(Progress { completed_bytes: self.completed_before + n as u64, total_bytes: self.total });
            }
        }
        Ok(n)
    }
}

struct JobEnvelope {
    job: Job,
    progress: Option<ProgressCallback>,
    result_tx: mpsc::Sender<Result<JobResult>>,
}

/// A handle to a submitted job's eventual result. The method is `wait`
/// rather than `await` since the latter is a reserved keyword in Rust.
pub struct Ticket {
    result_rx: mpsc::Receiver<Result<JobResult>>,
}

impl Ticket {
    pub fn wait(self) -> Result<JobResult> {
        self.result_rx.recv().unwrap_or(Err(StateError::Cancelled.into()))
    }
}

/// Owns the session's single [`CancelToken`] and a worker thread driving
/// one `QdlDevice` at a time. `submit` fails with `Busy` rather than
/// queueing when a job is already running.
pub struct Orchestrator {
    job_tx: mpsc::Sender<JobEnvelope>,
    cancel: CancelToken,
    busy: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new<RW: QdlReadWrite + Send + 'static>(device: QdlDevice<RW>, config: OrchestratorConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<JobEnvelope>();
        let cancel = device.cancel.clone();
        let busy = Arc::new(AtomicBool::new(false));
        let busy_worker = Arc::clone(&busy);

        let worker = std::thread::spawn(move || {
            let mut device = device;
            let mut last_gpt: Vec<PartitionEntry> = Vec::new();
            for envelope in job_rx {
                let result = run_job(&mut device, &config, &mut last_gpt, envelope.job, envelope.progress);
                busy_worker.store(false, Ordering::SeqCst);
                let _ = envelope.result_tx.send(result);
            }
        });

        Orchestrator { job_tx, cancel, busy, worker: Some(worker) }
    }

    /// Submits `job`, failing immediately with `StateError::Busy` if a
    /// previous ticket hasn't been waited on yet. `progress`, when given,
    /// is invoked from the worker thread on every chunk of every
    /// `BatchWrite` entry.
    pub fn submit(&self, job: Job, progress: Option<ProgressCallback>) -> Result<Ticket> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(StateError::Busy.into());
        }
        let (result_tx, result_rx) = mpsc::channel();
        self.job_tx.send(JobEnvelope { job, progress, result_tx }).map_err(|_| {
            self.busy.store(false, Ordering::SeqCst);
            StateError::Cancelled
        })?;
        Ok(Ticket { result_rx })
    }

    /// Cooperative cancellation: the in-flight Transport call returns
    /// `Cancelled` at its next suspension point, the worker abandons the
    /// job, and the next `submit` is free to run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            drop(self.job_tx.clone());
            let _ = handle.join();
        }
    }
}

fn read_gpt<RW: QdlReadWrite>(channel: &mut QdlDevice<RW>, phys_part_idx: u8) -> Result<Vec<PartitionEntry>> {
    let mut buf = std::io::Cursor::new(Vec::<u8>::new());
    firehose_read_storage(channel, &mut buf, 1, channel.fh_config().storage_slot, phys_part_idx, 1)?;
    buf.set_position(0);
    let header = gptman::GPTHeader::read_from(&mut buf).map_err(|e| PartitionError::Gpt(e.to_string()))?;
    let gpt_len = header.first_usable_lba as usize;

    buf.set_position(0);
    buf.get_mut().clear();
    firehose_read_storage(channel, &mut buf, gpt_len, channel.fh_config().storage_slot, phys_part_idx, 0)?;
    buf.set_position(channel.fh_config().storage_sector_size as u64);
    let sector_size = channel.fh_config().storage_sector_size as u64;
    let gpt = GPT::read_from(&mut buf, sector_size).map_err(|e| PartitionError::Gpt(e.to_string()))?;

    Ok(gpt
        .iter()
        .filter(|(_, p)| !p.partition_name.as_str().is_empty())
        .map(|(_, p)| PartitionEntry {
            name: p.partition_name.as_str().to_string(),
            lun: phys_part_idx,
            start_sector: p.starting_lba,
            num_sectors: p.ending_lba.saturating_sub(p.starting_lba) + 1,
            guid_type: p.partition_type_guid,
            attributes: p.attribute_bits,
        })
        .collect())
}

fn refresh_gpt<RW: QdlReadWrite>(channel: &mut QdlDevice<RW>, config: &OrchestratorConfig) -> Result<Vec<PartitionEntry>> {
    let mut all = Vec::new();
    for &phys in &config.phys_partitions {
        all.extend(read_gpt(channel, phys)?);
    }
    Ok(all)
}

fn run_job<RW: QdlReadWrite>(
    channel: &mut QdlDevice<RW>,
    config: &OrchestratorConfig,
    last_gpt: &mut Vec<PartitionEntry>,
    job: Job,
    progress: Option<ProgressCallback>,
) -> Result<JobResult> {
    match job {
        Job::Nop => {
            crate::firehose::firehose_nop(channel)?;
            Ok(JobResult::Nop)
        }
        Job::RefreshGpt => {
            *last_gpt = refresh_gpt(channel, config)?;
            Ok(JobResult::Gpt(last_gpt.clone()))
        }
        Job::ReadPartition { selector, mut out } => {
            let (phys_part_idx, start_sector, num_sectors, _name) = resolve_selector(&selector, last_gpt)?;
            firehose_read_storage(channel, &mut out, num_sectors as usize, channel.fh_config().storage_slot, phys_part_idx, start_sector as u32)?;
            Ok(JobResult::Read)
        }
        Job::ErasePartition { selector } => {
            let (phys_part_idx, start_sector, num_sectors, name) = resolve_selector(&selector, last_gpt)?;
            if config.protect_sensitive && config.is_sensitive(&name) {
                tracing::warn!("orchestrator: refusing to erase protected partition {name:?}");
                return Err(PartitionError::Protected(name).into());
            }
            firehose_erase(channel, &name, phys_part_idx, &start_sector.to_string(), num_sectors as usize)?;
            Ok(JobResult::Erase)
        }
        Job::BatchWrite { entries, patches, fix_gpt, set_bootable } => {
            run_batch_write(channel, config, last_gpt, entries, patches, fix_gpt, set_bootable, progress)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_batch_write<RW: QdlReadWrite>(
    channel: &mut QdlDevice<RW>,
    config: &OrchestratorConfig,
    last_gpt: &mut Vec<PartitionEntry>,
    entries: Vec<BatchEntry>,
    patches: Vec<PatchSpec>,
    fix_gpt: bool,
    set_bootable: bool,
    progress: Option<ProgressCallback>,
) -> Result<JobResult> {
    if last_gpt.is_empty() {
        *last_gpt = refresh_gpt(channel, config)?;
    }

    let sector_size = channel.fh_config().storage_sector_size as u64;
    let total_bytes: u64 = entries.iter().map(|e| e.num_sectors as u64 * sector_size).sum();
    let progress = progress.map(|cb| Arc::new(std::sync::Mutex::new(cb)));

    let mut completed_bytes = 0u64;
    for entry in entries {
        let (phys_part_idx, start_sector, resolved_num_sectors, name) = resolve_selector(&entry.selector, last_gpt)?;
        if config.protect_sensitive && config.is_sensitive(&name) {
            tracing::warn!("orchestrator: skipping write to protected partition {name:?}");
            completed_bytes += entry.num_sectors as u64 * sector_size;
            continue;
        }

        let num_sectors = if matches!(entry.selector, PartitionSelector::Name(_)) { resolved_num_sectors as usize } else { entry.num_sectors };
        let entry_bytes = num_sectors as u64 * sector_size;
        let slot = channel.fh_config().storage_slot;

        let mut counted = CountingReader { inner: entry.source, completed_before: completed_bytes, total: total_bytes, progress: progress.clone() };
        firehose_program_storage(channel, &mut counted, &entry.label, num_sectors, slot, phys_part_idx, &start_sector.to_string())?;

        completed_bytes += entry_bytes;
    }

    let slot = channel.fh_config().storage_slot;
    for patch in &patches {
        firehose_patch(channel, patch.byte_offset, slot, patch.phys_part_idx, patch.size_in_bytes, &patch.start_sector, &patch.value)?;
    }

    if fix_gpt {
        apply_fix_gpt(channel, config, last_gpt)?;
    }

    let slot_after = detect_slot(last_gpt);

    if set_bootable {
        let lun = match slot_after {
            SlotState::A => 1,
            SlotState::B => 2,
            SlotState::Undefined | SlotState::NonExistent => 1,
        };
        firehose_set_bootable(channel, lun)?;
    }

    Ok(JobResult::BatchWrite { slot_after })
}

/// Re-reads the GPT of every physical partition, recomputes the header
/// and entry-array CRCs, and patches them back.
fn apply_fix_gpt<RW: QdlReadWrite>(channel: &mut QdlDevice<RW>, config: &OrchestratorConfig, last_gpt: &mut Vec<PartitionEntry>) -> Result<()> {
    let sector_size = channel.fh_config().storage_sector_size as u64;

    for &phys_part_idx in &config.phys_partitions {
        let mut buf = std::io::Cursor::new(Vec::<u8>::new());
        let slot = channel.fh_config().storage_slot;
        firehose_read_storage(channel, &mut buf, 1, slot, phys_part_idx, 1)?;
        buf.set_position(0);
        let header = gptman::GPTHeader::read_from(&mut buf).map_err(|e| PartitionError::Gpt(e.to_string()))?;
        let gpt_len = header.first_usable_lba as usize;

        buf.set_position(0);
        buf.get_mut().clear();
        firehose_read_storage(channel, &mut buf, gpt_len, slot, phys_part_idx, 0)?;

        let bytes = buf.into_inner();
        let header_start = sector_size as usize;
        let header_bytes: [u8; 92] = bytes[header_start..header_start + 92].try_into().map_err(|_| PartitionError::Gpt("truncated GPT header".into()))?;
        let entry_array_start = 2 * sector_size as usize;
        let entry_array_bytes = &bytes[entry_array_start..];

        let (entry_patch, header_patch) = fix_gpt_header_crcs(header_bytes, entry_array_bytes);
        let entry_patch_value = format!("0x{:08x}", u32::from_le_bytes(entry_patch.value));
        let header_patch_value = format!("0x{:08x}", u32::from_le_bytes(header_patch.value));

        firehose_patch(channel, entry_patch.byte_offset, slot, phys_part_idx, 4, "1", &entry_patch_value)?;
        firehose_patch(channel, header_patch.byte_offset, slot, phys_part_idx, 4, "1", &header_patch_value)?;
    }

    *last_gpt = refresh_gpt(channel, config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_matches_prefix_wildcards() {
        let config = OrchestratorConfig::default();
        assert!(config.is_sensitive("modemst1"));
        assert!(config.is_sensitive("xbl_a"));
        assert!(config.is_sensitive("PERSIST"));
        assert!(!config.is_sensitive("userdata"));
    }

    #[test]
    fn literal_selector_bypasses_gpt() {
        let gpt = Vec::new();
        let selector = PartitionSelector::Literal { phys_part_idx: 3, start_sector: 2048, num_sectors: 16 };
        let (phys, start, n, _) = resolve_selector(&selector, &gpt).unwrap();
        assert_eq!((phys, start, n), (3, 2048, 16));
    }

    #[test]
    fn unresolved_name_fails_with_not_found() {
        let gpt = Vec::new();
        let selector = PartitionSelector::Name("boot_a".to_string());
        let err = resolve_selector(&selector, &gpt).unwrap_err();
        assert!(matches!(err, Error::Partition(PartitionError::NotFound(_))));
    }
}

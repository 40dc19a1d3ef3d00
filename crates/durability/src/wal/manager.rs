//! The WAL manager.
//!
//! Lifecycle contract (enforced by the storage controller):
//!
//! - `new()` only instantiates: no threads, no file handles. Admin mode
//!   holds a constructed-but-not-started WAL manager.
//! - `start()` opens the active segment and, for `FlushPerSecond`, spawns
//!   the background sync thread. It must be called strictly after the
//!   transaction manager is started.
//! - `stop()` is idempotent, drains nothing (appends are synchronous), and
//!   is safe to call even if `start()` never ran. Stop does not reset the
//!   append counters or segment numbering; a manager that must look
//!   freshly constructed is reconstructed instead.
//! - `replay()` is synchronous and read-only; it may be called before
//!   `start()`.

use crate::checkpoint::{
    delta_checkpoint_filename, full_checkpoint_filename, write_checkpoint_file,
    DeltaCheckpointInfo, FullCheckpointInfo, CHECKPOINT_DIR_NAME,
};
use crate::wal::record::{
    parse_segment_filename, segment_filename, SegmentHeader, WalCmd, WalRecord,
    SEGMENT_HEADER_SIZE,
};
use keel_core::{FlushMethod, KeelError, KeelResult, StorageMode, TxnTimeStamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed engine id stamped into segment headers.
const ENGINE_ID: [u8; 16] = [0u8; 16];

/// Snapshot of WAL activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalCounters {
    pub records_appended: u64,
    pub bytes_appended: u64,
    pub syncs: u64,
    pub segments_created: u64,
    pub segments_deleted: u64,
    pub checkpoints_full: u64,
    pub checkpoints_delta: u64,
}

/// Outcome of a synchronous WAL replay.
///
/// The replayed catalog state is returned to the caller rather than being
/// installed through a back-reference: the controller loads the checkpoint
/// files, applies `records`, and owns the resulting catalog handle.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// Highest commit timestamp observed; 0 iff no prior state exists.
    pub system_start_ts: TxnTimeStamp,
    /// Newest full checkpoint anchored in the log, if any.
    pub full_checkpoint: Option<FullCheckpointInfo>,
    /// Delta checkpoints newer than the full one, in timestamp order.
    pub delta_checkpoints: Vec<DeltaCheckpointInfo>,
    /// Committed records newer than the newest checkpoint, in commit order.
    pub records: Vec<WalRecord>,
}

impl ReplayResult {
    fn empty() -> Self {
        ReplayResult {
            system_start_ts: 0,
            full_checkpoint: None,
            delta_checkpoints: Vec::new(),
            records: Vec::new(),
        }
    }
}

struct WalInner {
    segment: Option<File>,
    segment_number: u64,
    segment_size: u64,
    bytes_since_delta_ckp: u64,
    last_checkpoint_ts: TxnTimeStamp,
    counters: WalCounters,
}

/// Append-only log manager with threshold-driven compaction.
pub struct WalManager {
    wal_dir: PathBuf,
    data_dir: PathBuf,
    compact_threshold: u64,
    delta_ckp_threshold: u64,
    flush_method: FlushMethod,
    running: AtomicBool,
    inner: Arc<Mutex<WalInner>>,
    flush_shutdown: Arc<AtomicBool>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WalManager {
    /// Instantiate without touching the filesystem.
    pub fn new(
        wal_dir: PathBuf,
        data_dir: PathBuf,
        compact_threshold: u64,
        delta_ckp_threshold: u64,
        flush_method: FlushMethod,
    ) -> Self {
        WalManager {
            wal_dir,
            data_dir,
            compact_threshold,
            delta_ckp_threshold,
            flush_method,
            running: AtomicBool::new(false),
            inner: Arc::new(Mutex::new(WalInner {
                segment: None,
                segment_number: 0,
                segment_size: 0,
                bytes_since_delta_ckp: 0,
                last_checkpoint_ts: 0,
                counters: WalCounters::default(),
            })),
            flush_shutdown: Arc::new(AtomicBool::new(false)),
            flush_handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open the active segment and begin accepting appends.
    pub fn start(&self) -> KeelResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.wal_dir)?;

        {
            let mut inner = self.inner.lock();
            let latest = Self::list_segments(&self.wal_dir)?.pop();
            match latest {
                Some(num) => {
                    let path = self.wal_dir.join(segment_filename(num));
                    let file = OpenOptions::new().append(true).open(&path)?;
                    inner.segment_size = file.metadata()?.len();
                    inner.segment = Some(file);
                    inner.segment_number = num;
                }
                None => {
                    Self::create_segment(&self.wal_dir, 1, &mut inner)?;
                }
            }
        }

        if self.flush_method == FlushMethod::FlushPerSecond {
            self.flush_shutdown.store(false, Ordering::Release);
            let inner = Arc::clone(&self.inner);
            let shutdown = Arc::clone(&self.flush_shutdown);
            let handle = std::thread::Builder::new()
                .name("keel-wal-flush".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(100));
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let mut guard = inner.lock();
                        if let Some(file) = guard.segment.as_ref() {
                            if file.sync_data().is_ok() {
                                guard.counters.syncs += 1;
                            }
                        }
                    }
                })
                .map_err(|e| {
                    KeelError::internal(format!("failed to spawn WAL flush thread: {}", e))
                })?;
            *self.flush_handle.lock() = Some(handle);
        }

        info!(target: "keel::wal", dir = %self.wal_dir.display(), "WAL manager started");
        Ok(())
    }

    /// Stop accepting appends and sync the active segment.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.flush_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.flush_handle.lock().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        if let Some(file) = inner.segment.take() {
            let _ = file.sync_data();
        }
        info!(target: "keel::wal", "WAL manager stopped");
    }

    /// Append one committed transaction's record.
    pub fn append(&self, record: &WalRecord) -> KeelResult<()> {
        if !self.is_running() {
            return Err(KeelError::invalid_operation(
                "WAL append on a manager that is not started",
            ));
        }
        let bytes = record.encode()?;
        let mut inner = self.inner.lock();
        let file = inner
            .segment
            .as_mut()
            .ok_or_else(|| KeelError::internal("WAL running without an active segment"))?;
        file.write_all(&bytes)?;
        if self.flush_method == FlushMethod::FlushAtOnce {
            file.sync_data()?;
            inner.counters.syncs += 1;
        }
        inner.segment_size += bytes.len() as u64;
        inner.bytes_since_delta_ckp += bytes.len() as u64;
        inner.counters.records_appended += 1;
        inner.counters.bytes_appended += bytes.len() as u64;

        if inner.segment_size > self.compact_threshold {
            let next = inner.segment_number + 1;
            if let Some(old) = inner.segment.take() {
                let _ = old.sync_data();
            }
            Self::create_segment(&self.wal_dir, next, &mut inner)?;
        }
        Ok(())
    }

    /// Synchronously scan the log and gather everything needed to rebuild
    /// the catalog.
    ///
    /// Returns `system_start_ts == 0` iff the log holds no prior state.
    pub fn replay(&self, target_mode: StorageMode) -> KeelResult<ReplayResult> {
        if !self.wal_dir.exists() {
            info!(target: "keel::wal", mode = %target_mode, "no WAL directory, starting fresh");
            return Ok(ReplayResult::empty());
        }

        let mut all_records = Vec::new();
        for number in Self::list_segments(&self.wal_dir)? {
            let path = self.wal_dir.join(segment_filename(number));
            let bytes = std::fs::read(&path)?;
            let header = SegmentHeader::from_bytes(&bytes)?;
            if header.segment_number != number {
                return Err(KeelError::corruption(format!(
                    "segment file {} carries number {}",
                    path.display(),
                    header.segment_number
                )));
            }
            let mut offset = SEGMENT_HEADER_SIZE;
            while let Some((record, next)) = WalRecord::decode(&bytes, offset)? {
                all_records.push(record);
                offset = next;
            }
            if offset < bytes.len() {
                warn!(
                    target: "keel::wal",
                    segment = number,
                    offset,
                    "truncated record at segment tail, stopping replay of this segment"
                );
            }
        }

        if all_records.is_empty() {
            info!(target: "keel::wal", mode = %target_mode, "empty WAL, starting fresh");
            return Ok(ReplayResult::empty());
        }

        // Locate the newest full checkpoint anchor, then the deltas above it.
        let mut full_checkpoint: Option<FullCheckpointInfo> = None;
        for record in &all_records {
            for cmd in &record.cmds {
                if let WalCmd::Checkpoint {
                    is_full: true,
                    max_commit_ts,
                    catalog_path,
                } = cmd
                {
                    full_checkpoint = Some(FullCheckpointInfo {
                        path: PathBuf::from(catalog_path),
                        max_commit_ts: *max_commit_ts,
                    });
                }
            }
        }
        let full_ts = full_checkpoint.as_ref().map_or(0, |c| c.max_commit_ts);

        let mut delta_checkpoints = Vec::new();
        for record in &all_records {
            for cmd in &record.cmds {
                if let WalCmd::Checkpoint {
                    is_full: false,
                    max_commit_ts,
                    catalog_path,
                } = cmd
                {
                    if *max_commit_ts > full_ts {
                        delta_checkpoints.push(DeltaCheckpointInfo {
                            path: PathBuf::from(catalog_path),
                            max_commit_ts: *max_commit_ts,
                        });
                    }
                }
            }
        }
        delta_checkpoints.sort_by_key(|d| d.max_commit_ts);
        let covered_ts = delta_checkpoints
            .last()
            .map_or(full_ts, |d| d.max_commit_ts);

        let records: Vec<WalRecord> = all_records
            .iter()
            .filter(|r| r.commit_ts > covered_ts && !r.cmds.iter().all(WalCmd::is_checkpoint))
            .cloned()
            .collect();

        let system_start_ts = all_records
            .iter()
            .map(|r| r.commit_ts)
            .max()
            .unwrap_or(0)
            .max(covered_ts);

        info!(
            target: "keel::wal",
            mode = %target_mode,
            system_start_ts,
            records = records.len(),
            deltas = delta_checkpoints.len(),
            has_full = full_checkpoint.is_some(),
            "WAL replay complete"
        );

        Ok(ReplayResult {
            system_start_ts,
            full_checkpoint,
            delta_checkpoints,
            records,
        })
    }

    /// Write a full checkpoint: snapshot file, fresh segment, anchor record,
    /// then delete the sealed segments the snapshot covers.
    pub fn full_checkpoint(
        &self,
        max_commit_ts: TxnTimeStamp,
        snapshot: &[u8],
    ) -> KeelResult<FullCheckpointInfo> {
        let path = self
            .data_dir
            .join(CHECKPOINT_DIR_NAME)
            .join(full_checkpoint_filename(max_commit_ts));
        write_checkpoint_file(&path, true, max_commit_ts, snapshot)?;

        {
            let mut inner = self.inner.lock();
            // Seal the current segment and start a fresh one so the anchor
            // record survives the compaction below.
            let next = inner.segment_number + 1;
            if let Some(old) = inner.segment.take() {
                old.sync_data()?;
            }
            Self::create_segment(&self.wal_dir, next, &mut inner)?;

            let anchor = WalRecord::new(
                0,
                max_commit_ts,
                vec![WalCmd::Checkpoint {
                    is_full: true,
                    max_commit_ts,
                    catalog_path: path.display().to_string(),
                }],
            );
            let bytes = anchor.encode()?;
            let file = inner
                .segment
                .as_mut()
                .ok_or_else(|| KeelError::internal("segment vanished during checkpoint"))?;
            file.write_all(&bytes)?;
            file.sync_data()?;
            inner.counters.syncs += 1;
            inner.segment_size += bytes.len() as u64;
            inner.counters.records_appended += 1;
            inner.counters.bytes_appended += bytes.len() as u64;
            inner.last_checkpoint_ts = max_commit_ts;
            inner.bytes_since_delta_ckp = 0;
            inner.counters.checkpoints_full += 1;

            let current = inner.segment_number;
            for number in Self::list_segments(&self.wal_dir)? {
                if number < current {
                    std::fs::remove_file(self.wal_dir.join(segment_filename(number)))?;
                    inner.counters.segments_deleted += 1;
                }
            }
        }

        info!(target: "keel::wal", max_commit_ts, path = %path.display(), "full checkpoint written");
        Ok(FullCheckpointInfo {
            path,
            max_commit_ts,
        })
    }

    /// True once enough WAL bytes accumulated since the last checkpoint to
    /// justify cutting a delta. Callers check this before draining the
    /// catalog's pending delta operations.
    pub fn delta_checkpoint_due(&self) -> bool {
        self.inner.lock().bytes_since_delta_ckp >= self.delta_ckp_threshold
    }

    /// Write a delta checkpoint unconditionally.
    pub fn delta_checkpoint(
        &self,
        max_commit_ts: TxnTimeStamp,
        delta: &[u8],
    ) -> KeelResult<DeltaCheckpointInfo> {
        let path = self
            .data_dir
            .join(CHECKPOINT_DIR_NAME)
            .join(delta_checkpoint_filename(max_commit_ts));
        write_checkpoint_file(&path, false, max_commit_ts, delta)?;

        let anchor = WalRecord::new(
            0,
            max_commit_ts,
            vec![WalCmd::Checkpoint {
                is_full: false,
                max_commit_ts,
                catalog_path: path.display().to_string(),
            }],
        );
        self.append(&anchor)?;

        let mut inner = self.inner.lock();
        inner.last_checkpoint_ts = max_commit_ts;
        inner.bytes_since_delta_ckp = 0;
        inner.counters.checkpoints_delta += 1;
        drop(inner);

        info!(target: "keel::wal", max_commit_ts, path = %path.display(), "delta checkpoint written");
        Ok(DeltaCheckpointInfo {
            path,
            max_commit_ts,
        })
    }

    /// Timestamp of the newest checkpoint written through this manager.
    pub fn last_checkpoint_ts(&self) -> TxnTimeStamp {
        self.inner.lock().last_checkpoint_ts
    }

    /// Current activity counters snapshot.
    pub fn counters(&self) -> WalCounters {
        self.inner.lock().counters
    }

    fn create_segment(wal_dir: &PathBuf, number: u64, inner: &mut WalInner) -> KeelResult<()> {
        let path = wal_dir.join(segment_filename(number));
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        file.write_all(&SegmentHeader::new(number, ENGINE_ID).to_bytes())?;
        file.sync_data()?;
        inner.segment = Some(file);
        inner.segment_number = number;
        inner.segment_size = SEGMENT_HEADER_SIZE as u64;
        inner.counters.segments_created += 1;
        Ok(())
    }

    /// Sorted segment numbers present in the WAL directory.
    fn list_segments(wal_dir: &PathBuf) -> KeelResult<Vec<u64>> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(wal_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(number) = parse_segment_filename(name) {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Periodic trigger thread.
//!
//! Recurring engine work (checkpoints, segment compaction, index
//! optimization, cleanup) is scheduled by one ticking thread that fires
//! each installed trigger at its configured cadence. An interval of 0
//! means the trigger is installed but disabled; the clamping of negative
//! operator values to 0 already happened at the config boundary.
//!
//! The thread sleeps in short slices so `stop()` returns promptly.

use crate::background::{BgTask, BgTaskProcessor};
use crate::compaction::CompactionProcessor;
use keel_catalog::Catalog;
use keel_concurrency::TxnManager;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// A recurring task with a cadence in seconds.
pub trait PeriodicTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cadence in seconds; 0 disables the trigger.
    fn interval_secs(&self) -> u64;

    /// Enqueue one round of the trigger's work.
    fn fire(&self);
}

/// Submits full or delta checkpoint tasks to the background processor.
pub struct CheckpointTrigger {
    interval_secs: u64,
    is_full: bool,
    bg: Arc<BgTaskProcessor>,
}

impl CheckpointTrigger {
    pub fn new(interval_secs: u64, is_full: bool, bg: Arc<BgTaskProcessor>) -> Self {
        CheckpointTrigger {
            interval_secs,
            is_full,
            bg,
        }
    }
}

impl PeriodicTrigger for CheckpointTrigger {
    fn name(&self) -> &'static str {
        if self.is_full {
            "full_checkpoint"
        } else {
            "delta_checkpoint"
        }
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    fn fire(&self) {
        if let Err(e) = self.bg.submit(BgTask::Checkpoint {
            is_full: self.is_full,
            force: false,
        }) {
            warn!(target: "keel::periodic", trigger = self.name(), error = %e, "submit failed");
        }
    }
}

/// Pokes the compaction processor to scan for mergeable segments.
pub struct CompactSegmentTrigger {
    interval_secs: u64,
    compact: Arc<CompactionProcessor>,
}

impl CompactSegmentTrigger {
    pub fn new(interval_secs: u64, compact: Arc<CompactionProcessor>) -> Self {
        CompactSegmentTrigger {
            interval_secs,
            compact,
        }
    }
}

impl PeriodicTrigger for CompactSegmentTrigger {
    fn name(&self) -> &'static str {
        "compact_segment"
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    fn fire(&self) {
        self.compact.trigger_compact();
    }
}

/// Pokes the compaction processor to optimize table indexes.
pub struct OptimizeIndexTrigger {
    interval_secs: u64,
    compact: Arc<CompactionProcessor>,
}

impl OptimizeIndexTrigger {
    pub fn new(interval_secs: u64, compact: Arc<CompactionProcessor>) -> Self {
        OptimizeIndexTrigger {
            interval_secs,
            compact,
        }
    }
}

impl PeriodicTrigger for OptimizeIndexTrigger {
    fn name(&self) -> &'static str {
        "optimize_index"
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    fn fire(&self) {
        self.compact.trigger_optimize();
    }
}

/// Submits cleanup tasks when deprecated segments are pending.
pub struct CleanupTrigger {
    interval_secs: u64,
    bg: Arc<BgTaskProcessor>,
    catalog: Arc<Catalog>,
    txn_mgr: Arc<TxnManager>,
}

impl CleanupTrigger {
    pub fn new(
        interval_secs: u64,
        bg: Arc<BgTaskProcessor>,
        catalog: Arc<Catalog>,
        txn_mgr: Arc<TxnManager>,
    ) -> Self {
        CleanupTrigger {
            interval_secs,
            bg,
            catalog,
            txn_mgr,
        }
    }
}

impl PeriodicTrigger for CleanupTrigger {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    fn fire(&self) {
        if self.catalog.deprecated_segment_count() == 0 {
            return;
        }
        // Nothing newer than the oldest active transaction may be removed.
        let visible_ts = self
            .txn_mgr
            .first_active_begin_ts()
            .unwrap_or_else(|| self.txn_mgr.last_ts());
        if let Err(e) = self.bg.submit(BgTask::Cleanup { visible_ts }) {
            warn!(target: "keel::periodic", trigger = self.name(), error = %e, "submit failed");
        }
    }
}

/// Ticking scheduler thread over a fixed trigger set.
pub struct PeriodicTriggerThread {
    triggers: Vec<Arc<dyn PeriodicTrigger>>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

const TICK: Duration = Duration::from_millis(100);

impl PeriodicTriggerThread {
    pub fn new(triggers: Vec<Arc<dyn PeriodicTrigger>>) -> Self {
        PeriodicTriggerThread {
            triggers,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn trigger_names(&self) -> Vec<&'static str> {
        self.triggers.iter().map(|t| t.name()).collect()
    }

    pub fn has_trigger(&self, name: &str) -> bool {
        self.triggers.iter().any(|t| t.name() == name)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(false, Ordering::Release);

        let triggers = self.triggers.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = std::thread::Builder::new()
            .name("keel-periodic".to_string())
            .spawn(move || {
                let mut last_fired: Vec<Instant> = triggers.iter().map(|_| Instant::now()).collect();
                while !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(TICK);
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    for (i, trigger) in triggers.iter().enumerate() {
                        let interval = trigger.interval_secs();
                        if interval == 0 {
                            continue; // disabled
                        }
                        if last_fired[i].elapsed() >= Duration::from_secs(interval) {
                            trigger.fire();
                            last_fired[i] = Instant::now();
                        }
                    }
                }
            })
            .expect("failed to spawn periodic trigger thread");
        *self.handle.lock() = Some(handle);
        info!(
            target: "keel::periodic",
            triggers = ?self.trigger_names(),
            "periodic trigger thread started"
        );
    }

    /// Idempotent; safe without a prior `start()`.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!(target: "keel::periodic", "periodic trigger thread stopped");
    }
}

impl Drop for PeriodicTriggerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Per-transition cleanup bookkeeping.

use keel_catalog::CleanupStats;
use keel_core::TxnTimeStamp;
use parking_lot::Mutex;

/// Snapshot of cleanup activity recorded by the tracer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupInfo {
    pub runs: u64,
    pub segments_removed: u64,
    pub last_visible_ts: TxnTimeStamp,
}

/// Records what cleanup work happened since the last mode transition.
///
/// A fresh tracer is created at the start of every transition, so the
/// numbers always describe the current mode's lifetime.
#[derive(Default)]
pub struct CleanupTracer {
    info: Mutex<CleanupInfo>,
}

impl CleanupTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stats: CleanupStats, visible_ts: TxnTimeStamp) {
        let mut info = self.info.lock();
        info.runs += 1;
        info.segments_removed += stats.segments_removed;
        info.last_visible_ts = visible_ts;
    }

    pub fn info(&self) -> CleanupInfo {
        *self.info.lock()
    }
}

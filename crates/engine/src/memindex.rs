//! Memory-index tracer.
//!
//! Tracks how much memory the in-memory indexes consume against the
//! configured quota. When usage crosses the quota, a dump transaction
//! spills index state and releases accounting back below the high-water
//! mark. A quota of 0 means unlimited.

use keel_catalog::Catalog;
use keel_concurrency::TxnManager;
use keel_core::KeelResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct MemIndexTracer {
    quota: u64,
    catalog: Arc<Catalog>,
    txn_mgr: Arc<TxnManager>,
    dumps: AtomicU64,
}

impl MemIndexTracer {
    pub fn new(quota: u64, catalog: Arc<Catalog>, txn_mgr: Arc<TxnManager>) -> Self {
        MemIndexTracer {
            quota,
            catalog,
            txn_mgr,
            dumps: AtomicU64::new(0),
        }
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Account bytes added to an in-memory index.
    pub fn record(&self, bytes: u64) {
        self.catalog.record_mem_index(bytes);
    }

    pub fn usage(&self) -> u64 {
        self.catalog.mem_index_usage()
    }

    pub fn over_quota(&self) -> bool {
        self.quota > 0 && self.usage() > self.quota
    }

    /// Spill index state if the quota is exceeded. Returns whether a dump
    /// ran.
    pub fn try_dump(&self) -> KeelResult<bool> {
        if !self.over_quota() {
            return Ok(false);
        }
        let usage = self.usage();
        // Dump down to half the quota so back-to-back inserts don't
        // immediately re-trigger.
        let release = usage.saturating_sub(self.quota / 2);

        let txn = self.txn_mgr.begin_txn("dump memory index")?;
        self.catalog.release_mem_index(release);
        self.txn_mgr.commit_txn(txn, &self.catalog)?;

        self.dumps.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "keel::memindex",
            released = release,
            usage_before = usage,
            quota = self.quota,
            "memory index dumped"
        );
        Ok(true)
    }

    pub fn dump_count(&self) -> u64 {
        self.dumps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FlushMethod;
    use keel_durability::WalManager;
    use keel_storage::BufferManager;
    use tempfile::TempDir;

    fn tracer(root: &std::path::Path, quota: u64) -> MemIndexTracer {
        let buffer = Arc::new(BufferManager::new(
            1 << 20,
            root.join("data"),
            root.join("tmp"),
            None,
            2,
        ));
        buffer.start().unwrap();
        let wal = Arc::new(WalManager::new(
            root.join("wal"),
            root.join("data"),
            1 << 20,
            1 << 20,
            FlushMethod::OnlyWrite,
        ));
        wal.start().unwrap();
        let catalog = Arc::new(Catalog::new());
        let txn_mgr = Arc::new(TxnManager::new(buffer, wal, 0));
        txn_mgr.start();
        MemIndexTracer::new(quota, catalog, txn_mgr)
    }

    #[test]
    fn zero_quota_is_unlimited() {
        let dir = TempDir::new().unwrap();
        let tracer = tracer(dir.path(), 0);
        tracer.record(u64::MAX / 2);
        assert!(!tracer.over_quota());
        assert!(!tracer.try_dump().unwrap());
    }

    #[test]
    fn dump_fires_over_quota() {
        let dir = TempDir::new().unwrap();
        let tracer = tracer(dir.path(), 1000);
        tracer.record(600);
        assert!(!tracer.over_quota());
        assert!(!tracer.try_dump().unwrap());

        tracer.record(600);
        assert!(tracer.over_quota());
        assert!(tracer.try_dump().unwrap());
        assert_eq!(tracer.dump_count(), 1);
        assert_eq!(tracer.usage(), 500); // down to half the quota
        assert!(!tracer.over_quota());
    }
}

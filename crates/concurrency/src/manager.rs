//! The transaction manager.
//!
//! Owns the global timestamp allocator and the active-transaction table.
//! The commit protocol is WAL-first: a transaction's commands are appended
//! to the log as one record, and only then applied to the catalog. A crash
//! between the two leaves the log authoritative; replay re-applies the
//! record on next bring-up.
//!
//! Timestamps are monotonic from the system start timestamp handed over by
//! WAL replay, so a restarted engine never re-issues a timestamp that was
//! already committed.

use crate::txn::Txn;
use dashmap::DashMap;
use keel_catalog::Catalog;
use keel_core::{KeelError, KeelResult, TxnId, TxnTimeStamp};
use keel_durability::{WalManager, WalRecord};
use keel_storage::BufferManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Transaction activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnStats {
    pub active: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

/// Timestamp allocator and active-transaction table.
pub struct TxnManager {
    buffer: Arc<BufferManager>,
    wal: Arc<WalManager>,
    /// Latest allocated timestamp. Begin and commit both draw from it.
    ts: AtomicU64,
    next_txn_id: AtomicU64,
    active: DashMap<TxnId, TxnTimeStamp>,
    running: AtomicBool,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl TxnManager {
    pub fn new(
        buffer: Arc<BufferManager>,
        wal: Arc<WalManager>,
        system_start_ts: TxnTimeStamp,
    ) -> Self {
        TxnManager {
            buffer,
            wal,
            ts: AtomicU64::new(system_start_ts),
            next_txn_id: AtomicU64::new(0),
            active: DashMap::new(),
            running: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            target: "keel::txn",
            start_ts = self.ts.load(Ordering::Acquire),
            "transaction manager started"
        );
    }

    /// Stop accepting transactions and wait for in-flight ones to finish.
    ///
    /// Idempotent; safe without a prior `start()`.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.active.is_empty() {
            if Instant::now() > deadline {
                warn!(
                    target: "keel::txn",
                    active = self.active.len(),
                    "transactions still active at stop deadline"
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        info!(target: "keel::txn", "transaction manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Allocate the next timestamp.
    ///
    /// # Panics
    ///
    /// Panics on counter overflow (`u64::MAX`).
    fn allocate_ts(&self) -> TxnTimeStamp {
        self.ts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_add(1))
            .expect("timestamp counter overflow: u64::MAX reached")
            + 1
    }

    /// Begin a transaction with a human-readable description.
    pub fn begin_txn(&self, text: impl Into<String>) -> KeelResult<Txn> {
        if !self.is_running() {
            return Err(KeelError::transaction(
                "begin_txn on a manager that is not started",
            ));
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let begin_ts = self.allocate_ts();
        self.active.insert(id, begin_ts);
        Ok(Txn::new(id, begin_ts, text.into()))
    }

    /// Commit: append one WAL record, then apply the commands to the
    /// catalog at the commit timestamp.
    ///
    /// Transactions with no commands commit without touching the log.
    pub fn commit_txn(&self, mut txn: Txn, catalog: &Catalog) -> KeelResult<TxnTimeStamp> {
        let commit_ts = self.allocate_ts();
        let cmds = txn.take_cmds();

        if !cmds.is_empty() {
            let record = WalRecord::new(txn.id(), commit_ts, cmds.clone());
            self.wal.append(&record)?;
            for cmd in &cmds {
                catalog.apply_cmd(cmd, commit_ts)?;
            }
        }

        self.active.remove(&txn.id());
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(commit_ts)
    }

    /// Abandon a transaction. Nothing was durable, so this only clears the
    /// active entry.
    pub fn rollback_txn(&self, txn: Txn) {
        self.active.remove(&txn.id());
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Latest allocated timestamp.
    pub fn last_ts(&self) -> TxnTimeStamp {
        self.ts.load(Ordering::SeqCst)
    }

    /// Begin timestamp of the oldest active transaction, if any. Used as a
    /// checkpoint watermark.
    pub fn first_active_begin_ts(&self) -> Option<TxnTimeStamp> {
        self.active.iter().map(|e| *e.value()).min()
    }

    pub fn active_txn_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            active: self.active.len() as u64,
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }

    /// The buffer manager this transaction manager reads through.
    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FlushMethod;
    use keel_durability::WalCmd;
    use tempfile::TempDir;

    fn setup(root: &std::path::Path, start_ts: TxnTimeStamp) -> (TxnManager, Arc<Catalog>) {
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
        let txn_mgr = TxnManager::new(buffer, wal, start_ts);
        txn_mgr.start();
        (txn_mgr, Arc::new(Catalog::new()))
    }

    #[test]
    fn begin_requires_start() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, _) = setup(dir.path(), 0);
        txn_mgr.stop();
        assert!(txn_mgr.begin_txn("too late").is_err());
    }

    #[test]
    fn timestamps_continue_from_start_ts() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, catalog) = setup(dir.path(), 100);

        let txn = txn_mgr.begin_txn("t").unwrap();
        assert_eq!(txn.begin_ts(), 101);
        let commit_ts = txn_mgr.commit_txn(txn, &catalog).unwrap();
        assert_eq!(commit_ts, 102);
        assert_eq!(txn_mgr.last_ts(), 102);
    }

    #[test]
    fn commit_applies_to_catalog_and_wal() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, catalog) = setup(dir.path(), 0);

        let mut txn = txn_mgr.begin_txn("create db").unwrap();
        txn.add_cmd(WalCmd::CreateDatabase {
            name: "default_db".into(),
            comment: "Initial startup created".into(),
        });
        let commit_ts = txn_mgr.commit_txn(txn, &catalog).unwrap();

        assert!(catalog.has_database("default_db"));
        assert_eq!(catalog.last_applied_ts(), commit_ts);
        assert_eq!(txn_mgr.wal.counters().records_appended, 1);
        assert_eq!(txn_mgr.active_txn_count(), 0);
    }

    #[test]
    fn empty_commit_skips_wal() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, catalog) = setup(dir.path(), 0);

        let txn = txn_mgr.begin_txn("noop").unwrap();
        txn_mgr.commit_txn(txn, &catalog).unwrap();
        assert_eq!(txn_mgr.wal.counters().records_appended, 0);
    }

    #[test]
    fn rollback_clears_active_entry() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, _catalog) = setup(dir.path(), 0);

        let txn = txn_mgr.begin_txn("doomed").unwrap();
        assert_eq!(txn_mgr.active_txn_count(), 1);
        txn_mgr.rollback_txn(txn);
        assert_eq!(txn_mgr.active_txn_count(), 0);
        assert_eq!(txn_mgr.stats().rolled_back, 1);
    }

    #[test]
    fn first_active_begin_ts_is_minimum() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, catalog) = setup(dir.path(), 0);

        assert!(txn_mgr.first_active_begin_ts().is_none());
        let t1 = txn_mgr.begin_txn("a").unwrap();
        let t2 = txn_mgr.begin_txn("b").unwrap();
        assert_eq!(txn_mgr.first_active_begin_ts(), Some(t1.begin_ts()));
        txn_mgr.commit_txn(t1, &catalog).unwrap();
        assert_eq!(txn_mgr.first_active_begin_ts(), Some(t2.begin_ts()));
        txn_mgr.rollback_txn(t2);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (txn_mgr, _) = setup(dir.path(), 0);
        txn_mgr.stop();
        txn_mgr.stop();
        assert!(!txn_mgr.is_running());
    }

    #[test]
    fn concurrent_timestamps_are_unique() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let dir = TempDir::new().unwrap();
        let (txn_mgr, catalog) = setup(dir.path(), 0);
        let txn_mgr = Arc::new(txn_mgr);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mgr = Arc::clone(&txn_mgr);
                let catalog = Arc::clone(&catalog);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    let mut local = Vec::new();
                    for _ in 0..100 {
                        let txn = mgr.begin_txn("w").unwrap();
                        local.push(txn.begin_ts());
                        let commit_ts = mgr.commit_txn(txn, &catalog).unwrap();
                        local.push(commit_ts);
                    }
                    seen.lock().unwrap().extend(local);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let all = seen.lock().unwrap();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len(), "duplicate timestamps allocated");
    }
}

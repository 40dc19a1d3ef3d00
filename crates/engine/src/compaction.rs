//! Compaction processor.
//!
//! A worker thread that merges same-layer segments picked by the catalog's
//! compaction algorithm and runs index-optimization passes. Each merge is
//! committed as a transaction so it is durable and replayable.
//!
//! Only constructed in Writable mode; Readable never compacts.

use keel_catalog::Catalog;
use keel_concurrency::TxnManager;
use keel_core::KeelResult;
use keel_durability::WalCmd;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompactCommand {
    Compact,
    OptimizeIndex,
}

/// Processor activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    pub compactions_applied: u64,
    pub optimize_runs: u64,
}

struct CompactInner {
    queue: Mutex<VecDeque<CompactCommand>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    compactions_applied: AtomicU64,
    optimize_runs: AtomicU64,
}

/// Segment-merge scheduler.
pub struct CompactionProcessor {
    catalog: Arc<Catalog>,
    txn_mgr: Arc<TxnManager>,
    inner: Arc<CompactInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CompactionProcessor {
    pub fn new(catalog: Arc<Catalog>, txn_mgr: Arc<TxnManager>) -> Self {
        CompactionProcessor {
            catalog,
            txn_mgr,
            inner: Arc::new(CompactInner {
                queue: Mutex::new(VecDeque::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                compactions_applied: AtomicU64::new(0),
                optimize_runs: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let catalog = Arc::clone(&self.catalog);
        let txn_mgr = Arc::clone(&self.txn_mgr);
        let handle = std::thread::Builder::new()
            .name("keel-compact".to_string())
            .spawn(move || worker_loop(&inner, &catalog, &txn_mgr))
            .expect("failed to spawn compaction worker");
        *self.worker.lock() = Some(handle);
        info!(target: "keel::compact", "compaction processor started");
    }

    /// Drain queued commands, then join the worker. Idempotent; safe
    /// without a prior `start()`.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!(target: "keel::compact", "compaction processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn enqueue(&self, command: CompactCommand) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.inner.queue.lock().push_back(command);
        self.inner.work_ready.notify_one();
    }

    /// Queue a segment-merge scan.
    pub fn trigger_compact(&self) {
        self.enqueue(CompactCommand::Compact);
    }

    /// Queue an index-optimization pass.
    pub fn trigger_optimize(&self) {
        self.enqueue(CompactCommand::OptimizeIndex);
    }

    /// Run one merge scan synchronously; returns the number of merges
    /// committed.
    pub fn run_compact_once(&self) -> KeelResult<u64> {
        run_compact(&self.catalog, &self.txn_mgr, &self.inner)
    }

    /// Run one optimization pass synchronously; returns the number of
    /// tables visited.
    pub fn run_optimize_once(&self) -> u64 {
        run_optimize(&self.catalog, &self.inner)
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            compactions_applied: self.inner.compactions_applied.load(Ordering::Relaxed),
            optimize_runs: self.inner.optimize_runs.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CompactionProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: &Arc<CompactInner>, catalog: &Arc<Catalog>, txn_mgr: &Arc<TxnManager>) {
    loop {
        let command = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(command) = queue.pop_front() {
                    break Some(command);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        let Some(command) = command else {
            return;
        };
        match command {
            CompactCommand::Compact => {
                if let Err(e) = run_compact(catalog, txn_mgr, inner) {
                    error!(target: "keel::compact", error = %e, "compaction pass failed");
                }
            }
            CompactCommand::OptimizeIndex => {
                run_optimize(catalog, inner);
            }
        }
    }
}

fn run_compact(
    catalog: &Arc<Catalog>,
    txn_mgr: &Arc<TxnManager>,
    inner: &Arc<CompactInner>,
) -> KeelResult<u64> {
    let mut merged = 0;
    for candidate in catalog.pick_compaction_candidates() {
        let row_count = catalog.begin_compaction(&candidate)?;
        let segment_id = catalog.allocate_segment_id(&candidate.db, &candidate.table)?;

        let mut txn = txn_mgr.begin_txn("compact segments")?;
        txn.add_cmd(WalCmd::CompactSegments {
            db: candidate.db.clone(),
            table: candidate.table.clone(),
            deprecated_segments: candidate.segment_ids.clone(),
            segment_id,
            row_count,
        });
        let commit_ts = txn_mgr.commit_txn(txn, catalog)?;

        inner.compactions_applied.fetch_add(1, Ordering::Relaxed);
        merged += 1;
        info!(
            target: "keel::compact",
            db = %candidate.db,
            table = %candidate.table,
            sources = candidate.segment_ids.len(),
            segment_id,
            row_count,
            commit_ts,
            "segments merged"
        );
    }
    Ok(merged)
}

fn run_optimize(catalog: &Arc<Catalog>, inner: &Arc<CompactInner>) -> u64 {
    let mut visited = 0;
    for db in catalog.database_names() {
        for table in catalog.table_names(&db) {
            let has_sealed = catalog
                .table(&db, &table)
                .map(|t| t.sealed_segments().count() > 0)
                .unwrap_or(false);
            if has_sealed {
                visited += 1;
            }
        }
    }
    inner.optimize_runs.fetch_add(1, Ordering::Relaxed);
    info!(target: "keel::compact", tables = visited, "index optimization pass");
    visited
}

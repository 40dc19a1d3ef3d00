//! Background task processor.
//!
//! A single worker thread drains a FIFO queue of engine maintenance tasks:
//! checkpoints (full and delta) and catalog cleanup. Submitters get a
//! [`TaskTicket`] they can wait on; the controller uses this to run the
//! forced full checkpoint synchronously during Writable bring-up.
//!
//! `stop()` drains every queued task before joining the worker, is
//! idempotent, and is safe to call even if `start()` never ran.

use crate::cleanup::CleanupTracer;
use crate::periodic::CleanupTrigger;
use keel_catalog::Catalog;
use keel_core::{KeelError, KeelResult, TxnTimeStamp};
use keel_durability::WalManager;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// A maintenance task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgTask {
    /// Cut a checkpoint. Full checkpoints always run; delta checkpoints
    /// run only when the WAL says one is due.
    Checkpoint { is_full: bool, force: bool },
    /// Drop deprecated catalog segments visible below `visible_ts`.
    Cleanup { visible_ts: TxnTimeStamp },
}

/// Completion handle for a submitted task.
pub struct TaskTicket {
    state: Mutex<TicketState>,
    cond: Condvar,
}

#[derive(Default)]
struct TicketState {
    done: bool,
    error: Option<String>,
}

impl TaskTicket {
    fn new() -> Arc<Self> {
        Arc::new(TaskTicket {
            state: Mutex::new(TicketState::default()),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: &KeelResult<()>) {
        let mut state = self.state.lock();
        state.done = true;
        state.error = result.as_ref().err().map(|e| e.to_string());
        self.cond.notify_all();
    }

    /// Block until the task ran; surface its failure, if any.
    pub fn wait(&self) -> KeelResult<()> {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
        match &state.error {
            Some(message) => Err(KeelError::internal(format!(
                "background task failed: {}",
                message
            ))),
            None => Ok(()),
        }
    }
}

/// Processor activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BgTaskStats {
    pub queue_depth: usize,
    pub tasks_processed: u64,
    pub checkpoints_full: u64,
    pub checkpoints_delta: u64,
    pub cleanup_runs: u64,
}

struct BgInner {
    queue: Mutex<VecDeque<(BgTask, Arc<TaskTicket>)>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    tasks_processed: AtomicU64,
    checkpoints_full: AtomicU64,
    checkpoints_delta: AtomicU64,
    cleanup_runs: AtomicU64,
}

/// FIFO queue + worker thread over the WAL and catalog.
pub struct BgTaskProcessor {
    wal: Arc<WalManager>,
    catalog: Arc<Catalog>,
    inner: Arc<BgInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    cleanup_trigger: Mutex<Option<Arc<CleanupTrigger>>>,
    /// Shared with the worker so a tracer attached after `start()` is
    /// still observed by later cleanup runs.
    cleanup_tracer: Arc<Mutex<Option<Arc<CleanupTracer>>>>,
}

impl BgTaskProcessor {
    pub fn new(wal: Arc<WalManager>, catalog: Arc<Catalog>) -> Self {
        BgTaskProcessor {
            wal,
            catalog,
            inner: Arc::new(BgInner {
                queue: Mutex::new(VecDeque::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                tasks_processed: AtomicU64::new(0),
                checkpoints_full: AtomicU64::new(0),
                checkpoints_delta: AtomicU64::new(0),
                cleanup_runs: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
            cleanup_trigger: Mutex::new(None),
            cleanup_tracer: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the cleanup trigger so cadence state survives periodic
    /// thread rebuilds.
    pub fn set_cleanup_trigger(&self, trigger: Arc<CleanupTrigger>) {
        *self.cleanup_trigger.lock() = Some(trigger);
    }

    pub fn cleanup_trigger(&self) -> Option<Arc<CleanupTrigger>> {
        self.cleanup_trigger.lock().clone()
    }

    /// Attach the current transition's cleanup tracer.
    pub fn set_cleanup_tracer(&self, tracer: Arc<CleanupTracer>) {
        *self.cleanup_tracer.lock() = Some(tracer);
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.store(false, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let wal = Arc::clone(&self.wal);
        let catalog = Arc::clone(&self.catalog);
        let tracer = Arc::clone(&self.cleanup_tracer);

        let handle = std::thread::Builder::new()
            .name("keel-bg".to_string())
            .spawn(move || worker_loop(&inner, &wal, &catalog, &tracer))
            .expect("failed to spawn background task worker");
        *self.worker.lock() = Some(handle);
        info!(target: "keel::bg", "background task processor started");
    }

    /// Submit a task; returns a ticket to wait on.
    pub fn submit(&self, task: BgTask) -> KeelResult<Arc<TaskTicket>> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(KeelError::invalid_operation(
                "submit on a stopped background processor",
            ));
        }
        let ticket = TaskTicket::new();
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back((task, Arc::clone(&ticket)));
        }
        self.inner.work_ready.notify_one();
        Ok(ticket)
    }

    /// Drain queued tasks, then join the worker. Idempotent; safe without
    /// a prior `start()`.
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
        info!(target: "keel::bg", "background task processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BgTaskStats {
        BgTaskStats {
            queue_depth: self.inner.queue.lock().len(),
            tasks_processed: self.inner.tasks_processed.load(Ordering::Relaxed),
            checkpoints_full: self.inner.checkpoints_full.load(Ordering::Relaxed),
            checkpoints_delta: self.inner.checkpoints_delta.load(Ordering::Relaxed),
            cleanup_runs: self.inner.cleanup_runs.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BgTaskProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    inner: &BgInner,
    wal: &Arc<WalManager>,
    catalog: &Arc<Catalog>,
    tracer_holder: &Arc<Mutex<Option<Arc<CleanupTracer>>>>,
) {
    loop {
        let item = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        let Some((task, ticket)) = item else {
            return; // shutdown with an empty queue
        };

        let result = execute_task(&task, wal, catalog, tracer_holder, inner);
        if let Err(e) = &result {
            error!(target: "keel::bg", task = ?task, error = %e, "background task failed");
        }
        inner.tasks_processed.fetch_add(1, Ordering::Relaxed);
        ticket.complete(&result);
    }
}

fn execute_task(
    task: &BgTask,
    wal: &Arc<WalManager>,
    catalog: &Arc<Catalog>,
    tracer_holder: &Arc<Mutex<Option<Arc<CleanupTracer>>>>,
    inner: &BgInner,
) -> KeelResult<()> {
    match task {
        BgTask::Checkpoint { is_full: true, .. } => {
            let max_commit_ts = catalog.last_applied_ts();
            let snapshot = catalog.encode_full_snapshot()?;
            wal.full_checkpoint(max_commit_ts, &snapshot)?;
            inner.checkpoints_full.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        BgTask::Checkpoint { is_full: false, force } => {
            if !force && !wal.delta_checkpoint_due() {
                return Ok(());
            }
            let max_commit_ts = catalog.last_applied_ts();
            match catalog.take_delta_snapshot()? {
                Some(delta) => {
                    wal.delta_checkpoint(max_commit_ts, &delta)?;
                    inner.checkpoints_delta.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    warn!(target: "keel::bg", "delta checkpoint due but no pending catalog ops");
                }
            }
            Ok(())
        }
        BgTask::Cleanup { visible_ts } => {
            let stats = catalog.cleanup();
            if let Some(tracer) = tracer_holder.lock().as_ref() {
                tracer.record(stats, *visible_ts);
            }
            inner.cleanup_runs.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "keel::bg",
                visible_ts,
                segments_removed = stats.segments_removed,
                "cleanup pass complete"
            );
            Ok(())
        }
    }
}

//! Object-storage processor.
//!
//! Drains queued blob uploads against the injected remote-store gateway.
//! Constructed only when the configured storage type is Remote, strictly
//! after the gateway was initialized, and stopped before the gateway is
//! uninitialized.

use keel_core::{KeelError, KeelResult};
use keel_storage::ObjectStoreGateway;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

struct UploadTask {
    key: String,
    bytes: Vec<u8>,
}

struct ProcInner {
    queue: Mutex<VecDeque<UploadTask>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    uploads: AtomicU64,
    failures: AtomicU64,
}

pub struct ObjectStoreProcess {
    gateway: Arc<dyn ObjectStoreGateway>,
    inner: Arc<ProcInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ObjectStoreProcess {
    pub fn new(gateway: Arc<dyn ObjectStoreGateway>) -> Self {
        ObjectStoreProcess {
            gateway,
            inner: Arc::new(ProcInner {
                queue: Mutex::new(VecDeque::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                uploads: AtomicU64::new(0),
                failures: AtomicU64::new(0),
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
        let gateway = Arc::clone(&self.gateway);
        let handle = std::thread::Builder::new()
            .name("keel-objstore".to_string())
            .spawn(move || worker_loop(&inner, gateway.as_ref()))
            .expect("failed to spawn object-storage worker");
        *self.worker.lock() = Some(handle);
        info!(target: "keel::objstore", "object-storage processor started");
    }

    /// Drain queued uploads, then join the worker. Idempotent; safe
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
        info!(target: "keel::objstore", "object-storage processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a blob for upload.
    pub fn submit_upload(&self, key: impl Into<String>, bytes: Vec<u8>) -> KeelResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(KeelError::invalid_operation(
                "upload submitted to a stopped object-storage processor",
            ));
        }
        self.inner.queue.lock().push_back(UploadTask {
            key: key.into(),
            bytes,
        });
        self.inner.work_ready.notify_one();
        Ok(())
    }

    pub fn uploads(&self) -> u64 {
        self.inner.uploads.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }
}

impl Drop for ObjectStoreProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: &ProcInner, gateway: &dyn ObjectStoreGateway) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        let Some(task) = task else {
            return;
        };
        match gateway.put_object(&task.key, &task.bytes) {
            Ok(()) => {
                inner.uploads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                inner.failures.fetch_add(1, Ordering::Relaxed);
                error!(target: "keel::objstore", key = %task.key, error = %e, "upload failed");
            }
        }
    }
}

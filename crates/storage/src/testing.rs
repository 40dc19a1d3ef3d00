//! Test doubles for storage collaborators.

use crate::object_store::ObjectStoreGateway;
use keel_core::{KeelError, KeelResult, RemoteStoreConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Gateway double that counts `init`/`uninit` calls and can be told to
/// fail the next `init`.
///
/// Used to verify the controller's at-most-once init and init/uninit
/// pairing guarantees.
#[derive(Default)]
pub struct CountingGateway {
    inited: AtomicBool,
    init_calls: AtomicU64,
    uninit_calls: AtomicU64,
    fail_next_init: AtomicBool,
    last_config: Mutex<Option<RemoteStoreConfig>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl CountingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `init` call fail with a remote-store error.
    pub fn fail_next_init(&self) {
        self.fail_next_init.store(true, Ordering::SeqCst);
    }

    pub fn init_calls(&self) -> u64 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn uninit_calls(&self) -> u64 {
        self.uninit_calls.load(Ordering::SeqCst)
    }

    /// The config passed to the most recent successful `init`.
    pub fn last_config(&self) -> Option<RemoteStoreConfig> {
        self.last_config.lock().clone()
    }
}

impl ObjectStoreGateway for CountingGateway {
    fn is_init(&self) -> bool {
        self.inited.load(Ordering::SeqCst)
    }

    fn init(&self, config: &RemoteStoreConfig) -> KeelResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_init.swap(false, Ordering::SeqCst) {
            return Err(KeelError::remote_store(format!(
                "injected failure connecting to '{}'",
                config.url
            )));
        }
        *self.last_config.lock() = Some(config.clone());
        self.inited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn uninit(&self) -> KeelResult<()> {
        self.uninit_calls.fetch_add(1, Ordering::SeqCst);
        self.inited.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn put_object(&self, key: &str, bytes: &[u8]) -> KeelResult<()> {
        if !self.is_init() {
            return Err(KeelError::remote_store("put_object before init"));
        }
        self.objects.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_object(&self, key: &str) -> KeelResult<Vec<u8>> {
        if !self.is_init() {
            return Err(KeelError::remote_store("get_object before init"));
        }
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| KeelError::remote_store(format!("no such object '{}'", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_pairing() {
        let gateway = CountingGateway::new();
        assert!(!gateway.is_init());

        let config = RemoteStoreConfig {
            url: "http://localhost:9000".into(),
            ..Default::default()
        };
        gateway.init(&config).unwrap();
        assert!(gateway.is_init());
        assert_eq!(gateway.init_calls(), 1);
        assert_eq!(gateway.last_config().unwrap().url, "http://localhost:9000");

        gateway.uninit().unwrap();
        assert!(!gateway.is_init());
        assert_eq!(gateway.uninit_calls(), 1);
    }

    #[test]
    fn injected_failure_leaves_uninitialized() {
        let gateway = CountingGateway::new();
        gateway.fail_next_init();
        let err = gateway.init(&RemoteStoreConfig::default()).unwrap_err();
        assert!(err.is_remote_store());
        assert!(!gateway.is_init());

        // Next init succeeds.
        gateway.init(&RemoteStoreConfig::default()).unwrap();
        assert!(gateway.is_init());
        assert_eq!(gateway.init_calls(), 2);
    }

    #[test]
    fn blob_ops_require_init() {
        let gateway = CountingGateway::new();
        assert!(gateway.put_object("k", b"v").is_err());

        gateway.init(&RemoteStoreConfig::default()).unwrap();
        gateway.put_object("k", b"v").unwrap();
        assert_eq!(gateway.get_object("k").unwrap(), b"v");
        assert!(gateway.get_object("missing").is_err());
    }
}

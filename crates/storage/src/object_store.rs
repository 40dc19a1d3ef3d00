//! Remote object-store gateway contract.
//!
//! The remote store (S3/MinIO-compatible) is process-wide state: it must be
//! initialized at most once and uninitialized exactly once per init. The
//! engine does not reach for a global; the storage controller receives an
//! injected `Arc<dyn ObjectStoreGateway>` and is the only component allowed
//! to call `init`/`uninit`, checking `is_init` first.
//!
//! The actual blob client lives behind this trait; the engine only depends
//! on the lifecycle surface.

use keel_core::{KeelError, KeelResult, RemoteStoreConfig};

/// Lifecycle surface of a remote blob backend.
pub trait ObjectStoreGateway: Send + Sync {
    /// True once `init` has succeeded and `uninit` has not yet run.
    fn is_init(&self) -> bool;

    /// Connect and authenticate against the configured endpoint/bucket.
    ///
    /// On failure the gateway must remain uninitialized.
    fn init(&self, config: &RemoteStoreConfig) -> KeelResult<()>;

    /// Release the connection. Idempotent.
    fn uninit(&self) -> KeelResult<()>;

    /// Upload a blob. Only legal between `init` and `uninit`.
    fn put_object(&self, key: &str, bytes: &[u8]) -> KeelResult<()>;

    /// Download a blob. Only legal between `init` and `uninit`.
    fn get_object(&self, key: &str) -> KeelResult<Vec<u8>>;
}

/// Gateway for local-only deployments. The controller never touches the
/// gateway when the storage type is Local; every call here is a config
/// error surfaced loudly.
#[derive(Debug, Default)]
pub struct DisabledGateway;

impl ObjectStoreGateway for DisabledGateway {
    fn is_init(&self) -> bool {
        false
    }

    fn init(&self, _config: &RemoteStoreConfig) -> KeelResult<()> {
        Err(KeelError::config(
            "remote object store is not configured (storage_type = \"local\")",
        ))
    }

    fn uninit(&self) -> KeelResult<()> {
        Ok(())
    }

    fn put_object(&self, _key: &str, _bytes: &[u8]) -> KeelResult<()> {
        Err(KeelError::config(
            "remote object store is not configured (storage_type = \"local\")",
        ))
    }

    fn get_object(&self, _key: &str) -> KeelResult<Vec<u8>> {
        Err(KeelError::config(
            "remote object store is not configured (storage_type = \"local\")",
        ))
    }
}

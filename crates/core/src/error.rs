//! Error types for KeelDB.
//!
//! `KeelError` is the unified error type for all recoverable failures. We
//! use `thiserror` for the `Display`/`Error` implementations.
//!
//! ## Recoverable vs. fatal
//!
//! Two failure taxonomies run through the engine:
//!
//! - **Recoverable** errors are returned as `Err(KeelError)`. A recoverable
//!   error leaves observable state equal to the pre-call state. Example:
//!   remote object-store initialization failing on bad credentials during a
//!   mode transition, after which the transition reverts and the caller
//!   may retry.
//! - **Fatal** errors are lifecycle-invariant violations: a subsystem handle
//!   already present where the transition logic expects it absent, a wrong
//!   reader phase at teardown, a self-transition reaching the dispatch
//!   matrix. These signal a programmer error in the controller or its
//!   caller and `panic!` with a message naming the offending mode and
//!   handle. They are never converted into `KeelError` because continuing
//!   would risk resource leakage or double-initialization of process-wide
//!   singletons.

use std::io;
use thiserror::Error;

/// Result alias used across all KeelDB crates.
pub type KeelResult<T> = std::result::Result<T, KeelError>;

/// Unified recoverable error type.
#[derive(Debug, Error)]
pub enum KeelError {
    /// I/O failure from the filesystem layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or unusable configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Remote object-store failure (network, credentials, bucket).
    #[error("remote store error: {message}")]
    RemoteStore { message: String },

    /// Local storage failure (persistence files, buffer spill).
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Encoding or decoding failure.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Integrity check failure (bad CRC, truncated record).
    #[error("corruption detected: {message}")]
    Corruption { message: String },

    /// Catalog-level failure (duplicate database, unknown table, delta
    /// checkpoint out of order).
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// Transaction-level failure (manager stopped, commit conflict).
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Operation not valid for the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Unexpected internal state. Indicates a bug.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KeelError {
    pub fn config(message: impl Into<String>) -> Self {
        KeelError::Config {
            message: message.into(),
        }
    }

    pub fn remote_store(message: impl Into<String>) -> Self {
        KeelError::RemoteStore {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        KeelError::Storage {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        KeelError::Serialization {
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        KeelError::Corruption {
            message: message.into(),
        }
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        KeelError::Catalog {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        KeelError::Transaction {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        KeelError::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        KeelError::Internal {
            message: message.into(),
        }
    }

    /// True for errors that indicate possible data damage rather than a
    /// transient or caller-fixable condition.
    pub fn is_serious(&self) -> bool {
        matches!(
            self,
            KeelError::Corruption { .. } | KeelError::Internal { .. }
        )
    }

    /// True for remote object-store failures. The controller uses this in
    /// its bring-up rollback path.
    pub fn is_remote_store(&self) -> bool {
        matches!(self, KeelError::RemoteStore { .. })
    }
}

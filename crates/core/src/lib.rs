//! Core types shared by every KeelDB crate.
//!
//! This crate holds the vocabulary of the engine: the storage-mode state
//! enums, the logical timestamp type, the unified error type, and the
//! read-only configuration view consumed during mode transitions.
//!
//! It deliberately depends on no other KeelDB crate so that the durability,
//! storage, catalog, and engine layers can all speak the same types without
//! cycles.

pub mod config;
pub mod error;
pub mod mode;
pub mod types;

pub use config::{FlushMethod, RemoteStoreConfig, StorageConfig};
pub use error::{KeelError, KeelResult};
pub use mode::{ReaderInitPhase, StorageMode, StorageType};
pub use types::{ColumnDef, ColumnType, TableDef, TxnId, TxnTimeStamp};

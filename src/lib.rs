//! # KeelDB
//!
//! An embeddable vector/relational storage engine driven by a mode-based
//! lifecycle controller.
//!
//! The engine is always in one of four storage modes: `UnInitialized`
//! (nothing constructed), `Admin` (offline maintenance, WAL manager only),
//! `Readable` (read-only data plane, brought up in two phases around
//! replicated checkpoints), and `Writable` (full service including
//! background compaction). The [`StorageController`] owns every subsystem
//! handle and constructs, wires, starts, and tears them down as a side
//! effect of each mode transition.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use keeldb::{StorageConfig, StorageController, StorageMode};
//! use keeldb::storage::DisabledGateway;
//!
//! fn main() -> keeldb::KeelResult<()> {
//!     let config = Arc::new(StorageConfig::rooted_default("/var/lib/keel".as_ref()));
//!     let controller = StorageController::new(config, Arc::new(DisabledGateway));
//!
//!     controller.set_mode(StorageMode::Admin)?;
//!     controller.set_mode(StorageMode::Writable)?;
//!
//!     // ... serve queries through the catalog and transaction manager ...
//!
//!     controller.set_mode(StorageMode::UnInitialized)?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `keel-core` | Modes, timestamps, errors, configuration |
//! | `keel-durability` | Write-ahead log and checkpoint files |
//! | `keel-storage` | Persistence manager, buffer manager, object-store gateway, result cache |
//! | `keel-concurrency` | Transaction manager |
//! | `keel-catalog` | Schema/table registry, compaction state, builtin functions |
//! | `keel-engine` | The storage controller and background processors |
//!
//! Only the surface re-exported here is stable.

pub use keel_engine::{
    Catalog, KeelError, KeelResult, ReaderInitPhase, StorageConfig, StorageController,
    StorageMode, StorageType, TxnManager, WalManager,
};

/// Storage-layer building blocks (gateway trait, buffer and persistence
/// managers, result cache).
pub mod storage {
    pub use keel_engine::{
        BufferManager, DisabledGateway, ObjectStoreGateway, PersistenceManager,
        ResultCacheManager,
    };
}

/// Engine processors and lifecycle collaborators, for embedders that need
/// more than the controller surface.
pub mod engine {
    pub use keel_engine::{
        BgTask, BgTaskProcessor, BgTaskStats, CleanupInfo, CleanupTracer, CompactionProcessor,
        CompactionStats, HandlePresence, MemIndexTracer, ObjectStoreProcess, PeriodicTrigger,
        PeriodicTriggerThread, TaskTicket,
    };
}

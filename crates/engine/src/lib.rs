//! The KeelDB engine crate.
//!
//! The centerpiece is [`StorageController`]: a four-mode state machine
//! (UnInitialized, Admin, Readable, Writable) that constructs, wires,
//! starts, and tears down every subsystem the rest of the engine depends
//! on: WAL, catalog, transactions, buffer pool, persistence, the remote
//! object-store gateway, and the background/compaction/periodic processors.
//!
//! Mode transitions are serialized; each one either runs to completion or
//! reverts its recoverable steps and returns an error. Lifecycle-invariant
//! violations (a handle present where the transition expects it absent, a
//! wrong reader phase at teardown) are programmer errors and panic.

pub mod background;
pub mod cleanup;
pub mod compaction;
pub mod controller;
pub mod memindex;
pub mod object_proc;
pub mod periodic;

pub use background::{BgTask, BgTaskProcessor, BgTaskStats, TaskTicket};
pub use cleanup::{CleanupInfo, CleanupTracer};
pub use compaction::{CompactionProcessor, CompactionStats};
pub use controller::{HandlePresence, StorageController};
pub use memindex::MemIndexTracer;
pub use object_proc::ObjectStoreProcess;
pub use periodic::{
    CheckpointTrigger, CleanupTrigger, CompactSegmentTrigger, OptimizeIndexTrigger,
    PeriodicTrigger, PeriodicTriggerThread,
};

pub use keel_catalog::Catalog;
pub use keel_concurrency::TxnManager;
pub use keel_core::{
    KeelError, KeelResult, ReaderInitPhase, StorageConfig, StorageMode, StorageType,
};
pub use keel_durability::WalManager;
pub use keel_storage::{
    BufferManager, DisabledGateway, ObjectStoreGateway, PersistenceManager, ResultCacheManager,
};

//! The catalog: KeelDB's in-memory schema and table registry.
//!
//! The catalog is rebuilt on every bring-up: either fresh (no prior
//! state), from WAL replay, or from a full checkpoint plus a chain of delta
//! checkpoints. It also owns the compaction-algorithm state and the
//! memory-index bookkeeping that the background processors consult.
//!
//! Construction is not thread-safe; the storage controller publishes the
//! handle only after its transition finishes, and all concurrent access
//! happens after that point through the internal locks.

pub mod catalog;
pub mod compaction;
pub mod functions;
pub mod snapshot;

pub use catalog::{Catalog, CleanupStats, DatabaseEntry, SegmentEntry, SegmentStatus, TableEntry};
pub use compaction::CompactionCandidate;
pub use functions::{register_builtin_functions, FunctionKind, FunctionSig};

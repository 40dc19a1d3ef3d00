//! Durability layer for KeelDB: the write-ahead log and checkpoint files.
//!
//! The WAL is the engine's single source of durable truth. Every committed
//! transaction appends exactly one record; catalog checkpoints are written
//! as side files and anchored by a `Checkpoint` record so that replay can
//! find them. Segment rotation and compaction keep the log bounded.

pub mod checkpoint;
pub mod wal;

pub use checkpoint::{
    read_checkpoint_bytes, write_checkpoint_file, CheckpointFile, DeltaCheckpointInfo,
    FullCheckpointInfo,
};
pub use wal::{ReplayResult, WalCmd, WalCounters, WalManager, WalRecord};

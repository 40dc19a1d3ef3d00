//! Storage-mode state enums.
//!
//! The engine is always in exactly one [`StorageMode`]. Transitions between
//! modes are driven by the storage controller in `keel-engine`; these enums
//! only define the vocabulary.
//!
//! Capability ordering: `UnInitialized` < `Admin` < {`Readable`, `Writable`}.
//! `Readable` and `Writable` are siblings; neither is a superset of the
//! other (`Readable` never runs compaction, `Writable` never waits for log
//! replication).

use std::fmt;

/// The operating mode of the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Nothing constructed. The state before first bring-up and after full
    /// teardown.
    UnInitialized,
    /// Offline maintenance mode: only the WAL manager exists, and it is
    /// constructed but not started.
    Admin,
    /// Read-only data plane. Brought up in two phases: Phase1 waits for an
    /// externally replicated checkpoint, Phase2 has catalog and transactions
    /// wired.
    Readable,
    /// Full read/write service, including background compaction.
    Writable,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageMode::UnInitialized => "un-init",
            StorageMode::Admin => "admin",
            StorageMode::Readable => "readable",
            StorageMode::Writable => "writable",
        };
        write!(f, "{}", s)
    }
}

/// Bring-up phase of `Readable` mode.
///
/// Only meaningful while the mode is [`StorageMode::Readable`]. The phase
/// moves `Phase1` → `Phase2` exactly once and never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderInitPhase {
    /// Not in reader bring-up.
    None,
    /// Waiting for log replication to deliver a checkpoint. Only WAL,
    /// buffer manager, and result cache exist.
    Phase1,
    /// Catalog and transaction manager are wired; reads are being served.
    Phase2,
}

impl fmt::Display for ReaderInitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderInitPhase::None => "none",
            ReaderInitPhase::Phase1 => "phase1",
            ReaderInitPhase::Phase2 => "phase2",
        };
        write!(f, "{}", s)
    }
}

/// Which blob backend the engine persists tiered data to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Local filesystem only.
    Local,
    /// Remote object store (S3-compatible). The controller initializes the
    /// gateway during bring-up and tears it down on exit.
    Remote,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageType::Local => "local",
            StorageType::Remote => "remote",
        };
        write!(f, "{}", s)
    }
}

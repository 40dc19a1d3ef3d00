//! Checkpoint file format.
//!
//! A checkpoint is a durable snapshot of catalog state. Full checkpoints
//! are self-contained; delta checkpoints are incremental and must be
//! applied on top of a full one, in timestamp order.
//!
//! # File Layout
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────┬──────────────┬─────────────┬──────────────────┬──────────┐
//! │ Magic (4)   │ Version (4) │ Full (1) │ MaxTs (8)    │ Len (4)     │ Payload (var)    │ CRC32 (4)│
//! └─────────────┴─────────────┴──────────┴──────────────┴─────────────┴──────────────────┴──────────┘
//! ```
//!
//! The CRC covers the payload only; header fields are validated by value.
//! Files are named `full.<ts>.ckp` / `delta.<ts>.ckp` under
//! `<data_dir>/catalog/`, zero-padded so lexicographic order equals
//! timestamp order.

use crc32fast::Hasher;
use keel_core::{KeelError, KeelResult, TxnTimeStamp};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a checkpoint file: "KCKP"
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"KCKP";

/// Current checkpoint format version.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Subdirectory of the data dir that holds checkpoint files.
pub const CHECKPOINT_DIR_NAME: &str = "catalog";

/// A full checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCheckpointInfo {
    pub path: PathBuf,
    pub max_commit_ts: TxnTimeStamp,
}

/// A delta checkpoint on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCheckpointInfo {
    pub path: PathBuf,
    pub max_commit_ts: TxnTimeStamp,
}

/// Decoded checkpoint file contents.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    pub is_full: bool,
    pub max_commit_ts: TxnTimeStamp,
    pub payload: Vec<u8>,
}

/// File name for a full checkpoint at the given timestamp.
pub fn full_checkpoint_filename(ts: TxnTimeStamp) -> String {
    format!("full.{:020}.ckp", ts)
}

/// File name for a delta checkpoint at the given timestamp.
pub fn delta_checkpoint_filename(ts: TxnTimeStamp) -> String {
    format!("delta.{:020}.ckp", ts)
}

fn compute_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Write a checkpoint file atomically (write to a `.tmp` sibling, fsync,
/// rename).
pub fn write_checkpoint_file(
    path: &Path,
    is_full: bool,
    max_commit_ts: TxnTimeStamp,
    payload: &[u8],
) -> KeelResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut bytes = Vec::with_capacity(25 + payload.len());
    bytes.extend_from_slice(&CHECKPOINT_MAGIC);
    bytes.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    bytes.push(u8::from(is_full));
    bytes.extend_from_slice(&max_commit_ts.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&compute_crc(payload).to_le_bytes());

    let tmp = path.with_extension("ckp.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Decode checkpoint file contents from raw bytes.
///
/// Takes bytes rather than a path so callers can route the read through
/// the buffer manager.
pub fn read_checkpoint_bytes(bytes: &[u8]) -> KeelResult<CheckpointFile> {
    if bytes.len() < 25 {
        return Err(KeelError::corruption(format!(
            "checkpoint file too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0..4] != CHECKPOINT_MAGIC {
        return Err(KeelError::corruption("checkpoint file has bad magic"));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != CHECKPOINT_FORMAT_VERSION {
        return Err(KeelError::corruption(format!(
            "unsupported checkpoint format version {}",
            version
        )));
    }
    let is_full = bytes[8] != 0;
    let max_commit_ts = u64::from_le_bytes(bytes[9..17].try_into().unwrap());
    let len = u32::from_le_bytes(bytes[17..21].try_into().unwrap()) as usize;
    if bytes.len() < 21 + len + 4 {
        return Err(KeelError::corruption(
            "checkpoint file truncated: payload shorter than header length",
        ));
    }
    let payload = &bytes[21..21 + len];
    let stored_crc = u32::from_le_bytes(bytes[21 + len..21 + len + 4].try_into().unwrap());
    if compute_crc(payload) != stored_crc {
        return Err(KeelError::corruption("checkpoint payload CRC mismatch"));
    }
    Ok(CheckpointFile {
        is_full,
        max_commit_ts,
        payload: payload.to_vec(),
    })
}

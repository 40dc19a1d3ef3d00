//! WAL segment file and record format.
//!
//! WAL segments are named `wal-NNNNNN.seg` where `NNNNNN` is a zero-padded
//! segment number.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ Record 2                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The length field contains the size of (format version + payload + crc32).
//! The payload is the bincode encoding of [`WalRecord`].
//!
//! A truncated record at the tail of the last segment is not corruption;
//! it is the expected artifact of a crash mid-write, and replay stops there.

use crc32fast::Hasher;
use keel_core::{KeelError, KeelResult, TableDef, TxnId, TxnTimeStamp};
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a WAL segment file: "KEEL"
pub const SEGMENT_MAGIC: [u8; 4] = *b"KEEL";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Current WAL record format version.
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// WAL segment header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "KEEL"
    pub magic: [u8; 4],
    /// Format version for forward compatibility.
    pub format_version: u32,
    /// Segment number (monotonically increasing).
    pub segment_number: u64,
    /// Engine id carried across segments for integrity checking.
    pub engine_id: [u8; 16],
}

impl SegmentHeader {
    pub fn new(segment_number: u64, engine_id: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
            engine_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.engine_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> KeelResult<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(KeelError::corruption("WAL segment header truncated"));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(KeelError::corruption("WAL segment has bad magic"));
        }
        let format_version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if format_version != SEGMENT_FORMAT_VERSION {
            return Err(KeelError::corruption(format!(
                "unsupported WAL segment format version {}",
                format_version
            )));
        }
        let segment_number = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let mut engine_id = [0u8; 16];
        engine_id.copy_from_slice(&bytes[16..32]);
        Ok(SegmentHeader {
            magic,
            format_version,
            segment_number,
            engine_id,
        })
    }
}

/// A single logical command inside a WAL record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalCmd {
    CreateDatabase {
        name: String,
        comment: String,
    },
    DropDatabase {
        name: String,
    },
    CreateTable {
        db: String,
        def: TableDef,
    },
    DropTable {
        db: String,
        table: String,
    },
    /// A sealed data segment became visible in a table.
    AppendSegment {
        db: String,
        table: String,
        segment_id: u64,
        row_count: u64,
    },
    /// Source segments were merged into one new sealed segment.
    CompactSegments {
        db: String,
        table: String,
        deprecated_segments: Vec<u64>,
        segment_id: u64,
        row_count: u64,
    },
    /// Anchors a catalog checkpoint file so replay can find it.
    Checkpoint {
        is_full: bool,
        max_commit_ts: TxnTimeStamp,
        catalog_path: String,
    },
}

impl WalCmd {
    /// True for the checkpoint anchor command.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, WalCmd::Checkpoint { .. })
    }
}

/// One committed transaction's entry in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub txn_id: TxnId,
    pub commit_ts: TxnTimeStamp,
    pub cmds: Vec<WalCmd>,
}

impl WalRecord {
    pub fn new(txn_id: TxnId, commit_ts: TxnTimeStamp, cmds: Vec<WalCmd>) -> Self {
        WalRecord {
            txn_id,
            commit_ts,
            cmds,
        }
    }

    fn compute_crc(payload: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    /// Encode to the framed on-disk representation.
    pub fn encode(&self) -> KeelResult<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| KeelError::serialization(format!("WAL record encode: {}", e)))?;

        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(WAL_RECORD_FORMAT_VERSION);
        payload.extend_from_slice(&body);

        let crc = Self::compute_crc(&payload);
        let total_len = payload.len() + 4; // payload + crc

        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&crc.to_le_bytes());
        Ok(record)
    }

    /// Decode one record starting at `offset`.
    ///
    /// Returns `Ok(None)` when `offset` sits at a clean end of the buffer or
    /// at a truncated tail record (crash artifact). Returns an error for CRC
    /// mismatches and malformed payloads in the middle of the stream.
    pub fn decode(bytes: &[u8], offset: usize) -> KeelResult<Option<(WalRecord, usize)>> {
        if offset >= bytes.len() {
            return Ok(None);
        }
        let remaining = &bytes[offset..];
        if remaining.len() < 4 {
            return Ok(None); // truncated length prefix
        }
        let length = u32::from_le_bytes(remaining[0..4].try_into().unwrap()) as usize;
        if length < 5 {
            return Err(KeelError::corruption(format!(
                "WAL record at offset {} has impossible length {}",
                offset, length
            )));
        }
        if remaining.len() < 4 + length {
            return Ok(None); // truncated tail record
        }
        let payload_with_crc = &remaining[4..4 + length];
        let payload = &payload_with_crc[..length - 4];
        let stored_crc =
            u32::from_le_bytes(payload_with_crc[length - 4..].try_into().unwrap());
        if Self::compute_crc(payload) != stored_crc {
            return Err(KeelError::corruption(format!(
                "WAL record CRC mismatch at offset {}",
                offset
            )));
        }
        if payload[0] != WAL_RECORD_FORMAT_VERSION {
            return Err(KeelError::corruption(format!(
                "unsupported WAL record format version {}",
                payload[0]
            )));
        }
        let record: WalRecord = bincode::deserialize(&payload[1..])
            .map_err(|e| KeelError::serialization(format!("WAL record decode: {}", e)))?;
        Ok(Some((record, offset + 4 + length)))
    }
}

/// File name for a WAL segment.
pub fn segment_filename(number: u64) -> String {
    format!("wal-{:06}.seg", number)
}

/// Parse a segment number out of a `wal-NNNNNN.seg` file name.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("wal-")?;
    let digits = rest.strip_suffix(".seg")?;
    digits.parse().ok()
}

//! Write-ahead log: segment files, record format, and the WAL manager.

mod manager;
mod record;

pub use manager::{ReplayResult, WalCounters, WalManager};
pub use record::{
    SegmentHeader, WalCmd, WalRecord, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, WAL_RECORD_FORMAT_VERSION,
};

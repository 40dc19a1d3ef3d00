//! Serializable catalog snapshots.
//!
//! A full snapshot is the whole registry; a delta snapshot is the ordered
//! list of operations committed since the previous checkpoint. Both are
//! bincode-encoded and wrapped in the crc-guarded checkpoint file format
//! from `keel-durability`.

use crate::catalog::{SegmentEntry, SegmentStatus};
use keel_core::{KeelError, KeelResult, TableDef, TxnTimeStamp};
use keel_durability::WalCmd;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub id: u64,
    pub row_count: u64,
    pub deprecated: bool,
}

impl From<&SegmentEntry> for SegmentSnapshot {
    fn from(entry: &SegmentEntry) -> Self {
        SegmentSnapshot {
            id: entry.id,
            row_count: entry.row_count,
            deprecated: entry.status == SegmentStatus::Deprecated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub def: TableDef,
    pub segments: Vec<SegmentSnapshot>,
    pub next_segment_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub name: String,
    pub comment: String,
    pub create_ts: TxnTimeStamp,
    pub tables: Vec<TableSnapshot>,
}

/// Self-contained catalog state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub max_commit_ts: TxnTimeStamp,
    pub databases: Vec<DatabaseSnapshot>,
}

/// One catalog mutation, as carried in a delta snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaOp {
    pub commit_ts: TxnTimeStamp,
    pub cmd: WalCmd,
}

/// Operations committed since the previous checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSnapshot {
    pub ops: Vec<DeltaOp>,
}

pub fn encode_full(snapshot: &CatalogSnapshot) -> KeelResult<Vec<u8>> {
    bincode::serialize(snapshot)
        .map_err(|e| KeelError::serialization(format!("full snapshot encode: {}", e)))
}

pub fn decode_full(bytes: &[u8]) -> KeelResult<CatalogSnapshot> {
    bincode::deserialize(bytes)
        .map_err(|e| KeelError::serialization(format!("full snapshot decode: {}", e)))
}

pub fn encode_delta(snapshot: &DeltaSnapshot) -> KeelResult<Vec<u8>> {
    bincode::serialize(snapshot)
        .map_err(|e| KeelError::serialization(format!("delta snapshot encode: {}", e)))
}

pub fn decode_delta(bytes: &[u8]) -> KeelResult<DeltaSnapshot> {
    bincode::deserialize(bytes)
        .map_err(|e| KeelError::serialization(format!("delta snapshot decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ColumnDef, ColumnType};

    #[test]
    fn full_snapshot_round_trip() {
        let snapshot = CatalogSnapshot {
            max_commit_ts: 99,
            databases: vec![DatabaseSnapshot {
                name: "default_db".into(),
                comment: "Initial startup created".into(),
                create_ts: 1,
                tables: vec![TableSnapshot {
                    def: TableDef::new(
                        "docs",
                        vec![ColumnDef::new("v", ColumnType::Embedding { dim: 8 })],
                    ),
                    segments: vec![SegmentSnapshot {
                        id: 0,
                        row_count: 100,
                        deprecated: false,
                    }],
                    next_segment_id: 1,
                }],
            }],
        };
        let bytes = encode_full(&snapshot).unwrap();
        let decoded = decode_full(&bytes).unwrap();
        assert_eq!(decoded.max_commit_ts, 99);
        assert_eq!(decoded.databases.len(), 1);
        assert_eq!(decoded.databases[0].tables[0].segments[0].row_count, 100);
    }

    #[test]
    fn delta_snapshot_round_trip() {
        let delta = DeltaSnapshot {
            ops: vec![DeltaOp {
                commit_ts: 12,
                cmd: WalCmd::DropDatabase { name: "x".into() },
            }],
        };
        let bytes = encode_delta(&delta).unwrap();
        let decoded = decode_delta(&bytes).unwrap();
        assert_eq!(decoded.ops.len(), 1);
        assert_eq!(decoded.ops[0].commit_ts, 12);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode_full(&[1, 2, 3]).is_err());
    }
}

//! Plain shared types: timestamps, identifiers, and the minimal table
//! schema vocabulary that both the catalog and the WAL payloads use.

use serde::{Deserialize, Serialize};

/// Logical commit timestamp.
///
/// Monotonically non-decreasing across the life of the engine. The value 0
/// is reserved to mean "no prior checkpoint exists": WAL replay returns 0
/// when the engine starts from an empty directory, and the controller
/// responds by creating a fresh catalog.
pub type TxnTimeStamp = u64;

/// Transaction identifier, unique within a process lifetime.
pub type TxnId = u64;

/// Column value type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Varchar,
    /// Fixed-dimension embedding vector.
    Embedding { dim: usize },
}

/// A single column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A table definition as carried in WAL records and stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}

//! The catalog registry.
//!
//! Databases hold tables; tables hold sealed data segments. All mutations
//! arrive either from committed transactions (via the WAL command
//! vocabulary) or from checkpoint/replay restoration. The catalog also
//! tracks the operations committed since the last checkpoint so delta
//! checkpoints can be cut without walking the whole registry.

use crate::compaction::{layer_of, CompactionCandidate, CompactionState, MAX_SEGMENTS_PER_COMPACTION};
use crate::functions::FunctionSig;
use crate::snapshot::{
    self, CatalogSnapshot, DatabaseSnapshot, DeltaOp, DeltaSnapshot, SegmentSnapshot, TableSnapshot,
};
use keel_core::{KeelError, KeelResult, TableDef, TxnTimeStamp};
use keel_durability::checkpoint::read_checkpoint_bytes;
use keel_durability::{DeltaCheckpointInfo, FullCheckpointInfo, ReplayResult, WalCmd};
use keel_storage::BufferManager;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Estimated in-memory index bytes per indexed row, used for quota
/// accounting during recovery.
const MEM_INDEX_BYTES_PER_ROW: u64 = 64;

/// Lifecycle state of a data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Immutable and visible.
    Sealed,
    /// Selected as a compaction source; not eligible for another pick.
    Compacting,
    /// Superseded by a merged segment; awaiting cleanup.
    Deprecated,
}

/// A sealed data segment as registered in a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub id: u64,
    pub row_count: u64,
    pub status: SegmentStatus,
}

/// A table: definition plus its segments.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub def: TableDef,
    pub segments: Vec<SegmentEntry>,
    pub next_segment_id: u64,
}

impl TableEntry {
    fn new(def: TableDef) -> Self {
        TableEntry {
            def,
            segments: Vec::new(),
            next_segment_id: 0,
        }
    }

    pub fn sealed_segments(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Sealed)
    }
}

/// A database: comment, creation time, and its tables.
#[derive(Debug, Clone)]
pub struct DatabaseEntry {
    pub name: String,
    pub comment: String,
    pub create_ts: TxnTimeStamp,
    pub tables: HashMap<String, TableEntry>,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub segments_removed: u64,
}

/// In-memory schema + table registry.
#[derive(Debug)]
pub struct Catalog {
    databases: RwLock<HashMap<String, DatabaseEntry>>,
    functions: RwLock<HashMap<&'static str, FunctionSig>>,
    compaction: Mutex<Option<CompactionState>>,
    delta_ops: Mutex<Vec<DeltaOp>>,
    last_applied_ts: AtomicU64,
    mem_index_committing: AtomicBool,
    mem_index_usage: AtomicU64,
    mem_index_recovered: AtomicU64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// A fresh, empty catalog.
    pub fn new() -> Self {
        Catalog {
            databases: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
            compaction: Mutex::new(None),
            delta_ops: Mutex::new(Vec::new()),
            last_applied_ts: AtomicU64::new(0),
            mem_index_committing: AtomicBool::new(false),
            mem_index_usage: AtomicU64::new(0),
            mem_index_recovered: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Command application
    // ========================================================================

    /// Apply one committed WAL command at its commit timestamp.
    ///
    /// Commands arriving through live commits are also recorded for the
    /// next delta checkpoint; commands re-applied from snapshots are not.
    pub fn apply_cmd(&self, cmd: &WalCmd, commit_ts: TxnTimeStamp) -> KeelResult<()> {
        self.apply_cmd_at(cmd, commit_ts, true)
    }

    fn apply_cmd_at(&self, cmd: &WalCmd, commit_ts: TxnTimeStamp, record: bool) -> KeelResult<()> {
        match cmd {
            WalCmd::CreateDatabase { name, comment } => {
                self.create_database_at(name, comment, commit_ts)?
            }
            WalCmd::DropDatabase { name } => self.drop_database_at(name)?,
            WalCmd::CreateTable { db, def } => self.create_table_at(db, def.clone())?,
            WalCmd::DropTable { db, table } => self.drop_table_at(db, table)?,
            WalCmd::AppendSegment {
                db,
                table,
                segment_id,
                row_count,
            } => self.append_segment_at(db, table, *segment_id, *row_count)?,
            WalCmd::CompactSegments {
                db,
                table,
                deprecated_segments,
                segment_id,
                row_count,
            } => self.compact_segments_at(db, table, deprecated_segments, *segment_id, *row_count)?,
            // Checkpoint anchors carry no registry mutation.
            WalCmd::Checkpoint { .. } => return Ok(()),
        }

        self.last_applied_ts.fetch_max(commit_ts, Ordering::AcqRel);
        if record {
            self.delta_ops.lock().push(DeltaOp {
                commit_ts,
                cmd: cmd.clone(),
            });
        }
        Ok(())
    }

    fn create_database_at(
        &self,
        name: &str,
        comment: &str,
        create_ts: TxnTimeStamp,
    ) -> KeelResult<()> {
        let mut databases = self.databases.write();
        if databases.contains_key(name) {
            return Err(KeelError::catalog(format!("duplicate database '{}'", name)));
        }
        databases.insert(
            name.to_string(),
            DatabaseEntry {
                name: name.to_string(),
                comment: comment.to_string(),
                create_ts,
                tables: HashMap::new(),
            },
        );
        Ok(())
    }

    fn drop_database_at(&self, name: &str) -> KeelResult<()> {
        self.databases
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KeelError::catalog(format!("unknown database '{}'", name)))
    }

    fn create_table_at(&self, db: &str, def: TableDef) -> KeelResult<()> {
        let mut databases = self.databases.write();
        let entry = databases
            .get_mut(db)
            .ok_or_else(|| KeelError::catalog(format!("unknown database '{}'", db)))?;
        if entry.tables.contains_key(&def.name) {
            return Err(KeelError::catalog(format!(
                "duplicate table '{}.{}'",
                db, def.name
            )));
        }
        entry.tables.insert(def.name.clone(), TableEntry::new(def));
        Ok(())
    }

    fn drop_table_at(&self, db: &str, table: &str) -> KeelResult<()> {
        let mut databases = self.databases.write();
        let entry = databases
            .get_mut(db)
            .ok_or_else(|| KeelError::catalog(format!("unknown database '{}'", db)))?;
        entry
            .tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| KeelError::catalog(format!("unknown table '{}.{}'", db, table)))
    }

    fn append_segment_at(
        &self,
        db: &str,
        table: &str,
        segment_id: u64,
        row_count: u64,
    ) -> KeelResult<()> {
        let mut databases = self.databases.write();
        let table_entry = databases
            .get_mut(db)
            .and_then(|d| d.tables.get_mut(table))
            .ok_or_else(|| KeelError::catalog(format!("unknown table '{}.{}'", db, table)))?;
        table_entry.segments.push(SegmentEntry {
            id: segment_id,
            row_count,
            status: SegmentStatus::Sealed,
        });
        table_entry.next_segment_id = table_entry.next_segment_id.max(segment_id + 1);
        Ok(())
    }

    fn compact_segments_at(
        &self,
        db: &str,
        table: &str,
        deprecated: &[u64],
        segment_id: u64,
        row_count: u64,
    ) -> KeelResult<()> {
        let mut databases = self.databases.write();
        let table_entry = databases
            .get_mut(db)
            .and_then(|d| d.tables.get_mut(table))
            .ok_or_else(|| KeelError::catalog(format!("unknown table '{}.{}'", db, table)))?;
        for segment in table_entry.segments.iter_mut() {
            if deprecated.contains(&segment.id) {
                segment.status = SegmentStatus::Deprecated;
            }
        }
        table_entry.segments.push(SegmentEntry {
            id: segment_id,
            row_count,
            status: SegmentStatus::Sealed,
        });
        table_entry.next_segment_id = table_entry.next_segment_id.max(segment_id + 1);
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
    }

    pub fn database_comment(&self, name: &str) -> Option<String> {
        self.databases.read().get(name).map(|d| d.comment.clone())
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    pub fn table_names(&self, db: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .databases
            .read()
            .get(db)
            .map(|d| d.tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn table(&self, db: &str, table: &str) -> Option<TableEntry> {
        self.databases
            .read()
            .get(db)
            .and_then(|d| d.tables.get(table))
            .cloned()
    }

    /// Allocate the next segment id for a table.
    pub fn allocate_segment_id(&self, db: &str, table: &str) -> KeelResult<u64> {
        let mut databases = self.databases.write();
        let table_entry = databases
            .get_mut(db)
            .and_then(|d| d.tables.get_mut(table))
            .ok_or_else(|| KeelError::catalog(format!("unknown table '{}.{}'", db, table)))?;
        let id = table_entry.next_segment_id;
        table_entry.next_segment_id += 1;
        Ok(id)
    }

    /// Highest commit timestamp applied to this catalog.
    pub fn last_applied_ts(&self) -> TxnTimeStamp {
        self.last_applied_ts.load(Ordering::Acquire)
    }

    // ========================================================================
    // Snapshots & checkpoints
    // ========================================================================

    fn snapshot(&self) -> CatalogSnapshot {
        let databases = self.databases.read();
        let mut database_snapshots: Vec<DatabaseSnapshot> = databases
            .values()
            .map(|d| {
                let mut tables: Vec<TableSnapshot> = d
                    .tables
                    .values()
                    .map(|t| TableSnapshot {
                        def: t.def.clone(),
                        segments: t.segments.iter().map(SegmentSnapshot::from).collect(),
                        next_segment_id: t.next_segment_id,
                    })
                    .collect();
                tables.sort_by(|a, b| a.def.name.cmp(&b.def.name));
                DatabaseSnapshot {
                    name: d.name.clone(),
                    comment: d.comment.clone(),
                    create_ts: d.create_ts,
                    tables,
                }
            })
            .collect();
        database_snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        CatalogSnapshot {
            max_commit_ts: self.last_applied_ts(),
            databases: database_snapshots,
        }
    }

    /// Encode a full snapshot and clear the pending delta ops it covers.
    pub fn encode_full_snapshot(&self) -> KeelResult<Vec<u8>> {
        let bytes = snapshot::encode_full(&self.snapshot())?;
        self.delta_ops.lock().clear();
        Ok(bytes)
    }

    /// Encode (and drain) the operations committed since the last
    /// checkpoint. Returns `None` when there is nothing to checkpoint.
    pub fn take_delta_snapshot(&self) -> KeelResult<Option<Vec<u8>>> {
        let ops: Vec<DeltaOp> = std::mem::take(&mut *self.delta_ops.lock());
        if ops.is_empty() {
            return Ok(None);
        }
        let bytes = snapshot::encode_delta(&DeltaSnapshot { ops })?;
        Ok(Some(bytes))
    }

    fn apply_full_snapshot(&self, full: CatalogSnapshot) {
        let mut databases = self.databases.write();
        databases.clear();
        for d in full.databases {
            let tables = d
                .tables
                .into_iter()
                .map(|t| {
                    (
                        t.def.name.clone(),
                        TableEntry {
                            def: t.def,
                            segments: t
                                .segments
                                .iter()
                                .map(|s| SegmentEntry {
                                    id: s.id,
                                    row_count: s.row_count,
                                    status: if s.deprecated {
                                        SegmentStatus::Deprecated
                                    } else {
                                        SegmentStatus::Sealed
                                    },
                                })
                                .collect(),
                            next_segment_id: t.next_segment_id,
                        },
                    )
                })
                .collect();
            databases.insert(
                d.name.clone(),
                DatabaseEntry {
                    name: d.name,
                    comment: d.comment,
                    create_ts: d.create_ts,
                    tables,
                },
            );
        }
        drop(databases);
        self.last_applied_ts
            .fetch_max(full.max_commit_ts, Ordering::AcqRel);
    }

    fn apply_delta_snapshot(&self, delta: DeltaSnapshot) -> KeelResult<()> {
        for op in delta.ops {
            self.apply_cmd_at(&op.cmd, op.commit_ts, false)?;
        }
        Ok(())
    }

    /// Construct a catalog from a single full checkpoint file.
    pub fn load_full_checkpoint(path: &Path) -> KeelResult<Catalog> {
        let bytes = std::fs::read(path).map_err(|e| {
            KeelError::catalog(format!(
                "cannot read full checkpoint '{}': {}",
                path.display(),
                e
            ))
        })?;
        let file = read_checkpoint_bytes(&bytes)?;
        if !file.is_full {
            return Err(KeelError::catalog(format!(
                "'{}' is a delta checkpoint, expected full",
                path.display()
            )));
        }
        let catalog = Catalog::new();
        catalog.apply_full_snapshot(snapshot::decode_full(&file.payload)?);
        info!(
            target: "keel::catalog",
            path = %path.display(),
            databases = catalog.database_count(),
            "catalog loaded from full checkpoint"
        );
        Ok(catalog)
    }

    /// Construct a catalog from a full checkpoint plus delta checkpoints,
    /// reading files through the buffer manager.
    ///
    /// Deltas must be newer than the full checkpoint and sorted by
    /// timestamp; anything else is a caller bug surfaced as an error.
    pub fn load_from_files(
        full: &FullCheckpointInfo,
        deltas: &[DeltaCheckpointInfo],
        buffer: &BufferManager,
    ) -> KeelResult<Catalog> {
        let full_bytes = buffer.read_file(&full.path)?;
        let full_file = read_checkpoint_bytes(&full_bytes)?;
        if !full_file.is_full {
            return Err(KeelError::catalog(format!(
                "'{}' is a delta checkpoint, expected full",
                full.path.display()
            )));
        }
        let catalog = Catalog::new();
        catalog.apply_full_snapshot(snapshot::decode_full(&full_file.payload)?);

        let mut prev_ts = full.max_commit_ts;
        for delta in deltas {
            if delta.max_commit_ts <= prev_ts {
                return Err(KeelError::catalog(format!(
                    "delta checkpoint '{}' (ts {}) out of order, previous ts {}",
                    delta.path.display(),
                    delta.max_commit_ts,
                    prev_ts
                )));
            }
            let delta_bytes = buffer.read_file(&delta.path)?;
            let delta_file = read_checkpoint_bytes(&delta_bytes)?;
            if delta_file.is_full {
                return Err(KeelError::catalog(format!(
                    "'{}' is a full checkpoint, expected delta",
                    delta.path.display()
                )));
            }
            catalog.apply_delta_snapshot(snapshot::decode_delta(&delta_file.payload)?)?;
            catalog
                .last_applied_ts
                .fetch_max(delta.max_commit_ts, Ordering::AcqRel);
            prev_ts = delta.max_commit_ts;
        }
        info!(
            target: "keel::catalog",
            databases = catalog.database_count(),
            deltas = deltas.len(),
            last_ts = catalog.last_applied_ts(),
            "catalog loaded from checkpoint chain"
        );
        Ok(catalog)
    }

    /// Append one delta checkpoint on top of the existing catalog.
    pub fn attach_delta_checkpoint(&self, path: &Path) -> KeelResult<()> {
        let bytes = std::fs::read(path).map_err(|e| {
            KeelError::catalog(format!(
                "cannot read delta checkpoint '{}': {}",
                path.display(),
                e
            ))
        })?;
        let file = read_checkpoint_bytes(&bytes)?;
        if file.is_full {
            return Err(KeelError::catalog(format!(
                "'{}' is a full checkpoint, expected delta",
                path.display()
            )));
        }
        if file.max_commit_ts < self.last_applied_ts() {
            return Err(KeelError::catalog(format!(
                "delta checkpoint '{}' (ts {}) is older than catalog state (ts {})",
                path.display(),
                file.max_commit_ts,
                self.last_applied_ts()
            )));
        }
        self.apply_delta_snapshot(snapshot::decode_delta(&file.payload)?)?;
        self.last_applied_ts
            .fetch_max(file.max_commit_ts, Ordering::AcqRel);
        Ok(())
    }

    /// Rebuild catalog state from a WAL replay: checkpoint chain first,
    /// then the records committed after it.
    pub fn restore_from_replay(
        replay: &ReplayResult,
        buffer: &BufferManager,
    ) -> KeelResult<Catalog> {
        let catalog = match &replay.full_checkpoint {
            Some(full) => Catalog::load_from_files(full, &replay.delta_checkpoints, buffer)?,
            None => Catalog::new(),
        };
        for record in &replay.records {
            for cmd in &record.cmds {
                // Replayed-but-uncheckpointed commands must flow into the
                // next delta checkpoint, so they are recorded.
                catalog.apply_cmd_at(cmd, record.commit_ts, true)?;
            }
        }
        catalog
            .last_applied_ts
            .fetch_max(replay.system_start_ts, Ordering::AcqRel);
        Ok(catalog)
    }

    // ========================================================================
    // Compaction state
    // ========================================================================

    /// Arm the layered compaction algorithm.
    pub fn init_compaction_alg(&self, ts: TxnTimeStamp) {
        *self.compaction.lock() = Some(CompactionState { initialized_at: ts });
        info!(target: "keel::catalog", ts, "compaction algorithm initialized");
    }

    pub fn compaction_initialized(&self) -> bool {
        self.compaction.lock().is_some()
    }

    /// Groups of sealed segments worth merging. Empty when the algorithm
    /// was never armed.
    pub fn pick_compaction_candidates(&self) -> Vec<CompactionCandidate> {
        if self.compaction.lock().is_none() {
            return Vec::new();
        }
        let mut candidates = Vec::new();
        let databases = self.databases.read();
        for db in databases.values() {
            for table in db.tables.values() {
                let mut layers: HashMap<u32, Vec<u64>> = HashMap::new();
                for segment in table.sealed_segments() {
                    layers
                        .entry(layer_of(segment.row_count))
                        .or_default()
                        .push(segment.id);
                }
                for (_, mut ids) in layers {
                    if ids.len() >= 2 {
                        ids.sort_unstable();
                        ids.truncate(MAX_SEGMENTS_PER_COMPACTION);
                        candidates.push(CompactionCandidate {
                            db: db.name.clone(),
                            table: table.def.name.clone(),
                            segment_ids: ids,
                        });
                    }
                }
            }
        }
        candidates
    }

    /// Mark candidate segments as compacting so the next pick skips them.
    pub fn begin_compaction(&self, candidate: &CompactionCandidate) -> KeelResult<u64> {
        let mut total_rows = 0;
        {
            let mut databases = self.databases.write();
            let table_entry = databases
                .get_mut(&candidate.db)
                .and_then(|d| d.tables.get_mut(&candidate.table))
                .ok_or_else(|| {
                    KeelError::catalog(format!(
                        "unknown table '{}.{}'",
                        candidate.db, candidate.table
                    ))
                })?;
            for segment in table_entry.segments.iter_mut() {
                if candidate.segment_ids.contains(&segment.id) {
                    if segment.status != SegmentStatus::Sealed {
                        return Err(KeelError::catalog(format!(
                            "segment {} of '{}.{}' is not sealed",
                            segment.id, candidate.db, candidate.table
                        )));
                    }
                    segment.status = SegmentStatus::Compacting;
                    total_rows += segment.row_count;
                }
            }
        }
        Ok(total_rows)
    }

    /// Number of segments awaiting cleanup.
    pub fn deprecated_segment_count(&self) -> u64 {
        let databases = self.databases.read();
        databases
            .values()
            .flat_map(|d| d.tables.values())
            .flat_map(|t| t.segments.iter())
            .filter(|s| s.status == SegmentStatus::Deprecated)
            .count() as u64
    }

    /// Drop deprecated segments. Invoked by the background cleanup task.
    pub fn cleanup(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let mut databases = self.databases.write();
        for db in databases.values_mut() {
            for table in db.tables.values_mut() {
                let before = table.segments.len();
                table
                    .segments
                    .retain(|s| s.status != SegmentStatus::Deprecated);
                stats.segments_removed += (before - table.segments.len()) as u64;
            }
        }
        stats
    }

    // ========================================================================
    // Memory-index bookkeeping
    // ========================================================================

    pub fn start_memory_index_commit(&self) {
        self.mem_index_committing.store(true, Ordering::Release);
    }

    pub fn memory_index_committing(&self) -> bool {
        self.mem_index_committing.load(Ordering::Acquire)
    }

    /// Rebuild the in-memory index accounting for every sealed segment.
    ///
    /// Must run after `start_memory_index_commit`.
    pub fn mem_index_recover(
        &self,
        buffer: &BufferManager,
        system_start_ts: TxnTimeStamp,
    ) -> KeelResult<()> {
        if !self.memory_index_committing() {
            return Err(KeelError::internal(
                "mem_index_recover before start_memory_index_commit",
            ));
        }
        let mut recovered = 0u64;
        let mut usage = 0u64;
        {
            let databases = self.databases.read();
            for db in databases.values() {
                for table in db.tables.values() {
                    for segment in table.sealed_segments() {
                        usage += segment.row_count * MEM_INDEX_BYTES_PER_ROW;
                        recovered += 1;
                    }
                }
            }
        }
        self.mem_index_usage.fetch_add(usage, Ordering::AcqRel);
        self.mem_index_recovered.store(recovered, Ordering::Release);
        info!(
            target: "keel::catalog",
            system_start_ts,
            segments = recovered,
            mem_index_bytes = usage,
            buffer_usage = buffer.usage(),
            "memory indexes recovered"
        );
        Ok(())
    }

    pub fn record_mem_index(&self, bytes: u64) {
        self.mem_index_usage.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release_mem_index(&self, bytes: u64) {
        let _ = self
            .mem_index_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn mem_index_usage(&self) -> u64 {
        self.mem_index_usage.load(Ordering::Acquire)
    }

    pub fn mem_index_recovered_count(&self) -> u64 {
        self.mem_index_recovered.load(Ordering::Acquire)
    }

    // ========================================================================
    // Function registry
    // ========================================================================

    pub fn register_function(&self, sig: FunctionSig) {
        let mut functions = self.functions.write();
        if functions.insert(sig.name, sig.clone()).is_some() {
            warn!(target: "keel::catalog", name = sig.name, "function re-registered");
        }
    }

    pub fn function(&self, name: &str) -> Option<FunctionSig> {
        self.functions.read().get(name).cloned()
    }

    pub fn function_count(&self) -> usize {
        self.functions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ColumnDef, ColumnType};
    use keel_durability::checkpoint::write_checkpoint_file;
    use tempfile::TempDir;

    fn docs_table() -> TableDef {
        TableDef::new(
            "docs",
            vec![ColumnDef::new("v", ColumnType::Embedding { dim: 4 })],
        )
    }

    fn catalog_with_default_db() -> Catalog {
        let catalog = Catalog::new();
        catalog
            .apply_cmd(
                &WalCmd::CreateDatabase {
                    name: "default_db".into(),
                    comment: "Initial startup created".into(),
                },
                1,
            )
            .unwrap();
        catalog
    }

    fn test_buffer(root: &std::path::Path) -> BufferManager {
        let bm = BufferManager::new(1 << 20, root.join("data"), root.join("tmp"), None, 2);
        bm.start().unwrap();
        bm
    }

    #[test]
    fn create_and_drop_database() {
        let catalog = catalog_with_default_db();
        assert!(catalog.has_database("default_db"));
        assert_eq!(
            catalog.database_comment("default_db").unwrap(),
            "Initial startup created"
        );

        let err = catalog
            .apply_cmd(
                &WalCmd::CreateDatabase {
                    name: "default_db".into(),
                    comment: String::new(),
                },
                2,
            )
            .unwrap_err();
        assert!(matches!(err, KeelError::Catalog { .. }));

        catalog
            .apply_cmd(&WalCmd::DropDatabase { name: "default_db".into() }, 3)
            .unwrap();
        assert!(!catalog.has_database("default_db"));
    }

    #[test]
    fn tables_and_segments() {
        let catalog = catalog_with_default_db();
        catalog
            .apply_cmd(
                &WalCmd::CreateTable {
                    db: "default_db".into(),
                    def: docs_table(),
                },
                2,
            )
            .unwrap();
        catalog
            .apply_cmd(
                &WalCmd::AppendSegment {
                    db: "default_db".into(),
                    table: "docs".into(),
                    segment_id: 0,
                    row_count: 500,
                },
                3,
            )
            .unwrap();

        let table = catalog.table("default_db", "docs").unwrap();
        assert_eq!(table.segments.len(), 1);
        assert_eq!(table.segments[0].row_count, 500);
        assert_eq!(catalog.allocate_segment_id("default_db", "docs").unwrap(), 1);
        assert_eq!(catalog.last_applied_ts(), 3);
    }

    #[test]
    fn full_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog_with_default_db();
        catalog
            .apply_cmd(
                &WalCmd::CreateTable {
                    db: "default_db".into(),
                    def: docs_table(),
                },
                5,
            )
            .unwrap();

        let bytes = catalog.encode_full_snapshot().unwrap();
        let path = dir.path().join("full.ckp");
        write_checkpoint_file(&path, true, 5, &bytes).unwrap();

        let loaded = Catalog::load_full_checkpoint(&path).unwrap();
        assert!(loaded.has_database("default_db"));
        assert!(loaded.table("default_db", "docs").is_some());
        assert_eq!(loaded.last_applied_ts(), 5);
    }

    #[test]
    fn load_full_checkpoint_rejects_delta_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("delta.ckp");
        write_checkpoint_file(&path, false, 5, b"whatever").unwrap();
        assert!(Catalog::load_full_checkpoint(&path).is_err());
    }

    #[test]
    fn load_from_files_applies_delta_chain() {
        let dir = TempDir::new().unwrap();
        let buffer = test_buffer(dir.path());

        // Base: default_db only.
        let base = catalog_with_default_db();
        let full_path = dir.path().join("full.ckp");
        write_checkpoint_file(&full_path, true, 1, &base.encode_full_snapshot().unwrap()).unwrap();

        // Delta: table creation at ts 2.
        base.apply_cmd(
            &WalCmd::CreateTable {
                db: "default_db".into(),
                def: docs_table(),
            },
            2,
        )
        .unwrap();
        let delta_bytes = base.take_delta_snapshot().unwrap().unwrap();
        let delta_path = dir.path().join("delta.ckp");
        write_checkpoint_file(&delta_path, false, 2, &delta_bytes).unwrap();

        let loaded = Catalog::load_from_files(
            &FullCheckpointInfo {
                path: full_path,
                max_commit_ts: 1,
            },
            &[DeltaCheckpointInfo {
                path: delta_path,
                max_commit_ts: 2,
            }],
            &buffer,
        )
        .unwrap();
        assert!(loaded.table("default_db", "docs").is_some());
        assert_eq!(loaded.last_applied_ts(), 2);
        buffer.stop();
    }

    #[test]
    fn load_from_files_rejects_out_of_order_delta() {
        let dir = TempDir::new().unwrap();
        let buffer = test_buffer(dir.path());

        let base = catalog_with_default_db();
        let full_path = dir.path().join("full.ckp");
        write_checkpoint_file(&full_path, true, 10, &base.encode_full_snapshot().unwrap())
            .unwrap();
        let delta_path = dir.path().join("delta.ckp");
        write_checkpoint_file(&delta_path, false, 5, b"unused").unwrap();

        let err = Catalog::load_from_files(
            &FullCheckpointInfo {
                path: full_path,
                max_commit_ts: 10,
            },
            &[DeltaCheckpointInfo {
                path: delta_path,
                max_commit_ts: 5,
            }],
            &buffer,
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::Catalog { .. }));
        buffer.stop();
    }

    #[test]
    fn attach_delta_checkpoint_appends() {
        let dir = TempDir::new().unwrap();

        let source = catalog_with_default_db();
        source.take_delta_snapshot().unwrap(); // discard the create op
        source
            .apply_cmd(
                &WalCmd::CreateTable {
                    db: "default_db".into(),
                    def: docs_table(),
                },
                7,
            )
            .unwrap();
        let delta_bytes = source.take_delta_snapshot().unwrap().unwrap();
        let path = dir.path().join("delta.ckp");
        write_checkpoint_file(&path, false, 7, &delta_bytes).unwrap();

        let target = catalog_with_default_db();
        target.attach_delta_checkpoint(&path).unwrap();
        assert!(target.table("default_db", "docs").is_some());
        assert_eq!(target.last_applied_ts(), 7);
    }

    #[test]
    fn compaction_candidates_group_by_layer() {
        let catalog = catalog_with_default_db();
        catalog
            .apply_cmd(
                &WalCmd::CreateTable {
                    db: "default_db".into(),
                    def: docs_table(),
                },
                2,
            )
            .unwrap();
        for (id, rows) in [(0u64, 50u64), (1, 70), (2, 5000)] {
            catalog
                .apply_cmd(
                    &WalCmd::AppendSegment {
                        db: "default_db".into(),
                        table: "docs".into(),
                        segment_id: id,
                        row_count: rows,
                    },
                    3 + id,
                )
                .unwrap();
        }

        // Not armed yet, so no candidates.
        assert!(catalog.pick_compaction_candidates().is_empty());

        catalog.init_compaction_alg(5);
        let candidates = catalog.pick_compaction_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].segment_ids, vec![0, 1]);

        // Claiming the candidate removes it from the next pick.
        let rows = catalog.begin_compaction(&candidates[0]).unwrap();
        assert_eq!(rows, 120);
        assert!(catalog.pick_compaction_candidates().is_empty());

        // Completing the merge deprecates sources and adds the target.
        catalog
            .apply_cmd(
                &WalCmd::CompactSegments {
                    db: "default_db".into(),
                    table: "docs".into(),
                    deprecated_segments: vec![0, 1],
                    segment_id: 3,
                    row_count: 120,
                },
                9,
            )
            .unwrap();
        let stats = catalog.cleanup();
        assert_eq!(stats.segments_removed, 2);
        let table = catalog.table("default_db", "docs").unwrap();
        assert_eq!(table.segments.len(), 2); // merged + the 5000-row one
    }

    #[test]
    fn mem_index_recover_requires_commit_start() {
        let dir = TempDir::new().unwrap();
        let buffer = test_buffer(dir.path());
        let catalog = catalog_with_default_db();
        assert!(catalog.mem_index_recover(&buffer, 1).is_err());

        catalog.start_memory_index_commit();
        catalog.mem_index_recover(&buffer, 1).unwrap();
        assert_eq!(catalog.mem_index_recovered_count(), 0);
        buffer.stop();
    }

    #[test]
    fn mem_index_usage_accounting() {
        let catalog = Catalog::new();
        catalog.record_mem_index(100);
        catalog.record_mem_index(50);
        assert_eq!(catalog.mem_index_usage(), 150);
        catalog.release_mem_index(60);
        assert_eq!(catalog.mem_index_usage(), 90);
        // Saturates rather than underflowing.
        catalog.release_mem_index(1_000);
        assert_eq!(catalog.mem_index_usage(), 0);
    }

    #[test]
    fn restore_from_replay_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let buffer = test_buffer(dir.path());
        let replay = ReplayResult {
            system_start_ts: 4,
            full_checkpoint: None,
            delta_checkpoints: Vec::new(),
            records: vec![keel_durability::WalRecord::new(
                1,
                4,
                vec![WalCmd::CreateDatabase {
                    name: "default_db".into(),
                    comment: String::new(),
                }],
            )],
        };
        let catalog = Catalog::restore_from_replay(&replay, &buffer).unwrap();
        assert!(catalog.has_database("default_db"));
        assert_eq!(catalog.last_applied_ts(), 4);
        buffer.stop();
    }
}

//! End-to-end lifecycle tests for the storage controller.
//!
//! Each scenario starts a fresh controller in UnInitialized mode and walks
//! it through a transition sequence, asserting the by-mode handle
//! invariants after every successful `set_mode`.

use keel_catalog::Catalog;
use keel_core::config::DEFAULT_DATABASE_NAME;
use keel_core::{
    ColumnDef, ColumnType, ReaderInitPhase, StorageConfig, StorageMode, StorageType, TableDef,
};
use keel_durability::checkpoint::write_checkpoint_file;
use keel_durability::{DeltaCheckpointInfo, FullCheckpointInfo, WalCmd};
use keel_engine::StorageController;
use keel_storage::testing::CountingGateway;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn local_controller(root: &Path) -> (StorageController, Arc<CountingGateway>) {
    controller_with(StorageConfig::for_testing(root))
}

fn controller_with(config: StorageConfig) -> (StorageController, Arc<CountingGateway>) {
    let gateway = Arc::new(CountingGateway::new());
    let controller = StorageController::new(Arc::new(config), gateway.clone());
    (controller, gateway)
}

fn remote_config(root: &Path) -> StorageConfig {
    let mut config = StorageConfig::for_testing(root);
    config.storage_type = StorageType::Remote;
    config.object_store.url = "http://localhost:9000".to_string();
    config.object_store.bucket = "keel".to_string();
    config
}

/// Build a full + two-delta checkpoint chain on disk, as log replication
/// would deliver it to a reader node.
fn make_checkpoint_chain(dir: &Path) -> (FullCheckpointInfo, Vec<DeltaCheckpointInfo>) {
    let catalog = Catalog::new();
    catalog
        .apply_cmd(
            &WalCmd::CreateDatabase {
                name: DEFAULT_DATABASE_NAME.to_string(),
                comment: "Initial startup created".to_string(),
            },
            1,
        )
        .unwrap();
    let full_path = dir.join("full.00001.ckp");
    write_checkpoint_file(&full_path, true, 1, &catalog.encode_full_snapshot().unwrap()).unwrap();

    catalog
        .apply_cmd(
            &WalCmd::CreateTable {
                db: DEFAULT_DATABASE_NAME.to_string(),
                def: TableDef::new(
                    "docs",
                    vec![ColumnDef::new("v", ColumnType::Embedding { dim: 4 })],
                ),
            },
            2,
        )
        .unwrap();
    let d1_path = dir.join("delta.00002.ckp");
    write_checkpoint_file(
        &d1_path,
        false,
        2,
        &catalog.take_delta_snapshot().unwrap().unwrap(),
    )
    .unwrap();

    catalog
        .apply_cmd(
            &WalCmd::AppendSegment {
                db: DEFAULT_DATABASE_NAME.to_string(),
                table: "docs".to_string(),
                segment_id: 0,
                row_count: 100,
            },
            3,
        )
        .unwrap();
    let d2_path = dir.join("delta.00003.ckp");
    write_checkpoint_file(
        &d2_path,
        false,
        3,
        &catalog.take_delta_snapshot().unwrap().unwrap(),
    )
    .unwrap();

    (
        FullCheckpointInfo {
            path: full_path,
            max_commit_ts: 1,
        },
        vec![
            DeltaCheckpointInfo {
                path: d1_path,
                max_commit_ts: 2,
            },
            DeltaCheckpointInfo {
                path: d2_path,
                max_commit_ts: 3,
            },
        ],
    )
}

// ============================================================================
// S1: fresh Writable bring-up, local storage, no prior WAL
// ============================================================================

#[test]
fn s1_fresh_writable_bring_up() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::for_testing(dir.path());
    config.compact_interval_secs = 10;
    let (controller, _gateway) = controller_with(config);

    assert_eq!(controller.get_mode(), StorageMode::UnInitialized);

    controller.set_mode(StorageMode::Admin).unwrap();
    let handles = controller.handles();
    assert!(handles.wal, "admin mode constructs the WAL manager");
    assert!(!handles.catalog && !handles.txn_mgr && !handles.buffer_mgr);

    controller.set_mode(StorageMode::Writable).unwrap();
    assert_eq!(controller.get_mode(), StorageMode::Writable);

    let handles = controller.handles();
    assert!(handles.wal);
    assert!(handles.catalog);
    assert!(handles.txn_mgr);
    assert!(handles.buffer_mgr);
    assert!(handles.bg_proc);
    assert!(handles.compact_proc);
    assert!(handles.mem_idx_tracer);
    assert!(handles.periodic_thread);
    assert!(handles.result_cache);
    assert!(!handles.persistence, "persistence disabled by empty dir");
    assert!(!handles.object_store_proc, "local storage has no gateway");

    // Replay found nothing, so the default database was created.
    let catalog = controller.catalog().unwrap();
    assert!(catalog.has_database(DEFAULT_DATABASE_NAME));
    assert_eq!(
        catalog.database_comment(DEFAULT_DATABASE_NAME).unwrap(),
        "Initial startup created"
    );

    // CompactInterval > 0 armed the compaction algorithm and started the
    // processor.
    assert!(catalog.compaction_initialized());
    assert!(controller.compact_processor_running());

    // The forced full checkpoint completed before set_mode returned.
    assert_eq!(controller.wal_counters().unwrap().checkpoints_full, 1);

    // ResultCache=on gates the accessor open.
    assert!(controller.result_cache_manager().is_some());

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

// ============================================================================
// S2: Readable two-phase bootstrap
// ============================================================================

#[test]
fn s2_reader_two_phase_bootstrap() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Readable).unwrap();

    // Phase1: only WAL, buffer manager, and result cache exist.
    assert_eq!(controller.get_mode(), StorageMode::Readable);
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase1);
    let handles = controller.handles();
    assert!(handles.wal && handles.buffer_mgr && handles.result_cache);
    assert!(!handles.catalog);
    assert!(!handles.txn_mgr);
    assert!(!handles.bg_proc);
    assert!(!handles.mem_idx_tracer);
    assert!(!handles.periodic_thread);
    assert!(!handles.compact_proc);

    // Log replication delivers a checkpoint chain; attach and continue.
    let (full, deltas) = make_checkpoint_chain(dir.path());
    controller.attach_catalog(&full, &deltas).unwrap();
    controller.continue_reader_bootstrap(42).unwrap();

    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase2);
    let handles = controller.handles();
    assert!(handles.bg_proc && handles.txn_mgr && handles.mem_idx_tracer);
    assert!(handles.periodic_thread);
    assert!(!handles.compact_proc, "readable never runs compaction");
    assert!(controller.bg_processor_running());
    assert_eq!(controller.periodic_trigger_names(), vec!["cleanup"]);

    // The attached catalog carries the replicated state.
    let catalog = controller.catalog().unwrap();
    assert!(catalog.has_database(DEFAULT_DATABASE_NAME));
    assert_eq!(
        catalog
            .table(DEFAULT_DATABASE_NAME, "docs")
            .unwrap()
            .segments
            .len(),
        1
    );

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

// ============================================================================
// S3: promotion Readable -> Writable
// ============================================================================

#[test]
fn s3_promote_reader_to_writable() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::for_testing(dir.path());
    config.compact_interval_secs = 10;
    let (controller, _gateway) = controller_with(config);

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Readable).unwrap();
    let (full, deltas) = make_checkpoint_chain(dir.path());
    controller.attach_catalog(&full, &deltas).unwrap();
    controller.continue_reader_bootstrap(42).unwrap();

    controller.set_mode(StorageMode::Writable).unwrap();

    assert_eq!(controller.get_mode(), StorageMode::Writable);
    assert!(controller.compact_processor_running());
    let triggers = controller.periodic_trigger_names();
    for name in [
        "full_checkpoint",
        "delta_checkpoint",
        "compact_segment",
        "optimize_index",
        "cleanup",
    ] {
        assert!(triggers.contains(&name), "missing trigger '{}'", name);
    }

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

// ============================================================================
// S4: remote-store init failure is recoverable
// ============================================================================

#[test]
fn s4_remote_init_failure_reverts_to_admin() {
    let dir = TempDir::new().unwrap();
    let (controller, gateway) = controller_with(remote_config(dir.path()));

    controller.set_mode(StorageMode::Admin).unwrap();

    gateway.fail_next_init();
    let err = controller.set_mode(StorageMode::Writable).unwrap_err();
    assert!(err.is_remote_store());

    // Observable state equals the pre-call state.
    assert_eq!(controller.get_mode(), StorageMode::Admin);
    let handles = controller.handles();
    assert!(handles.wal);
    assert!(!handles.buffer_mgr && !handles.object_store_proc && !handles.result_cache);
    assert_eq!(gateway.init_calls(), 1);
    assert_eq!(gateway.uninit_calls(), 1);

    // Retry with working credentials succeeds.
    controller.set_mode(StorageMode::Writable).unwrap();
    assert_eq!(controller.get_mode(), StorageMode::Writable);
    assert!(controller.handles().object_store_proc);
    assert_eq!(gateway.init_calls(), gateway.uninit_calls() + 1);

    controller.set_mode(StorageMode::UnInitialized).unwrap();
    assert_eq!(gateway.init_calls(), gateway.uninit_calls());
}

// ============================================================================
// S5: Writable self-transition is fatal
// ============================================================================

#[test]
#[should_panic(expected = "writable to writable")]
fn s5_writable_self_transition_is_fatal() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());
    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();
    let _ = controller.set_mode(StorageMode::Writable);
}

// ============================================================================
// S6: clean shutdown from Writable
// ============================================================================

#[test]
fn s6_clean_shutdown_from_writable() {
    let dir = TempDir::new().unwrap();
    let (controller, gateway) = controller_with(remote_config(dir.path()));

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();
    assert!(controller.bg_processor_running());

    controller.set_mode(StorageMode::UnInitialized).unwrap();

    assert_eq!(controller.get_mode(), StorageMode::UnInitialized);
    let handles = controller.handles();
    assert!(!handles.wal);
    assert!(!handles.catalog);
    assert!(!handles.txn_mgr);
    assert!(!handles.buffer_mgr);
    assert!(!handles.persistence);
    assert!(!handles.object_store_proc);
    assert!(!handles.bg_proc);
    assert!(!handles.compact_proc);
    assert!(!handles.mem_idx_tracer);
    assert!(!handles.periodic_thread);
    assert!(!handles.result_cache);
    assert!(handles.cleanup_tracer, "cleanup tracer survives teardown");

    assert!(!controller.bg_processor_running());
    assert!(!controller.compact_processor_running());
    assert_eq!(gateway.init_calls(), gateway.uninit_calls());
}

// ============================================================================
// Universal invariants
// ============================================================================

#[test]
fn idempotent_noop_constructs_nothing() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());

    controller.set_mode(StorageMode::Admin).unwrap();
    let before = controller.handles();
    controller.set_mode(StorageMode::Admin).unwrap();
    assert_eq!(controller.handles(), before);
    assert_eq!(controller.get_mode(), StorageMode::Admin);
}

#[test]
fn reader_phase_moves_forward_only() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());

    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::None);
    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Readable).unwrap();
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase1);

    let (full, deltas) = make_checkpoint_chain(dir.path());
    controller.attach_catalog(&full, &deltas).unwrap();
    controller.continue_reader_bootstrap(42).unwrap();
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase2);

    // Promotion leaves Readable; phase is no longer meaningful.
    controller.set_mode(StorageMode::Writable).unwrap();
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::None);

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

#[test]
#[should_panic(expected = "reader phase")]
fn teardown_of_phase1_reader_is_fatal() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());
    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Readable).unwrap();
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase1);
    // Tearing down before the bootstrap continuation is a misordered caller.
    let _ = controller.set_mode(StorageMode::UnInitialized);
}

#[test]
#[should_panic(expected = "illegal storage mode transition")]
fn uninit_to_writable_is_fatal() {
    let dir = TempDir::new().unwrap();
    let (controller, _gateway) = local_controller(dir.path());
    let _ = controller.set_mode(StorageMode::Writable);
}

#[test]
fn demotion_rebuilds_cleanup_only_periodic_thread() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::for_testing(dir.path());
    config.compact_interval_secs = 10;
    let (controller, _gateway) = controller_with(config);

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();
    assert!(controller.compact_processor_running());

    controller.set_mode(StorageMode::Readable).unwrap();
    assert_eq!(controller.get_mode(), StorageMode::Readable);
    assert_eq!(controller.reader_init_phase(), ReaderInitPhase::Phase2);
    assert!(!controller.handles().compact_proc);
    assert_eq!(controller.periodic_trigger_names(), vec!["cleanup"]);
    // The data plane stays live across demotion.
    let handles = controller.handles();
    assert!(handles.catalog && handles.txn_mgr && handles.buffer_mgr && handles.bg_proc);

    // A demoted node can still be torn down to Admin, which reconstructs a
    // fresh WAL manager.
    controller.set_mode(StorageMode::Admin).unwrap();
    let handles = controller.handles();
    assert!(handles.wal);
    assert!(!handles.catalog && !handles.txn_mgr && !handles.buffer_mgr && !handles.bg_proc);

    controller.set_mode(StorageMode::UnInitialized).unwrap();
    assert!(!controller.handles().wal);
}

#[test]
fn writable_state_survives_restart_via_replay() {
    let dir = TempDir::new().unwrap();

    {
        let (controller, _gateway) = local_controller(dir.path());
        controller.set_mode(StorageMode::Admin).unwrap();
        controller.set_mode(StorageMode::Writable).unwrap();
        assert!(controller
            .catalog()
            .unwrap()
            .has_database(DEFAULT_DATABASE_NAME));
        controller.set_mode(StorageMode::UnInitialized).unwrap();
    }

    // Second bring-up over the same directories: replay finds the
    // checkpointed catalog instead of creating a fresh one.
    let (controller, _gateway) = local_controller(dir.path());
    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();

    let catalog = controller.catalog().unwrap();
    assert!(catalog.has_database(DEFAULT_DATABASE_NAME));
    assert_eq!(
        catalog.database_comment(DEFAULT_DATABASE_NAME).unwrap(),
        "Initial startup created"
    );

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

#[test]
fn result_cache_accessor_gated_by_config() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::for_testing(dir.path());
    config.result_cache = false;
    let (controller, _gateway) = controller_with(config);

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();
    // The cache exists (constructed during bring-up) but the accessor is
    // gated off.
    assert!(controller.handles().result_cache);
    assert!(controller.result_cache_manager().is_none());

    controller.set_mode(StorageMode::UnInitialized).unwrap();
}

#[test]
fn persistence_manager_present_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::for_testing(dir.path());
    config.persistence_dir = dir.path().join("persist");
    let (controller, _gateway) = controller_with(config);

    controller.set_mode(StorageMode::Admin).unwrap();
    controller.set_mode(StorageMode::Writable).unwrap();
    assert!(controller.handles().persistence);

    controller.set_mode(StorageMode::UnInitialized).unwrap();
    assert!(!controller.handles().persistence);
}

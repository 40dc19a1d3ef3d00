//! The storage lifecycle controller.
//!
//! The controller drives the engine between four operating modes and, as a
//! side effect of each transition, constructs, wires, starts, and tears
//! down the subsystems everything else depends on:
//!
//! ```text
//!                 ┌──────────────┐
//!                 │ UnInitialized│
//!                 └──────┬───────┘
//!                        │  construct WAL manager (not started)
//!                 ┌──────▼───────┐
//!                 │    Admin     │
//!                 └──────┬───────┘
//!          bring-up      │      bring-up (two-phase)
//!        ┌───────────────┴───────────────┐
//!  ┌─────▼─────┐      promote      ┌─────▼─────┐
//!  │  Writable │ ◄───────────────► │  Readable │
//!  └───────────┘      demote       └───────────┘
//! ```
//!
//! Readable bring-up pauses after the buffer manager starts (`Phase1`) and
//! waits for external log replication to deliver a checkpoint; catalog and
//! transaction wiring happen later through
//! [`StorageController::continue_reader_bootstrap`] (`Phase2`).
//!
//! # Error taxonomy
//!
//! Remote-store initialization failure is recoverable: the transition
//! reverts to Admin and returns the error. Every lifecycle-invariant
//! violation (a handle already present where the transition logic expects
//! it absent, a wrong reader phase at teardown, a self-transition reaching
//! the dispatch matrix) is a programmer error and panics with a message
//! naming the offending mode and handle.
//!
//! # Locking
//!
//! Two locks: `transition` is held for the whole of `set_mode` (and the
//! reader continuation), so concurrent transitions serialize; `state`
//! guards `mode`/`reader_phase` and is held only for the brief duration of
//! a read. Once `set_mode` returns Ok, every handle required by the target
//! mode is constructed, started, and visible.
//!
//! # Teardown ordering
//!
//! Periodic triggers stop first (no new work enqueued), then the active
//! processors (background, compaction, object-store) so in-flight work
//! drains, then the data-plane managers (catalog, mem-index tracer, WAL,
//! transactions, buffer), and finally persistence and the result cache.
//! Stopping the buffer manager before the transaction manager would let
//! drained work issue reads against a dead cache.

use crate::background::{BgTask, BgTaskProcessor};
use crate::cleanup::CleanupTracer;
use crate::compaction::CompactionProcessor;
use crate::memindex::MemIndexTracer;
use crate::object_proc::ObjectStoreProcess;
use crate::periodic::{
    CheckpointTrigger, CleanupTrigger, CompactSegmentTrigger, OptimizeIndexTrigger,
    PeriodicTrigger, PeriodicTriggerThread,
};
use keel_catalog::{register_builtin_functions, Catalog};
use keel_concurrency::TxnManager;
use keel_core::config::DEFAULT_DATABASE_NAME;
use keel_core::{
    KeelResult, ReaderInitPhase, StorageConfig, StorageMode, StorageType, TxnTimeStamp,
};
use keel_durability::{DeltaCheckpointInfo, FullCheckpointInfo, WalCmd, WalCounters, WalManager};
use keel_storage::{BufferManager, ObjectStoreGateway, PersistenceManager, ResultCacheManager};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Which owned handles are currently present. Introspection for embedders
/// and tests; presence is exactly the lifecycle invariant surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlePresence {
    pub wal: bool,
    pub catalog: bool,
    pub txn_mgr: bool,
    pub buffer_mgr: bool,
    pub persistence: bool,
    pub object_store_proc: bool,
    pub bg_proc: bool,
    pub compact_proc: bool,
    pub mem_idx_tracer: bool,
    pub periodic_thread: bool,
    pub result_cache: bool,
    pub cleanup_tracer: bool,
}

struct ModeState {
    mode: StorageMode,
    reader_phase: ReaderInitPhase,
}

#[derive(Default)]
struct Components {
    wal: Option<Arc<WalManager>>,
    catalog: Option<Arc<Catalog>>,
    txn_mgr: Option<Arc<TxnManager>>,
    buffer_mgr: Option<Arc<BufferManager>>,
    persistence: Option<Arc<PersistenceManager>>,
    object_store_proc: Option<Arc<ObjectStoreProcess>>,
    bg_proc: Option<Arc<BgTaskProcessor>>,
    compact_proc: Option<Arc<CompactionProcessor>>,
    mem_idx_tracer: Option<Arc<MemIndexTracer>>,
    periodic_thread: Option<Arc<PeriodicTriggerThread>>,
    result_cache: Option<Arc<ResultCacheManager>>,
    cleanup_tracer: Option<Arc<CleanupTracer>>,
}

fn assert_absent<T>(handle: &Option<T>, name: &str, mode: StorageMode) {
    if handle.is_some() {
        panic!("{} was initialized before (mode {})", name, mode);
    }
}

/// The mode state machine and wiring policy over the engine's subsystems.
pub struct StorageController {
    config: Arc<StorageConfig>,
    gateway: Arc<dyn ObjectStoreGateway>,
    /// Held across every transition; serializes `set_mode` and the reader
    /// bootstrap continuation.
    transition: Mutex<()>,
    /// Brief-hold lock for mode reads on the query path.
    state: Mutex<ModeState>,
    comps: Mutex<Components>,
}

impl StorageController {
    /// The controller starts in UnInitialized mode with no subsystems.
    ///
    /// The gateway is the injected remote object-store handle; for
    /// `StorageType::Local` configs it is never touched.
    pub fn new(config: Arc<StorageConfig>, gateway: Arc<dyn ObjectStoreGateway>) -> Self {
        StorageController {
            config,
            gateway,
            transition: Mutex::new(()),
            state: Mutex::new(ModeState {
                mode: StorageMode::UnInitialized,
                reader_phase: ReaderInitPhase::None,
            }),
            comps: Mutex::new(Components::default()),
        }
    }

    // ========================================================================
    // Mode reads
    // ========================================================================

    pub fn get_mode(&self) -> StorageMode {
        self.state.lock().mode
    }

    pub fn reader_init_phase(&self) -> ReaderInitPhase {
        self.state.lock().reader_phase
    }

    fn set_state(&self, mode: StorageMode, reader_phase: ReaderInitPhase) {
        let mut state = self.state.lock();
        state.mode = mode;
        state.reader_phase = reader_phase;
    }

    // ========================================================================
    // set_mode: the transition matrix
    // ========================================================================

    /// Drive the engine to `target` mode.
    ///
    /// Idempotent when `target` equals the current mode (warn + Ok, no
    /// handles constructed or dropped), except Writable -> Writable, which
    /// is fatal. Recoverable failures (remote-store init, disk errors
    /// during bring-up) revert to the Admin state and return the error.
    /// Illegal transitions panic.
    pub fn set_mode(&self, target: StorageMode) -> KeelResult<()> {
        let _transition = self.transition.lock();

        let current = self.get_mode();
        if current == target {
            // Writable is the one self-transition that stays fatal: a
            // writable node asking to become writable means its caller lost
            // track of the lifecycle, and hiding that would leak resources.
            if current == StorageMode::Writable {
                panic!("attempt to set storage mode from writable to writable");
            }
            warn!(target: "keel::storage", mode = %current, "set unchanged storage mode");
            return Ok(());
        }

        let mut comps = self.comps.lock();
        // Every transition gets a fresh cleanup record, demotion included.
        comps.cleanup_tracer = Some(Arc::new(CleanupTracer::new()));

        match (current, target) {
            (StorageMode::UnInitialized, StorageMode::Admin) => {
                self.uninit_to_admin(&mut comps);
                Ok(())
            }
            (StorageMode::UnInitialized, _) => panic!(
                "illegal storage mode transition {} -> {}",
                current, target
            ),

            (StorageMode::Admin, StorageMode::UnInitialized) => {
                self.admin_to_uninit(&mut comps);
                Ok(())
            }
            (StorageMode::Admin, StorageMode::Readable)
            | (StorageMode::Admin, StorageMode::Writable) => {
                self.admin_to_serving(&mut comps, target)
            }

            (StorageMode::Readable, StorageMode::UnInitialized)
            | (StorageMode::Readable, StorageMode::Admin) => {
                self.serving_teardown(&mut comps, StorageMode::Readable, target);
                Ok(())
            }
            (StorageMode::Readable, StorageMode::Writable) => {
                self.promote_reader(&mut comps);
                Ok(())
            }

            (StorageMode::Writable, StorageMode::UnInitialized)
            | (StorageMode::Writable, StorageMode::Admin) => {
                self.serving_teardown(&mut comps, StorageMode::Writable, target);
                Ok(())
            }
            (StorageMode::Writable, StorageMode::Readable) => {
                self.demote_writer(&mut comps);
                Ok(())
            }

            // Unreachable through the public API (the equality check above
            // short-circuits); kept as a guard against refactors.
            (StorageMode::Admin, StorageMode::Admin)
            | (StorageMode::Readable, StorageMode::Readable)
            | (StorageMode::Writable, StorageMode::Writable) => panic!(
                "self transition {} -> {} reached the dispatch matrix",
                current, target
            ),
        }
    }

    fn new_wal_manager(&self) -> Arc<WalManager> {
        Arc::new(WalManager::new(
            self.config.wal_dir.clone(),
            self.config.data_dir.clone(),
            self.config.wal_compact_threshold,
            self.config.delta_checkpoint_threshold,
            self.config.flush_method_at_commit,
        ))
    }

    // ------------------------------------------------------------------------
    // UnInitialized <-> Admin
    // ------------------------------------------------------------------------

    fn uninit_to_admin(&self, comps: &mut Components) {
        self.set_state(StorageMode::Admin, ReaderInitPhase::None);
        assert_absent(&comps.wal, "WAL manager", StorageMode::Admin);
        // Constructed only; the WAL starts after the transaction manager in
        // a later bring-up.
        comps.wal = Some(self.new_wal_manager());
        info!(target: "keel::storage", "storage set from un-init mode to admin");
    }

    fn admin_to_uninit(&self, comps: &mut Components) {
        comps.wal = None;
        self.set_state(StorageMode::UnInitialized, ReaderInitPhase::None);
        info!(target: "keel::storage", "storage set from admin mode to un-init");
    }

    // ------------------------------------------------------------------------
    // Admin -> {Readable, Writable}
    // ------------------------------------------------------------------------

    fn admin_to_serving(&self, comps: &mut Components, target: StorageMode) -> KeelResult<()> {
        self.set_state(target, ReaderInitPhase::None);

        let mut remote_inited = false;
        if self.config.storage_type == StorageType::Remote {
            if self.gateway.is_init() {
                panic!("remote object store was initialized before (mode {})", target);
            }
            info!(
                target: "keel::storage",
                url = %self.config.object_store.url,
                "initializing remote object store"
            );
            if let Err(e) = self.gateway.init(&self.config.object_store) {
                self.set_state(StorageMode::Admin, ReaderInitPhase::None);
                let _ = self.gateway.uninit();
                return Err(e);
            }
            remote_inited = true;

            assert_absent(&comps.object_store_proc, "object storage processor", target);
            let proc = Arc::new(ObjectStoreProcess::new(Arc::clone(&self.gateway)));
            proc.start();
            comps.object_store_proc = Some(proc);
        }

        if let Err(e) = self.serving_bring_up(comps, target) {
            warn!(target: "keel::storage", mode = %target, error = %e, "bring-up failed, reverting to admin");
            self.revert_serving_bring_up(comps, remote_inited);
            self.set_state(StorageMode::Admin, ReaderInitPhase::None);
            return Err(e);
        }
        Ok(())
    }

    fn serving_bring_up(&self, comps: &mut Components, target: StorageMode) -> KeelResult<()> {
        if self.config.persistence_enabled() {
            assert_absent(&comps.persistence, "persistence manager", target);
            comps.persistence = Some(Arc::new(PersistenceManager::new(
                self.config.persistence_dir.clone(),
                self.config.data_dir.clone(),
                self.config.persistence_object_size_limit,
            )?));
        }

        // Reused across demotions and promotions within the same process;
        // only constructed when absent.
        if comps.result_cache.is_none() {
            comps.result_cache = Some(Arc::new(ResultCacheManager::new(
                self.config.cache_result_num,
            )));
        }

        assert_absent(&comps.buffer_mgr, "buffer manager", target);
        let buffer = Arc::new(BufferManager::new(
            self.config.buffer_manager_size,
            self.config.data_dir.clone(),
            self.config.temp_dir.clone(),
            comps.persistence.clone(),
            self.config.lru_num,
        ));
        buffer.start()?;
        comps.buffer_mgr = Some(Arc::clone(&buffer));

        if target == StorageMode::Readable {
            // Bootstrap pauses here; catalog and transactions are wired by
            // continue_reader_bootstrap once log replication delivers a
            // checkpoint.
            self.set_state(StorageMode::Readable, ReaderInitPhase::Phase1);
            info!(
                target: "keel::storage",
                "no checkpoint in reader mode, waiting for log replication"
            );
            return Ok(());
        }

        let wal = comps
            .wal
            .clone()
            .unwrap_or_else(|| panic!("WAL manager absent during bring-up (mode {})", target));
        let replay = wal.replay(target)?;
        let system_start_ts = replay.system_start_ts;

        assert_absent(&comps.catalog, "catalog", target);
        let catalog = if system_start_ts == 0 {
            info!(target: "keel::storage", "initializing a fresh catalog");
            Arc::new(Catalog::new())
        } else {
            Arc::new(Catalog::restore_from_replay(&replay, &buffer)?)
        };
        comps.catalog = Some(Arc::clone(&catalog));

        if self.config.compact_interval() > 0 {
            catalog.init_compaction_alg(system_start_ts);
        } else {
            info!(target: "keel::storage", "skip compaction algorithm init");
        }

        self.wire_writable_tail(comps, system_start_ts)
    }

    /// The tail of the Writable bring-up: builtins, background processor,
    /// transactions, WAL start, default database, tracer, compaction,
    /// memory-index recovery, periodic triggers, forced checkpoint. The
    /// Readable counterpart of this wiring lives in
    /// `continue_reader_bootstrap`.
    fn wire_writable_tail(
        &self,
        comps: &mut Components,
        system_start_ts: TxnTimeStamp,
    ) -> KeelResult<()> {
        let target = StorageMode::Writable;
        let wal = comps.wal.clone().expect("WAL manager present");
        let catalog = comps.catalog.clone().expect("catalog present");
        let buffer = comps.buffer_mgr.clone().expect("buffer manager present");

        register_builtin_functions(&catalog);

        assert_absent(&comps.bg_proc, "background task processor", target);
        let bg = Arc::new(BgTaskProcessor::new(Arc::clone(&wal), Arc::clone(&catalog)));
        if let Some(tracer) = &comps.cleanup_tracer {
            bg.set_cleanup_tracer(Arc::clone(tracer));
        }
        comps.bg_proc = Some(Arc::clone(&bg));

        assert_absent(&comps.txn_mgr, "transaction manager", target);
        let txn_mgr = Arc::new(TxnManager::new(
            Arc::clone(&buffer),
            Arc::clone(&wal),
            system_start_ts,
        ));
        txn_mgr.start();
        comps.txn_mgr = Some(Arc::clone(&txn_mgr));

        // The WAL starts strictly after the transaction manager, which it
        // depends on.
        wal.start()?;

        if system_start_ts == 0 {
            Self::create_default_db(&txn_mgr, &catalog);
        }

        assert_absent(&comps.mem_idx_tracer, "memory index tracer", target);
        comps.mem_idx_tracer = Some(Arc::new(MemIndexTracer::new(
            self.config.mem_index_memory_quota,
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        )));

        bg.start();

        assert_absent(&comps.compact_proc, "compaction processor", target);
        let compact = Arc::new(CompactionProcessor::new(
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        ));
        compact.start();
        comps.compact_proc = Some(Arc::clone(&compact));

        // Recover memory indexes after the compaction processor is live.
        catalog.start_memory_index_commit();
        catalog.mem_index_recover(&buffer, system_start_ts)?;

        assert_absent(&comps.periodic_thread, "periodic trigger thread", target);
        let cleanup_trigger = Arc::new(CleanupTrigger::new(
            self.config.cleanup_interval(),
            Arc::clone(&bg),
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        ));
        let triggers: Vec<Arc<dyn PeriodicTrigger>> = vec![
            Arc::new(CheckpointTrigger::new(
                self.config.full_checkpoint_interval(),
                true,
                Arc::clone(&bg),
            )),
            Arc::new(CheckpointTrigger::new(
                self.config.delta_checkpoint_interval(),
                false,
                Arc::clone(&bg),
            )),
            Arc::new(CompactSegmentTrigger::new(
                self.config.compact_interval(),
                Arc::clone(&compact),
            )),
            Arc::new(OptimizeIndexTrigger::new(
                self.config.optimize_index_interval(),
                compact,
            )),
            cleanup_trigger.clone() as Arc<dyn PeriodicTrigger>,
        ];
        let periodic = Arc::new(PeriodicTriggerThread::new(triggers));
        bg.set_cleanup_trigger(cleanup_trigger);
        comps.periodic_thread = Some(Arc::clone(&periodic));

        // Force a full checkpoint before declaring the node writable; the
        // wait ensures the checkpoint exists when set_mode returns.
        let txn = txn_mgr.begin_txn("force checkpoint")?;
        let ticket = bg.submit(BgTask::Checkpoint {
            is_full: true,
            force: true,
        })?;
        ticket.wait()?;
        txn_mgr.commit_txn(txn, &catalog)?;

        periodic.start();
        info!(target: "keel::storage", mode = %target, system_start_ts, "storage bring-up complete");
        Ok(())
    }

    /// Undo a partially completed bring-up, leaving the Admin-mode state:
    /// a freshly constructed WAL manager and nothing else.
    fn revert_serving_bring_up(&self, comps: &mut Components, remote_inited: bool) {
        if let Some(periodic) = comps.periodic_thread.take() {
            periodic.stop();
        }
        if let Some(compact) = comps.compact_proc.take() {
            compact.stop();
        }
        if let Some(bg) = comps.bg_proc.take() {
            bg.stop();
        }
        comps.catalog = None;
        comps.mem_idx_tracer = None;
        if let Some(wal) = &comps.wal {
            wal.stop(); // safe even if start() never ran
        }
        if remote_inited {
            if let Some(proc) = comps.object_store_proc.take() {
                proc.stop();
            }
            let _ = self.gateway.uninit();
        }
        if let Some(txn_mgr) = comps.txn_mgr.take() {
            txn_mgr.stop();
        }
        if let Some(buffer) = comps.buffer_mgr.take() {
            buffer.stop();
        }
        comps.persistence = None;
        comps.result_cache = None;
        // Stop does not reset every WAL field; Admin expects a fresh,
        // unstarted manager.
        comps.wal = Some(self.new_wal_manager());
    }

    // ------------------------------------------------------------------------
    // Reader bootstrap continuation
    // ------------------------------------------------------------------------

    /// Finish the Readable bring-up once log replication has delivered a
    /// checkpoint and the catalog was attached.
    ///
    /// Performs the deferred wiring (builtins, background processor,
    /// transaction manager, WAL start, memory-index tracer and recovery,
    /// cleanup-only periodic thread) and moves the reader phase to Phase2.
    pub fn continue_reader_bootstrap(&self, system_start_ts: TxnTimeStamp) -> KeelResult<()> {
        let _transition = self.transition.lock();
        {
            let state = self.state.lock();
            if state.mode != StorageMode::Readable {
                panic!(
                    "reader bootstrap continuation in mode {}, expected readable",
                    state.mode
                );
            }
            if state.reader_phase != ReaderInitPhase::Phase1 {
                panic!(
                    "reader bootstrap continuation in phase {}, expected phase1",
                    state.reader_phase
                );
            }
        }

        let mut comps = self.comps.lock();
        let wal = comps
            .wal
            .clone()
            .unwrap_or_else(|| panic!("WAL manager absent at reader bootstrap continuation"));
        let catalog = comps
            .catalog
            .clone()
            .unwrap_or_else(|| panic!("catalog absent at reader bootstrap continuation"));
        let buffer = comps
            .buffer_mgr
            .clone()
            .unwrap_or_else(|| panic!("buffer manager absent at reader bootstrap continuation"));

        register_builtin_functions(&catalog);

        assert_absent(&comps.bg_proc, "background task processor", StorageMode::Readable);
        let bg = Arc::new(BgTaskProcessor::new(Arc::clone(&wal), Arc::clone(&catalog)));
        if let Some(tracer) = &comps.cleanup_tracer {
            bg.set_cleanup_tracer(Arc::clone(tracer));
        }
        comps.bg_proc = Some(Arc::clone(&bg));

        assert_absent(&comps.txn_mgr, "transaction manager", StorageMode::Readable);
        let txn_mgr = Arc::new(TxnManager::new(
            Arc::clone(&buffer),
            Arc::clone(&wal),
            system_start_ts,
        ));
        txn_mgr.start();
        comps.txn_mgr = Some(Arc::clone(&txn_mgr));

        wal.start()?;

        assert_absent(&comps.mem_idx_tracer, "memory index tracer", StorageMode::Readable);
        comps.mem_idx_tracer = Some(Arc::new(MemIndexTracer::new(
            self.config.mem_index_memory_quota,
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        )));

        catalog.start_memory_index_commit();
        catalog.mem_index_recover(&buffer, system_start_ts)?;

        bg.start();

        assert_absent(&comps.periodic_thread, "periodic trigger thread", StorageMode::Readable);
        let cleanup_trigger = Arc::new(CleanupTrigger::new(
            self.config.cleanup_interval(),
            Arc::clone(&bg),
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        ));
        let periodic = Arc::new(PeriodicTriggerThread::new(vec![
            cleanup_trigger.clone() as Arc<dyn PeriodicTrigger>
        ]));
        bg.set_cleanup_trigger(cleanup_trigger);
        comps.periodic_thread = Some(Arc::clone(&periodic));
        periodic.start();

        self.set_state(StorageMode::Readable, ReaderInitPhase::Phase2);
        info!(target: "keel::storage", system_start_ts, "reader bootstrap complete");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Readable <-> Writable
    // ------------------------------------------------------------------------

    fn promote_reader(&self, comps: &mut Components) {
        if self.reader_init_phase() != ReaderInitPhase::Phase2 {
            panic!(
                "promotion of readable storage in reader phase {}",
                self.reader_init_phase()
            );
        }
        let catalog = comps
            .catalog
            .clone()
            .unwrap_or_else(|| panic!("catalog absent at reader promotion"));
        let txn_mgr = comps
            .txn_mgr
            .clone()
            .unwrap_or_else(|| panic!("transaction manager absent at reader promotion"));
        let bg = comps
            .bg_proc
            .clone()
            .unwrap_or_else(|| panic!("background task processor absent at reader promotion"));

        assert_absent(&comps.compact_proc, "compaction processor", StorageMode::Writable);
        let compact = Arc::new(CompactionProcessor::new(
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        ));
        compact.start();
        comps.compact_proc = Some(Arc::clone(&compact));

        // Rebuild the periodic thread with the Writable trigger set.
        if let Some(periodic) = comps.periodic_thread.take() {
            periodic.stop();
        }
        let cleanup_trigger = bg.cleanup_trigger().unwrap_or_else(|| {
            Arc::new(CleanupTrigger::new(
                self.config.cleanup_interval(),
                Arc::clone(&bg),
                Arc::clone(&catalog),
                Arc::clone(&txn_mgr),
            ))
        });
        let triggers: Vec<Arc<dyn PeriodicTrigger>> = vec![
            Arc::new(CheckpointTrigger::new(
                self.config.full_checkpoint_interval(),
                true,
                Arc::clone(&bg),
            )),
            Arc::new(CheckpointTrigger::new(
                self.config.delta_checkpoint_interval(),
                false,
                Arc::clone(&bg),
            )),
            Arc::new(CompactSegmentTrigger::new(
                self.config.compact_interval(),
                Arc::clone(&compact),
            )),
            Arc::new(OptimizeIndexTrigger::new(
                self.config.optimize_index_interval(),
                compact,
            )),
            cleanup_trigger.clone() as Arc<dyn PeriodicTrigger>,
        ];
        let periodic = Arc::new(PeriodicTriggerThread::new(triggers));
        bg.set_cleanup_trigger(cleanup_trigger);
        periodic.start();
        comps.periodic_thread = Some(periodic);

        self.set_state(StorageMode::Writable, ReaderInitPhase::None);
        info!(target: "keel::storage", "storage promoted from readable to writable");
    }

    fn demote_writer(&self, comps: &mut Components) {
        if let Some(periodic) = comps.periodic_thread.take() {
            periodic.stop();
        }
        if let Some(compact) = comps.compact_proc.take() {
            compact.stop();
        }

        let bg = comps
            .bg_proc
            .clone()
            .unwrap_or_else(|| panic!("background task processor absent at writer demotion"));
        let catalog = comps
            .catalog
            .clone()
            .unwrap_or_else(|| panic!("catalog absent at writer demotion"));
        let txn_mgr = comps
            .txn_mgr
            .clone()
            .unwrap_or_else(|| panic!("transaction manager absent at writer demotion"));

        // Rebuild the periodic thread carrying only the cleanup trigger.
        let cleanup_trigger = Arc::new(CleanupTrigger::new(
            self.config.cleanup_interval(),
            Arc::clone(&bg),
            catalog,
            txn_mgr,
        ));
        let periodic = Arc::new(PeriodicTriggerThread::new(vec![
            cleanup_trigger.clone() as Arc<dyn PeriodicTrigger>
        ]));
        bg.set_cleanup_trigger(cleanup_trigger);
        periodic.start();
        comps.periodic_thread = Some(periodic);

        // A demoted writer has its full data plane wired, which is exactly
        // the Phase2 reader state.
        self.set_state(StorageMode::Readable, ReaderInitPhase::Phase2);
        info!(target: "keel::storage", "storage demoted from writable to readable");
    }

    // ------------------------------------------------------------------------
    // Teardown to UnInitialized / Admin
    // ------------------------------------------------------------------------

    fn serving_teardown(&self, comps: &mut Components, from: StorageMode, target: StorageMode) {
        if from == StorageMode::Readable {
            // A Phase1 reader has no periodic/bg/txn wiring; tearing one
            // down signals a misordered external caller.
            let phase = self.reader_init_phase();
            if phase != ReaderInitPhase::Phase2 {
                panic!("teardown of readable storage in reader phase {}", phase);
            }
            if comps.compact_proc.is_some() {
                panic!("compaction processor present in readable mode teardown");
            }
        }

        // Periodic triggers first, so no new work is enqueued.
        if let Some(periodic) = comps.periodic_thread.take() {
            periodic.stop();
        }
        // Active processors next, draining in-flight work.
        if let Some(compact) = comps.compact_proc.take() {
            compact.stop();
        }
        if let Some(bg) = comps.bg_proc.take() {
            bg.stop();
        }
        // Data-plane managers.
        comps.catalog = None;
        comps.mem_idx_tracer = None;
        if let Some(wal) = comps.wal.take() {
            wal.stop();
        }
        if self.config.storage_type == StorageType::Remote {
            if let Some(proc) = comps.object_store_proc.take() {
                proc.stop();
                let _ = self.gateway.uninit();
            }
        }
        if let Some(txn_mgr) = comps.txn_mgr.take() {
            txn_mgr.stop();
        }
        // Buffer before persistence: the buffer holds the only persistence
        // handle and spills dirty pages into it on stop.
        if let Some(buffer) = comps.buffer_mgr.take() {
            buffer.stop();
        }
        comps.persistence = None;
        comps.result_cache = None;

        if target == StorageMode::Admin {
            // Stop does not reset every WAL field; reconstruct the manager
            // so Admin holds a fresh, unstarted one.
            comps.wal = Some(self.new_wal_manager());
        }

        self.set_state(target, ReaderInitPhase::None);
        info!(target: "keel::storage", from = %from, to = %target, "storage torn down");
    }

    // ========================================================================
    // Catalog attach operations (reader bootstrap support)
    // ========================================================================

    /// Construct the catalog from a full checkpoint plus delta checkpoints,
    /// loaded through the buffer manager.
    pub fn attach_catalog(
        &self,
        full: &FullCheckpointInfo,
        deltas: &[DeltaCheckpointInfo],
    ) -> KeelResult<()> {
        let mut comps = self.comps.lock();
        assert_absent(&comps.catalog, "catalog", self.get_mode());
        let buffer = comps
            .buffer_mgr
            .clone()
            .unwrap_or_else(|| panic!("buffer manager absent during catalog attach"));
        comps.catalog = Some(Arc::new(Catalog::load_from_files(full, deltas, &buffer)?));
        Ok(())
    }

    /// Construct the catalog from a single full checkpoint file.
    pub fn load_full_checkpoint(&self, path: &Path) -> KeelResult<()> {
        let mut comps = self.comps.lock();
        if comps.catalog.is_some() {
            panic!("catalog was already initialized before (mode {})", self.get_mode());
        }
        comps.catalog = Some(Arc::new(Catalog::load_full_checkpoint(path)?));
        Ok(())
    }

    /// Append one delta checkpoint to the existing catalog.
    pub fn attach_delta_checkpoint(&self, path: &Path) -> KeelResult<()> {
        let comps = self.comps.lock();
        let catalog = comps
            .catalog
            .clone()
            .unwrap_or_else(|| panic!("catalog absent during delta checkpoint attach"));
        catalog.attach_delta_checkpoint(path)
    }

    /// Create the well-known default database. Fatal on failure.
    pub fn create_default_database(&self) {
        let comps = self.comps.lock();
        let txn_mgr = comps
            .txn_mgr
            .clone()
            .unwrap_or_else(|| panic!("transaction manager absent at default database creation"));
        let catalog = comps
            .catalog
            .clone()
            .unwrap_or_else(|| panic!("catalog absent at default database creation"));
        drop(comps);
        Self::create_default_db(&txn_mgr, &catalog);
    }

    fn create_default_db(txn_mgr: &Arc<TxnManager>, catalog: &Arc<Catalog>) {
        let mut txn = txn_mgr
            .begin_txn("create default database")
            .unwrap_or_else(|e| panic!("cannot initialize '{}': {}", DEFAULT_DATABASE_NAME, e));
        txn.add_cmd(WalCmd::CreateDatabase {
            name: DEFAULT_DATABASE_NAME.to_string(),
            comment: "Initial startup created".to_string(),
        });
        if let Err(e) = txn_mgr.commit_txn(txn, catalog) {
            panic!("cannot initialize '{}': {}", DEFAULT_DATABASE_NAME, e);
        }
        info!(target: "keel::storage", db = DEFAULT_DATABASE_NAME, "default database created");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The result cache, only when the config enables it.
    pub fn result_cache_manager(&self) -> Option<Arc<ResultCacheManager>> {
        if !self.config.result_cache {
            return None;
        }
        self.comps.lock().result_cache.clone()
    }

    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.comps.lock().catalog.clone()
    }

    pub fn cleanup_tracer(&self) -> Option<Arc<CleanupTracer>> {
        self.comps.lock().cleanup_tracer.clone()
    }

    pub fn wal_counters(&self) -> Option<WalCounters> {
        self.comps.lock().wal.as_ref().map(|w| w.counters())
    }

    /// Names of the triggers installed on the current periodic thread.
    pub fn periodic_trigger_names(&self) -> Vec<&'static str> {
        self.comps
            .lock()
            .periodic_thread
            .as_ref()
            .map(|p| p.trigger_names())
            .unwrap_or_default()
    }

    pub fn bg_processor_running(&self) -> bool {
        self.comps
            .lock()
            .bg_proc
            .as_ref()
            .map(|b| b.is_running())
            .unwrap_or(false)
    }

    pub fn compact_processor_running(&self) -> bool {
        self.comps
            .lock()
            .compact_proc
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false)
    }

    pub fn txn_active_count(&self) -> usize {
        self.comps
            .lock()
            .txn_mgr
            .as_ref()
            .map(|t| t.active_txn_count())
            .unwrap_or(0)
    }

    /// Which handles are present; the lifecycle-invariant surface.
    pub fn handles(&self) -> HandlePresence {
        let comps = self.comps.lock();
        HandlePresence {
            wal: comps.wal.is_some(),
            catalog: comps.catalog.is_some(),
            txn_mgr: comps.txn_mgr.is_some(),
            buffer_mgr: comps.buffer_mgr.is_some(),
            persistence: comps.persistence.is_some(),
            object_store_proc: comps.object_store_proc.is_some(),
            bg_proc: comps.bg_proc.is_some(),
            compact_proc: comps.compact_proc.is_some(),
            mem_idx_tracer: comps.mem_idx_tracer.is_some(),
            periodic_thread: comps.periodic_thread.is_some(),
            result_cache: comps.result_cache.is_some(),
            cleanup_tracer: comps.cleanup_tracer.is_some(),
        }
    }
}

impl Drop for StorageController {
    fn drop(&mut self) {
        let mode = self.get_mode();
        if mode != StorageMode::UnInitialized {
            warn!(
                target: "keel::storage",
                mode = %mode,
                "storage controller dropped without teardown to un-init"
            );
        }
    }
}

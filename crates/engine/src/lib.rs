pub mod cache;
pub mod config;
pub mod error;
pub mod journal;
pub mod reconcile;
pub mod remote;
pub mod snapshot;
pub mod transfer;

pub use cache::{CachedView, CollectionCache, SharedCache};
pub use config::{EngineConfig, ReconcileMode};
pub use error::{EngineError, Severity, TransferError, ValidationError};
pub use journal::{JournalEntry, TransferJournal};
pub use reconcile::ViewRegistry;
pub use remote::{CustodyRemote, PageChunk, RemoteError, RemoteErrorKind, ServerRecord, ViewLoader};
pub use snapshot::{AppliedPatch, RollbackReport, SnapshotHandle, SnapshotManager};
pub use transfer::{AcceptAll, AcceptancePolicy, TransferReceipt, TransferState};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use custody_core::{
    CorrelationId, CustodyRow, InsertPosition, Parcel, PoolKey, TrackingCode, View, ViewKey,
};

use crate::transfer::{InFlight, Pending};

/// Everything guarded by the engine lock. Taken before the cache lock.
#[derive(Debug)]
struct EngineState {
    snapshots: SnapshotManager,
    registry: ViewRegistry,
    in_flight: BTreeMap<TrackingCode, InFlight>,
    /// Bumped whenever a settled transfer changes what the server holds
    /// for a pool; a load that straddles a bump is kept stale.
    generations: BTreeMap<PoolKey, u64>,
    journal: TransferJournal,
}

impl EngineState {
    fn generation(&self, pool: &PoolKey) -> u64 {
        self.generations.get(pool).copied().unwrap_or(0)
    }

    fn bump_generation(&mut self, pool: &PoolKey) {
        *self.generations.entry(pool.clone()).or_insert(0) += 1;
    }

    fn record(&mut self, pending: &Pending, state: TransferState, error: Option<&TransferError>) {
        self.journal.push(JournalEntry {
            correlation_id: pending.correlation_id,
            tracking_code: pending.tracking_code.clone(),
            from: pending.from.clone(),
            to: pending.to.clone(),
            state,
            error_kind: error.map(TransferError::kind_str),
        });
    }

    /// Remove the in-flight entry, but only if it still belongs to `pending`.
    fn take_in_flight(&mut self, pending: &Pending) -> Option<InFlight> {
        match self.in_flight.get(&pending.tracking_code) {
            Some(flight) if flight.correlation_id == pending.correlation_id => {
                self.in_flight.remove(&pending.tracking_code)
            }
            _ => None,
        }
    }
}

/// Moves parcels between pools with optimistic cache updates.
///
/// Cheap to clone; clones share the cache, the busy set and the snapshots.
#[derive(Clone)]
pub struct TransferEngine {
    cache: SharedCache,
    state: Arc<Mutex<EngineState>>,
    remote: Arc<dyn CustodyRemote>,
    policy: Arc<dyn AcceptancePolicy>,
    config: EngineConfig,
}

impl TransferEngine {
    /// An engine over `cache` that accepts every destination. Engines
    /// built over clones of one `SharedCache` see each other's patches.
    pub fn new(cache: SharedCache, remote: Arc<dyn CustodyRemote>) -> Self {
        let config = EngineConfig::default();
        Self {
            cache,
            state: Arc::new(Mutex::new(EngineState {
                snapshots: SnapshotManager::new(),
                registry: ViewRegistry::new(),
                in_flight: BTreeMap::new(),
                generations: BTreeMap::new(),
                journal: TransferJournal::new(config.journal_depth),
            })),
            remote,
            policy: Arc::new(AcceptAll),
            config,
        }
    }

    /// Consult `policy` before any transfer touches the cache.
    pub fn with_policy(mut self, policy: Arc<dyn AcceptancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the journal, so call before any transfer.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.lock_state().journal = TransferJournal::new(config.journal_depth);
        self.config = config;
        self
    }

    /// The shared cache behind every view this engine patches.
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Settings fixed at construction.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_position(&self, state: &EngineState, pool: &PoolKey, view: &ViewKey) -> InsertPosition {
        state
            .registry
            .insert_position(pool, view)
            .unwrap_or(self.config.default_insert_position)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Move `parcel` from `from` to `to`.
    ///
    /// The cache reflects the move as soon as this is called; it is undone
    /// if the remote refuses. Dropping the returned future does not cancel
    /// the remote call or the settlement.
    pub async fn transfer(
        &self,
        parcel: &Parcel,
        from: &PoolKey,
        to: &PoolKey,
    ) -> Result<TransferReceipt, TransferError> {
        let pending = self.begin(parcel, from, to)?;
        let task = self.spawn_drive(pending.clone());
        self.join(task, pending).await
    }

    /// Start one transfer per parcel, all in flight together. Results are
    /// in input order; the busy rule applies to repeated codes.
    pub async fn transfer_batch(
        &self,
        parcels: &[Parcel],
        from: &PoolKey,
        to: &PoolKey,
    ) -> Vec<Result<TransferReceipt, TransferError>> {
        let started: Vec<_> = parcels
            .iter()
            .map(|parcel| {
                self.begin(parcel, from, to)
                    .map(|pending| (self.spawn_drive(pending.clone()), pending))
            })
            .collect();

        let mut results = Vec::with_capacity(started.len());
        for entry in started {
            results.push(match entry {
                Ok((task, pending)) => self.join(task, pending).await,
                Err(err) => Err(err),
            });
        }
        results
    }

    /// True between the optimistic apply and settlement.
    pub fn is_in_flight(&self, code: &TrackingCode) -> bool {
        self.lock_state().in_flight.contains_key(code)
    }

    /// Transfers awaiting the remote.
    pub fn in_flight_count(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    /// Where the latest transfer of `code` stands: `OptimisticApplied` while
    /// in flight, otherwise its journaled outcome.
    pub fn state_of(&self, code: &TrackingCode) -> Option<TransferState> {
        let state = self.lock_state();
        if state.in_flight.contains_key(code) {
            return Some(TransferState::OptimisticApplied);
        }
        state.journal.last_for(code).map(|entry| entry.state)
    }

    /// Snapshots not yet committed or rolled back.
    pub fn open_snapshots(&self) -> usize {
        self.lock_state().snapshots.open_count()
    }

    /// Terminal transfers, oldest first.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock_state().journal.entries().cloned().collect()
    }

    /// Most recent journal entry for `code`, if still retained.
    pub fn last_outcome(&self, code: &TrackingCode) -> Option<JournalEntry> {
        self.lock_state().journal.last_for(code).cloned()
    }

    /// Validate, claim the tracking code, snapshot and apply the move to
    /// every cached view of both pools. Runs without suspending.
    fn begin(&self, parcel: &Parcel, from: &PoolKey, to: &PoolKey) -> Result<Pending, TransferError> {
        let pending = Pending {
            correlation_id: CorrelationId::new(),
            tracking_code: parcel.tracking_code.clone(),
            from: from.clone(),
            to: to.clone(),
        };
        debug!(
            tracking_code = %pending.tracking_code,
            %from,
            %to,
            correlation_id = %pending.correlation_id,
            state = TransferState::Requested.as_str(),
            "transfer requested"
        );

        if let Err(err) = self.validate(parcel, from, to) {
            let err = TransferError::from(err);
            debug!(
                tracking_code = %pending.tracking_code,
                %from,
                %to,
                error = %err,
                "transfer rejected"
            );
            self.lock_state()
                .record(&pending, TransferState::Rejected, Some(&err));
            return Err(err);
        }

        let mut guard = self.lock_state();
        let state = &mut *guard;
        let code = &pending.tracking_code;
        if state.in_flight.contains_key(code) {
            debug!(tracking_code = %code, "transfer busy");
            return Err(TransferError::Busy {
                tracking_code: code.clone(),
            });
        }

        let mut cache = self.cache.lock();
        let elsewhere: Vec<String> = cache
            .pools_containing(code)
            .into_iter()
            .filter(|pool| pool != from && pool != to)
            .map(|pool| pool.to_string())
            .collect();
        if !elsewhere.is_empty() {
            warn!(
                tracking_code = %code,
                pools = ?elsewhere,
                "parcel cached in more than one pool"
            );
        }

        let affected: BTreeSet<PoolKey> = [from.clone(), to.clone()].into_iter().collect();
        let snapshot = state.snapshots.begin_snapshot(&cache, &affected);

        let removed = cache.patch_remove_all(from, code);
        let source = removed
            .first()
            .map(|(_, r)| Arc::clone(&r.row.parcel))
            .unwrap_or_else(|| Arc::new(parcel.clone()));
        let row = CustodyRow::placeholder(source);

        for (view, removed_row) in removed {
            if let Some(revision) = cache.revision(from, &view) {
                state.snapshots.record_patch(
                    snapshot,
                    from,
                    &view,
                    AppliedPatch::Removed(removed_row),
                    revision,
                );
            }
        }

        for view in cache.view_keys(to) {
            let position = self.insert_position(state, to, &view);
            let before = cache.revision(to, &view);
            cache.patch_insert(to, &view, row.clone(), position);
            let after = cache.revision(to, &view);
            if let Some(revision) = after.filter(|_| after != before) {
                state.snapshots.record_patch(
                    snapshot,
                    to,
                    &view,
                    AppliedPatch::Inserted {
                        tracking_code: code.clone(),
                    },
                    revision,
                );
            }
        }
        drop(cache);

        state.in_flight.insert(
            code.clone(),
            InFlight {
                correlation_id: pending.correlation_id,
                from: from.clone(),
                to: to.clone(),
                row,
                snapshot,
            },
        );
        debug!(
            tracking_code = %code,
            %from,
            %to,
            correlation_id = %pending.correlation_id,
            state = TransferState::OptimisticApplied.as_str(),
            "optimistic apply"
        );
        Ok(pending)
    }

    fn validate(&self, parcel: &Parcel, from: &PoolKey, to: &PoolKey) -> Result<(), ValidationError> {
        if from == to {
            return Err(ValidationError::SamePool(to.clone()));
        }
        self.policy
            .check(to, parcel)
            .map_err(|reason| ValidationError::DestinationRejected {
                pool: to.clone(),
                reason,
            })
    }

    fn spawn_drive(&self, pending: Pending) -> JoinHandle<Result<TransferReceipt, TransferError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(pending).await })
    }

    async fn join(
        &self,
        task: JoinHandle<Result<TransferReceipt, TransferError>>,
        pending: Pending,
    ) -> Result<TransferReceipt, TransferError> {
        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(
                    tracking_code = %pending.tracking_code,
                    correlation_id = %pending.correlation_id,
                    error = %join_error,
                    "transfer task failed"
                );
                Err(self.settle_failure(
                    &pending,
                    RemoteError::other(format!("transfer task failed: {join_error}")),
                ))
            }
        }
    }

    /// Await the remote and settle. Runs on its own task; the remote call
    /// gets a task of its own so a panic there still settles the transfer
    /// when no caller is left to observe it.
    async fn drive(self, pending: Pending) -> Result<TransferReceipt, TransferError> {
        let remote = Arc::clone(&self.remote);
        let (code, from, to) = (
            pending.tracking_code.clone(),
            pending.from.clone(),
            pending.to.clone(),
        );
        let call = tokio::spawn(async move { remote.request_transfer(&code, &from, &to).await });
        let outcome = match call.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                warn!(
                    tracking_code = %pending.tracking_code,
                    correlation_id = %pending.correlation_id,
                    error = %join_error,
                    "remote call failed"
                );
                Err(RemoteError::other(format!("transfer task failed: {join_error}")))
            }
        };

        match outcome {
            Ok(record) => {
                self.settle_success(&pending);
                if self.config.reconcile == ReconcileMode::Eager {
                    self.refresh_pool(&pending.from).await;
                    self.refresh_pool(&pending.to).await;
                }
                Ok(TransferReceipt {
                    correlation_id: pending.correlation_id,
                    tracking_code: pending.tracking_code,
                    from: pending.from,
                    to: pending.to,
                    record,
                })
            }
            Err(err) => Err(self.settle_failure(&pending, err)),
        }
    }

    fn settle_success(&self, pending: &Pending) {
        let mut state = self.lock_state();
        let Some(flight) = state.take_in_flight(pending) else {
            return;
        };
        state.snapshots.commit(flight.snapshot);
        state.bump_generation(&pending.from);
        state.bump_generation(&pending.to);
        {
            let mut cache = self.cache.lock();
            cache.invalidate(&pending.from);
            cache.invalidate(&pending.to);
        }
        state.record(pending, TransferState::Confirmed, None);
        info!(
            tracking_code = %pending.tracking_code,
            from = %pending.from,
            to = %pending.to,
            correlation_id = %pending.correlation_id,
            "transfer confirmed"
        );
    }

    fn settle_failure(&self, pending: &Pending, err: RemoteError) -> TransferError {
        let error = TransferError::from_remote(err);
        let mut state = self.lock_state();
        let Some(flight) = state.take_in_flight(pending) else {
            return error;
        };

        let report = {
            let mut cache = self.cache.lock();
            let report = state.snapshots.rollback(flight.snapshot, &mut cache);
            if matches!(error, TransferError::RemoteDuplicate { .. }) {
                cache.invalidate(&pending.to);
            }
            report
        };
        if matches!(error, TransferError::RemoteDuplicate { .. }) {
            state.bump_generation(&pending.to);
        }
        state.record(pending, TransferState::RolledBack, Some(&error));
        warn!(
            tracking_code = %pending.tracking_code,
            from = %pending.from,
            to = %pending.to,
            correlation_id = %pending.correlation_id,
            error = %error,
            restored = report.restored,
            compensated = report.compensated,
            "transfer rolled back"
        );
        error
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Make `view` of `pool` loadable through `loader`. Optimistic rows
    /// land at the configured default position.
    pub fn register_view(&self, pool: PoolKey, view: ViewKey, loader: Arc<dyn ViewLoader>) {
        self.lock_state().registry.register(pool, view, loader, None);
    }

    /// Register with an explicit insert position for optimistic rows.
    pub fn register_view_with(
        &self,
        pool: PoolKey,
        view: ViewKey,
        loader: Arc<dyn ViewLoader>,
        position: InsertPosition,
    ) {
        self.lock_state()
            .registry
            .register(pool, view, loader, Some(position));
    }

    /// Cached contents without loading. Stale views are returned as-is.
    pub fn cached_view(&self, pool: &PoolKey, view: &ViewKey) -> Option<View> {
        self.cache.get(pool, view)
    }

    /// The cached view when fresh; otherwise a full reload through the
    /// registered loader.
    pub async fn get_view(&self, pool: &PoolKey, view: &ViewKey) -> Result<View, EngineError> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.entry(pool, view).filter(|e| !e.is_stale()) {
                return Ok(entry.view().clone());
            }
        }
        self.load_view(pool, view).await
    }

    /// Append the page after the last loaded one. Returns false when the
    /// view has no further page. Loads the view when nothing is cached.
    pub async fn fetch_next_page(&self, pool: &PoolKey, view: &ViewKey) -> Result<bool, EngineError> {
        let cached = self.cache.get(pool, view);
        let Some(cached) = cached else {
            self.load_view(pool, view).await?;
            return Ok(true);
        };
        let Some(cursor) = cached.next_cursor().map(str::to_owned) else {
            return Ok(false);
        };

        let (loader, generation) = self.loader_for(pool, view)?;
        let chunk = loader.load_page(pool, view, &cursor).await.map_err(|err| {
            warn!(%pool, %view, cursor = %cursor, error = %err, "page load failed");
            err
        })?;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        let mut cache = self.cache.lock();
        let Some(current) = cache.get(pool, view) else {
            // Evicted while the page was loading.
            return Ok(false);
        };
        let mut page = chunk.page;
        let (total, removed) = reconcile::rebase_page(
            &mut page,
            current,
            chunk.total,
            pool,
            view,
            &state.in_flight,
            &state.snapshots,
        );
        let rows = page.rows.len();

        let Some(dropped) = cache.append_page(pool, view, page, total) else {
            return Ok(false);
        };
        for (snapshot, patch) in removed {
            state.snapshots.record_rebased(snapshot, pool, view, patch);
        }
        if state.generation(pool) != generation {
            cache.invalidate_view(pool, view);
        }
        debug!(%pool, %view, rows, dropped, total, "page appended");
        Ok(true)
    }

    /// Reload every registered view of `pool` that is cached and stale.
    /// Returns how many were reloaded.
    pub async fn refresh_pool(&self, pool: &PoolKey) -> usize {
        let stale: Vec<ViewKey> = {
            let state = self.lock_state();
            let cache = self.cache.lock();
            state
                .registry
                .views_of(pool)
                .into_iter()
                .filter(|view| cache.is_stale(pool, view))
                .collect()
        };

        let mut refreshed = 0;
        for view in stale {
            if self.load_view(pool, &view).await.is_ok() {
                refreshed += 1;
            }
        }
        if refreshed > 0 {
            info!(%pool, views = refreshed, "pool refreshed");
        }
        refreshed
    }

    fn loader_for(
        &self,
        pool: &PoolKey,
        view: &ViewKey,
    ) -> Result<(Arc<dyn ViewLoader>, u64), EngineError> {
        let state = self.lock_state();
        let loader = state
            .registry
            .loader(pool, view)
            .ok_or_else(|| EngineError::ViewNotRegistered {
                pool: pool.clone(),
                view: view.clone(),
            })?;
        Ok((loader, state.generation(pool)))
    }

    /// Load, rebase over in-flight transfers and replace the cached view.
    async fn load_view(&self, pool: &PoolKey, view: &ViewKey) -> Result<View, EngineError> {
        let (loader, generation) = self.loader_for(pool, view)?;
        let mut fresh = loader.load(pool, view).await.map_err(|err| {
            warn!(%pool, %view, error = %err, "view load failed");
            err
        })?;

        let mut guard = self.lock_state();
        let state = &mut *guard;
        let position = self.insert_position(state, pool, view);
        let rebased = reconcile::rebase(&mut fresh, pool, &state.in_flight, position);

        let mut cache = self.cache.lock();
        cache.replace(pool, view, fresh.clone());
        state.snapshots.forget_view(pool, view);
        for (snapshot, patch) in rebased {
            state.snapshots.record_rebased(snapshot, pool, view, patch);
        }
        let raced = state.generation(pool) != generation;
        if raced {
            cache.invalidate_view(pool, view);
        }
        info!(%pool, %view, rows = fresh.len(), total = fresh.total(), raced, "view loaded");
        Ok(fresh)
    }
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use custody_core::Assignment;

    /// Answers every transfer with the same outcome.
    struct FixedRemote(Result<(), RemoteError>);

    #[async_trait]
    impl CustodyRemote for FixedRemote {
        async fn request_transfer(
            &self,
            code: &TrackingCode,
            _from: &PoolKey,
            to: &PoolKey,
        ) -> Result<ServerRecord, RemoteError> {
            self.0.clone().map(|()| ServerRecord {
                tracking_code: code.clone(),
                pool: to.clone(),
                assignment: Assignment {
                    record_id: 99,
                    assigned_at_ms: 0,
                },
            })
        }
    }

    struct FixedLoader(View);

    #[async_trait]
    impl ViewLoader for FixedLoader {
        async fn load(&self, _pool: &PoolKey, _view: &ViewKey) -> Result<View, RemoteError> {
            Ok(self.0.clone())
        }
    }

    fn code(s: &str) -> TrackingCode {
        TrackingCode::parse(s).unwrap()
    }

    fn parcel(s: &str) -> Parcel {
        Parcel::new(code(s), s)
    }

    fn row(s: &str) -> CustodyRow {
        CustodyRow::assigned(
            parcel(s),
            Assignment {
                record_id: 1,
                assigned_at_ms: 0,
            },
        )
    }

    fn engine(outcome: Result<(), RemoteError>) -> TransferEngine {
        let cache = SharedCache::new();
        {
            let mut c = cache.lock();
            c.replace(
                &PoolKey::Agency(1),
                &ViewKey::all(),
                View::single_page(vec![row("P1"), row("P2")], 2),
            );
            c.replace(&PoolKey::Dispatch(7), &ViewKey::all(), View::default());
        }
        TransferEngine::new(cache, Arc::new(FixedRemote(outcome)))
    }

    #[tokio::test]
    async fn confirmed_transfer_moves_row_and_invalidates() {
        let engine = engine(Ok(()));
        let receipt = engine
            .transfer(&parcel("P1"), &PoolKey::Agency(1), &PoolKey::Dispatch(7))
            .await
            .unwrap();
        assert_eq!(receipt.record.pool, PoolKey::Dispatch(7));

        let agency = engine.cached_view(&PoolKey::Agency(1), &ViewKey::all()).unwrap();
        assert_eq!(agency.tracking_codes(), vec!["P2"]);
        let dispatch = engine.cached_view(&PoolKey::Dispatch(7), &ViewKey::all()).unwrap();
        assert_eq!(dispatch.tracking_codes(), vec!["P1"]);
        assert!(engine.cache().lock().is_stale(&PoolKey::Dispatch(7), &ViewKey::all()));
        assert_eq!(engine.open_snapshots(), 0);
        assert_eq!(
            engine.last_outcome(&code("P1")).map(|e| e.state),
            Some(TransferState::Confirmed)
        );
        assert_eq!(engine.state_of(&code("P1")), Some(TransferState::Confirmed));
        assert_eq!(engine.state_of(&code("P2")), None);
    }

    #[tokio::test]
    async fn failed_transfer_restores_views() {
        let engine = engine(Err(RemoteError::new(RemoteErrorKind::NotFound, "surplus")));
        let before = engine.cache().lock().entry(&PoolKey::Agency(1), &ViewKey::all()).cloned();

        let err = engine
            .transfer(&parcel("P1"), &PoolKey::Agency(1), &PoolKey::Dispatch(7))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::RemoteNotFound { .. }));
        assert_eq!(
            engine.cache().lock().entry(&PoolKey::Agency(1), &ViewKey::all()).cloned(),
            before
        );
        assert!(!engine.is_in_flight(&code("P1")));
        let entry = engine.last_outcome(&code("P1")).unwrap();
        assert_eq!(entry.state, TransferState::RolledBack);
        assert_eq!(entry.error_kind, Some("not_found"));
    }

    #[tokio::test]
    async fn same_pool_is_rejected_untouched() {
        let engine = engine(Ok(()));
        let err = engine
            .transfer(&parcel("P1"), &PoolKey::Agency(1), &PoolKey::Agency(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::Validation(ValidationError::SamePool(PoolKey::Agency(1)))
        );
        assert_eq!(engine.open_snapshots(), 0);
        assert_eq!(
            engine.last_outcome(&code("P1")).map(|e| e.state),
            Some(TransferState::Rejected)
        );
        assert!(!engine.cache().lock().is_stale(&PoolKey::Agency(1), &ViewKey::all()));
    }

    #[tokio::test]
    async fn unregistered_views_cannot_load() {
        let engine = engine(Ok(()));
        let err = engine
            .get_view(&PoolKey::Container(3), &ViewKey::all())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ViewNotRegistered { .. }));
    }

    #[tokio::test]
    async fn stale_views_reload_through_registered_loader() {
        let engine = engine(Ok(()));
        let fresh = View::single_page(vec![row("P9")], 1);
        engine.register_view(
            PoolKey::Agency(1),
            ViewKey::all(),
            Arc::new(FixedLoader(fresh.clone())),
        );

        // Fresh cache entries are served without loading.
        let served = engine.get_view(&PoolKey::Agency(1), &ViewKey::all()).await.unwrap();
        assert_eq!(served.tracking_codes(), vec!["P1", "P2"]);

        engine.cache().lock().invalidate(&PoolKey::Agency(1));
        let served = engine.get_view(&PoolKey::Agency(1), &ViewKey::all()).await.unwrap();
        assert_eq!(served, fresh);
        assert!(!engine.cache().lock().is_stale(&PoolKey::Agency(1), &ViewKey::all()));
    }

    #[tokio::test]
    async fn journal_depth_follows_config() {
        let engine = engine(Ok(())).with_config(EngineConfig {
            journal_depth: 1,
            ..EngineConfig::default()
        });
        for _ in 0..3 {
            let _ = engine
                .transfer(&parcel("P1"), &PoolKey::Agency(1), &PoolKey::Agency(1))
                .await;
        }
        assert_eq!(engine.journal().len(), 1);
    }
}

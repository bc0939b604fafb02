use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use custody_core::{PoolKey, RemovedRow, SnapshotId, TrackingCode, ViewKey};

use crate::cache::{CachedView, CollectionCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotHandle {
    id: SnapshotId,
}

impl SnapshotHandle {
    pub fn id(&self) -> SnapshotId {
        self.id
    }
}

/// A patch the transfer engine applied to one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedPatch {
    Removed(RemovedRow),
    Inserted { tracking_code: TrackingCode },
}

#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub pool: PoolKey,
    pub view: ViewKey,
    pub entry: CachedView,
}

#[derive(Debug, Clone)]
struct PatchRecord {
    patch: AppliedPatch,
    revision_after: u64,
}

/// Cached state of the affected pools, captured before an optimistic apply.
#[derive(Debug)]
struct PreTransferSnapshot {
    pools: BTreeSet<PoolKey>,
    views: Vec<ViewSnapshot>,
    patches: BTreeMap<(PoolKey, ViewKey), PatchRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Views put back exactly as captured.
    pub restored: usize,
    /// Views another writer touched after our patch; the inverse patch
    /// was applied instead and the view marked stale.
    pub compensated: usize,
    /// Views loaded after the snapshot was taken, marked stale.
    pub invalidated: usize,
    /// The handle had already been committed or rolled back.
    pub already_consumed: bool,
}

/// Owns one snapshot per in-flight transfer.
#[derive(Debug, Default)]
pub struct SnapshotManager {
    open: HashMap<SnapshotId, PreTransferSnapshot>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Copy every cached view under `pools`. Pages are shared, not cloned.
    pub fn begin_snapshot(
        &mut self,
        cache: &CollectionCache,
        pools: &BTreeSet<PoolKey>,
    ) -> SnapshotHandle {
        let mut views = Vec::new();
        for pool in pools {
            for view in cache.view_keys(pool) {
                if let Some(entry) = cache.entry(pool, &view) {
                    views.push(ViewSnapshot {
                        pool: pool.clone(),
                        view,
                        entry: entry.clone(),
                    });
                }
            }
        }

        let handle = SnapshotHandle {
            id: SnapshotId::new(),
        };
        debug!(snapshot = %handle.id, views = views.len(), "snapshot taken");
        self.open.insert(
            handle.id,
            PreTransferSnapshot {
                pools: pools.clone(),
                views,
                patches: BTreeMap::new(),
            },
        );
        handle
    }

    pub fn captured(&self, handle: SnapshotHandle) -> Option<&[ViewSnapshot]> {
        self.open.get(&handle.id).map(|s| s.views.as_slice())
    }

    /// Remember the patch applied to a view and the revision it produced.
    pub fn record_patch(
        &mut self,
        handle: SnapshotHandle,
        pool: &PoolKey,
        view: &ViewKey,
        patch: AppliedPatch,
        revision_after: u64,
    ) -> bool {
        match self.open.get_mut(&handle.id) {
            Some(snapshot) => {
                snapshot.patches.insert(
                    (pool.clone(), view.clone()),
                    PatchRecord {
                        patch,
                        revision_after,
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Remember a patch re-applied over a reloaded view. Such views always
    /// compensate on rollback, since the captured entry predates the reload.
    pub fn record_rebased(
        &mut self,
        handle: SnapshotHandle,
        pool: &PoolKey,
        view: &ViewKey,
        patch: AppliedPatch,
    ) -> bool {
        // Revisions start at 1, so 0 never matches a live entry.
        self.record_patch(handle, pool, view, patch, 0)
    }

    /// Whether the transfer has removed its row from this view.
    pub fn has_removal(&self, handle: SnapshotHandle, pool: &PoolKey, view: &ViewKey) -> bool {
        self.open.get(&handle.id).is_some_and(|snapshot| {
            snapshot
                .patches
                .get(&(pool.clone(), view.clone()))
                .is_some_and(|record| matches!(record.patch, AppliedPatch::Removed(_)))
        })
    }

    /// Drop every recorded patch for a view that was just replaced.
    pub fn forget_view(&mut self, pool: &PoolKey, view: &ViewKey) {
        let key = (pool.clone(), view.clone());
        for snapshot in self.open.values_mut() {
            snapshot.patches.remove(&key);
        }
    }

    /// Discard without restoring. Returns false if already consumed.
    pub fn commit(&mut self, handle: SnapshotHandle) -> bool {
        self.open.remove(&handle.id).is_some()
    }

    /// Undo the transfer's patches. Views nobody else touched are restored
    /// exactly; views another writer patched after us get the inverse patch.
    /// A second call on the same handle does nothing.
    pub fn rollback(
        &mut self,
        handle: SnapshotHandle,
        cache: &mut CollectionCache,
    ) -> RollbackReport {
        let Some(snapshot) = self.open.remove(&handle.id) else {
            return RollbackReport {
                already_consumed: true,
                ..RollbackReport::default()
            };
        };

        let mut report = RollbackReport::default();
        let mut captured = BTreeSet::new();

        for snap in snapshot.views {
            let key = (snap.pool.clone(), snap.view.clone());
            let current = cache.revision(&snap.pool, &snap.view);
            match (current, snapshot.patches.get(&key)) {
                (None, _) => {}
                (Some(rev), Some(record)) if rev == record.revision_after => {
                    cache.restore(&snap.pool, &snap.view, snap.entry);
                    report.restored += 1;
                }
                (Some(_), Some(record)) => {
                    compensate(cache, &snap.pool, &snap.view, &record.patch);
                    report.compensated += 1;
                }
                (Some(_), None) => {}
            }
            captured.insert(key);
        }

        // Views first loaded while the transfer was in flight and rebased
        // over it.
        for ((pool, view), record) in &snapshot.patches {
            let key = (pool.clone(), view.clone());
            if captured.contains(&key) || cache.revision(pool, view).is_none() {
                continue;
            }
            compensate(cache, pool, view, &record.patch);
            report.compensated += 1;
            captured.insert(key);
        }

        for pool in &snapshot.pools {
            for view in cache.view_keys(pool) {
                if !captured.contains(&(pool.clone(), view.clone()))
                    && cache.invalidate_view(pool, &view)
                {
                    report.invalidated += 1;
                }
            }
        }

        debug!(
            snapshot = %handle.id,
            restored = report.restored,
            compensated = report.compensated,
            invalidated = report.invalidated,
            "snapshot rolled back"
        );
        report
    }
}

/// Apply the inverse of `patch` and mark the view stale.
fn compensate(cache: &mut CollectionCache, pool: &PoolKey, view: &ViewKey, patch: &AppliedPatch) {
    match patch {
        AppliedPatch::Removed(removed) => {
            cache.patch_restore(pool, view, removed);
        }
        AppliedPatch::Inserted { tracking_code } => {
            cache.patch_remove(pool, view, tracking_code);
        }
    }
    cache.invalidate_view(pool, view);
}

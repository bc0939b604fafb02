use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use custody_core::{
    CustodyRow, InsertPosition, Page, PoolKey, RemovedRow, TrackingCode, View, ViewKey,
};

/// A cached view plus the bookkeeping the snapshot manager relies on.
///
/// `revision` is unique across the whole cache and changes on every
/// write, so an unchanged revision means an unchanged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedView {
    pub(crate) view: View,
    pub(crate) revision: u64,
    pub(crate) stale: bool,
}

impl CachedView {
    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

/// Paginated query results keyed by (pool, view). The only place views
/// are stored; all writes go through the methods below.
#[derive(Debug, Default)]
pub struct CollectionCache {
    pools: BTreeMap<PoolKey, BTreeMap<ViewKey, CachedView>>,
    last_revision: u64,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&mut self) -> u64 {
        self.last_revision += 1;
        self.last_revision
    }

    fn entry_mut(&mut self, pool: &PoolKey, view: &ViewKey) -> Option<&mut CachedView> {
        self.pools.get_mut(pool).and_then(|views| views.get_mut(view))
    }

    pub fn get(&self, pool: &PoolKey, view: &ViewKey) -> Option<&View> {
        self.entry(pool, view).map(|e| &e.view)
    }

    pub fn entry(&self, pool: &PoolKey, view: &ViewKey) -> Option<&CachedView> {
        self.pools.get(pool).and_then(|views| views.get(view))
    }

    /// True when the view is cached but must be refetched before use.
    pub fn is_stale(&self, pool: &PoolKey, view: &ViewKey) -> bool {
        self.entry(pool, view).is_some_and(|e| e.stale)
    }

    pub fn revision(&self, pool: &PoolKey, view: &ViewKey) -> Option<u64> {
        self.entry(pool, view).map(|e| e.revision)
    }

    pub fn view_keys(&self, pool: &PoolKey) -> Vec<ViewKey> {
        self.pools
            .get(pool)
            .map(|views| views.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pools(&self) -> Vec<PoolKey> {
        self.pools.keys().cloned().collect()
    }

    /// Insert `row` into a cached view. Absent views are left alone and
    /// yield `None`: a view nobody has loaded needs no patch.
    pub fn patch_insert(
        &mut self,
        pool: &PoolKey,
        view: &ViewKey,
        row: CustodyRow,
        position: InsertPosition,
    ) -> Option<&View> {
        let revision = self.next_revision();
        let entry = self.entry_mut(pool, view)?;
        if entry.view.insert_row(row, position) {
            entry.revision = revision;
            debug!(%pool, %view, position = position.as_str(), total = entry.view.total(), "patched insert");
        }
        Some(&entry.view)
    }

    /// Remove the row for `code` from a cached view, returning it with
    /// its former location.
    pub fn patch_remove(
        &mut self,
        pool: &PoolKey,
        view: &ViewKey,
        code: &TrackingCode,
    ) -> Option<RemovedRow> {
        let revision = self.next_revision();
        let entry = self.entry_mut(pool, view)?;
        let removed = entry.view.remove_row(code)?;
        entry.revision = revision;
        debug!(%pool, %view, tracking_code = %code, total = entry.view.total(), "patched remove");
        Some(removed)
    }

    /// `patch_remove` applied to every cached view of `pool`.
    pub fn patch_remove_all(
        &mut self,
        pool: &PoolKey,
        code: &TrackingCode,
    ) -> Vec<(ViewKey, RemovedRow)> {
        self.view_keys(pool)
            .into_iter()
            .filter_map(|view| {
                let removed = self.patch_remove(pool, &view, code)?;
                Some((view, removed))
            })
            .collect()
    }

    /// Put a removed row back at its recorded location.
    pub fn patch_restore(
        &mut self,
        pool: &PoolKey,
        view: &ViewKey,
        removed: &RemovedRow,
    ) -> bool {
        let revision = self.next_revision();
        match self.entry_mut(pool, view) {
            Some(entry) => {
                let restored = entry.view.restore_row(removed);
                if restored {
                    entry.revision = revision;
                }
                restored
            }
            None => false,
        }
    }

    /// Full replacement with fresh contents. Clears staleness.
    pub fn replace(&mut self, pool: &PoolKey, view: &ViewKey, value: View) -> u64 {
        let revision = self.next_revision();
        self.pools.entry(pool.clone()).or_default().insert(
            view.clone(),
            CachedView {
                view: value,
                revision,
                stale: false,
            },
        );
        revision
    }

    /// Put back an entry exactly as captured, revision included.
    pub(crate) fn restore(&mut self, pool: &PoolKey, view: &ViewKey, entry: CachedView) {
        self.pools
            .entry(pool.clone())
            .or_default()
            .insert(view.clone(), entry);
    }

    /// Mark every view of `pool` stale. Returns how many changed.
    pub fn invalidate(&mut self, pool: &PoolKey) -> usize {
        let mut changed = 0;
        for view in self.view_keys(pool) {
            if self.invalidate_view(pool, &view) {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(%pool, views = changed, "invalidated");
        }
        changed
    }

    pub fn invalidate_view(&mut self, pool: &PoolKey, view: &ViewKey) -> bool {
        let revision = self.next_revision();
        match self.entry_mut(pool, view) {
            Some(entry) if !entry.stale => {
                entry.stale = true;
                entry.revision = revision;
                true
            }
            _ => false,
        }
    }

    /// Append a cursor-fetched page. Returns the number of rows dropped
    /// as duplicates, or `None` when the view is not cached.
    pub fn append_page(
        &mut self,
        pool: &PoolKey,
        view: &ViewKey,
        page: Page,
        total: u64,
    ) -> Option<usize> {
        let revision = self.next_revision();
        let entry = self.entry_mut(pool, view)?;
        let dropped = entry.view.append_page(page, total);
        entry.revision = revision;
        Some(dropped)
    }

    pub fn evict(&mut self, pool: &PoolKey, view: &ViewKey) -> Option<View> {
        let views = self.pools.get_mut(pool)?;
        let removed = views.remove(view).map(|e| e.view);
        if views.is_empty() {
            self.pools.remove(pool);
        }
        removed
    }

    pub fn contains(&self, pool: &PoolKey, code: &TrackingCode) -> bool {
        self.pools
            .get(pool)
            .is_some_and(|views| views.values().any(|e| e.view.contains(code)))
    }

    /// Every pool with a cached view listing `code`.
    pub fn pools_containing(&self, code: &TrackingCode) -> Vec<PoolKey> {
        self.pools
            .iter()
            .filter(|(_, views)| views.values().any(|e| e.view.contains(code)))
            .map(|(pool, _)| pool.clone())
            .collect()
    }
}

/// Process-wide handle to one `CollectionCache`, constructed by the
/// application and handed to every engine that shares it.
#[derive(Clone, Default)]
pub struct SharedCache {
    inner: Arc<Mutex<CollectionCache>>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cache(cache: CollectionCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    /// Lock for a synchronous section. Never hold the guard across `.await`.
    pub fn lock(&self) -> MutexGuard<'_, CollectionCache> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, pool: &PoolKey, view: &ViewKey) -> Option<View> {
        self.lock().get(pool, view).cloned()
    }
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{Assignment, Parcel};

    fn row(code: &str) -> CustodyRow {
        CustodyRow::assigned(
            Parcel::new(TrackingCode::parse(code).unwrap(), code),
            Assignment {
                record_id: 1,
                assigned_at_ms: 0,
            },
        )
    }

    fn code(s: &str) -> TrackingCode {
        TrackingCode::parse(s).unwrap()
    }

    fn agency() -> PoolKey {
        PoolKey::Agency(1)
    }

    #[test]
    fn patches_on_absent_views_are_noops() {
        let mut cache = CollectionCache::new();
        assert!(cache
            .patch_insert(&agency(), &ViewKey::all(), row("P1"), InsertPosition::Head)
            .is_none());
        assert!(cache.patch_remove(&agency(), &ViewKey::all(), &code("P1")).is_none());
        assert!(cache.get(&agency(), &ViewKey::all()).is_none());
        assert!(cache.pools().is_empty());
    }

    #[test]
    fn every_write_changes_revision() {
        let mut cache = CollectionCache::new();
        let r0 = cache.replace(&agency(), &ViewKey::all(), View::single_page(vec![row("P1")], 1));
        cache.patch_insert(&agency(), &ViewKey::all(), row("P2"), InsertPosition::Head);
        let r1 = cache.revision(&agency(), &ViewKey::all()).unwrap();
        assert!(r1 > r0);

        // A duplicate insert changes nothing, revision included.
        cache.patch_insert(&agency(), &ViewKey::all(), row("P2"), InsertPosition::Head);
        assert_eq!(cache.revision(&agency(), &ViewKey::all()), Some(r1));

        cache.invalidate(&agency());
        let r2 = cache.revision(&agency(), &ViewKey::all()).unwrap();
        assert!(r2 > r1);
        // Invalidating a stale view again is a no-op.
        assert_eq!(cache.invalidate(&agency()), 0);
        assert_eq!(cache.revision(&agency(), &ViewKey::all()), Some(r2));
    }

    #[test]
    fn remove_all_hits_every_view_of_pool() {
        let mut cache = CollectionCache::new();
        let recent = ViewKey::all().with("order", "newest");
        let search = ViewKey::all().with("search", "P");
        cache.replace(&agency(), &recent, View::single_page(vec![row("P1"), row("P2")], 2));
        cache.replace(&agency(), &search, View::single_page(vec![row("P1")], 1));
        cache.replace(&PoolKey::Agency(2), &recent, View::single_page(vec![row("P9")], 1));

        let removed = cache.patch_remove_all(&agency(), &code("P1"));
        assert_eq!(removed.len(), 2);
        assert!(!cache.contains(&agency(), &code("P1")));
        assert_eq!(cache.get(&agency(), &recent).unwrap().total(), 1);
        assert_eq!(cache.get(&agency(), &search).unwrap().total(), 0);
        assert!(cache.contains(&PoolKey::Agency(2), &code("P9")));
    }

    #[test]
    fn restore_puts_row_back_once() {
        let mut cache = CollectionCache::new();
        cache.replace(&agency(), &ViewKey::all(), View::single_page(vec![row("P1"), row("P2")], 2));
        let removed = cache.patch_remove(&agency(), &ViewKey::all(), &code("P1")).unwrap();
        let after_remove = cache.revision(&agency(), &ViewKey::all()).unwrap();

        assert!(cache.patch_restore(&agency(), &ViewKey::all(), &removed));
        let view = cache.get(&agency(), &ViewKey::all()).unwrap();
        assert_eq!(view.tracking_codes(), vec!["P1", "P2"]);
        assert_eq!(view.total(), 2);
        let after_restore = cache.revision(&agency(), &ViewKey::all()).unwrap();
        assert!(after_restore > after_remove);

        // Already present: nothing changes, revision included.
        assert!(!cache.patch_restore(&agency(), &ViewKey::all(), &removed));
        assert_eq!(cache.revision(&agency(), &ViewKey::all()), Some(after_restore));
        assert!(!cache.patch_restore(&PoolKey::Agency(2), &ViewKey::all(), &removed));
    }

    #[test]
    fn replace_clears_staleness() {
        let mut cache = CollectionCache::new();
        cache.replace(&agency(), &ViewKey::all(), View::default());
        cache.invalidate(&agency());
        assert!(cache.is_stale(&agency(), &ViewKey::all()));
        cache.replace(&agency(), &ViewKey::all(), View::single_page(vec![row("P1")], 1));
        assert!(!cache.is_stale(&agency(), &ViewKey::all()));
    }

    #[test]
    fn pools_containing_reports_every_holder() {
        let mut cache = CollectionCache::new();
        cache.replace(&agency(), &ViewKey::all(), View::single_page(vec![row("P1")], 1));
        cache.replace(&PoolKey::Dispatch(7), &ViewKey::all(), View::single_page(vec![row("P1")], 1));
        assert_eq!(
            cache.pools_containing(&code("P1")),
            vec![agency(), PoolKey::Dispatch(7)]
        );
    }

    #[test]
    fn evict_drops_empty_pools() {
        let mut cache = CollectionCache::new();
        cache.replace(&agency(), &ViewKey::all(), View::default());
        assert!(cache.evict(&agency(), &ViewKey::all()).is_some());
        assert!(cache.pools().is_empty());
    }

    #[test]
    fn shared_cache_hands_out_copies() {
        let shared = SharedCache::new();
        shared
            .lock()
            .replace(&agency(), &ViewKey::all(), View::single_page(vec![row("P1")], 1));
        let copy = shared.get(&agency(), &ViewKey::all()).unwrap();
        shared.lock().patch_remove(&agency(), &ViewKey::all(), &code("P1"));
        assert_eq!(copy.total(), 1);
        assert_eq!(shared.get(&agency(), &ViewKey::all()).unwrap().total(), 0);
    }
}

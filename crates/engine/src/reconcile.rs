use std::collections::BTreeMap;
use std::sync::Arc;

use custody_core::{
    InsertPosition, Page, PoolKey, RemovedRow, RowLocation, TrackingCode, View, ViewKey,
};

use crate::remote::ViewLoader;
use crate::snapshot::{AppliedPatch, SnapshotHandle, SnapshotManager};
use crate::transfer::InFlight;

#[derive(Clone)]
struct Registration {
    loader: Arc<dyn ViewLoader>,
    insert_at: Option<InsertPosition>,
}

/// Paginated queries the engine keeps synchronized, keyed like the cache.
#[derive(Default)]
pub struct ViewRegistry {
    views: BTreeMap<PoolKey, BTreeMap<ViewKey, Registration>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the loader for a view. `insert_at` of `None`
    /// falls back to the engine's configured default.
    pub fn register(
        &mut self,
        pool: PoolKey,
        view: ViewKey,
        loader: Arc<dyn ViewLoader>,
        insert_at: Option<InsertPosition>,
    ) {
        self.views
            .entry(pool)
            .or_default()
            .insert(view, Registration { loader, insert_at });
    }

    pub fn is_registered(&self, pool: &PoolKey, view: &ViewKey) -> bool {
        self.registration(pool, view).is_some()
    }

    fn registration(&self, pool: &PoolKey, view: &ViewKey) -> Option<&Registration> {
        self.views.get(pool).and_then(|views| views.get(view))
    }

    pub fn loader(&self, pool: &PoolKey, view: &ViewKey) -> Option<Arc<dyn ViewLoader>> {
        self.registration(pool, view).map(|r| Arc::clone(&r.loader))
    }

    pub fn insert_position(&self, pool: &PoolKey, view: &ViewKey) -> Option<InsertPosition> {
        self.registration(pool, view).and_then(|r| r.insert_at)
    }

    pub fn views_of(&self, pool: &PoolKey) -> Vec<ViewKey> {
        self.views
            .get(pool)
            .map(|views| views.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&PoolKey, usize> =
            self.views.iter().map(|(pool, views)| (pool, views.len())).collect();
        f.debug_struct("ViewRegistry").field("views", &counts).finish()
    }
}

/// Re-apply in-flight transfers touching `pool` to a freshly loaded view.
/// Returns the patches applied, per owning snapshot.
pub(crate) fn rebase(
    view: &mut View,
    pool: &PoolKey,
    in_flight: &BTreeMap<TrackingCode, InFlight>,
    position: InsertPosition,
) -> Vec<(SnapshotHandle, AppliedPatch)> {
    let mut applied = Vec::new();
    for (code, flight) in in_flight {
        if &flight.from == pool {
            if let Some(removed) = view.remove_row(code) {
                applied.push((flight.snapshot, AppliedPatch::Removed(removed)));
            }
        } else if &flight.to == pool && view.insert_row(flight.row.clone(), position) {
            applied.push((
                flight.snapshot,
                AppliedPatch::Inserted {
                    tracking_code: code.clone(),
                },
            ));
        }
    }
    applied
}

/// Rebase a page about to be appended to `current` over in-flight transfers.
///
/// A move shifts a view's total only once the view has seen it: an arrival
/// once its placeholder is in the view, a departure once its row has been
/// removed from a page the view holds. Full reloads follow the same rule
/// through `rebase`. Returns the adjusted total and the removals to record.
pub(crate) fn rebase_page(
    page: &mut Page,
    current: &View,
    server_total: u64,
    pool: &PoolKey,
    view: &ViewKey,
    in_flight: &BTreeMap<TrackingCode, InFlight>,
    snapshots: &SnapshotManager,
) -> (u64, Vec<(SnapshotHandle, AppliedPatch)>) {
    let page_index = current.pages().len();
    let mut removed = Vec::new();
    let mut index = 0;
    page.rows.retain(|row| {
        let departing = in_flight
            .get(row.tracking_code())
            .filter(|flight| &flight.from == pool);
        match departing {
            Some(flight) => {
                if !snapshots.has_removal(flight.snapshot, pool, view) {
                    removed.push((
                        flight.snapshot,
                        AppliedPatch::Removed(RemovedRow {
                            row: row.clone(),
                            location: RowLocation {
                                page: page_index,
                                index,
                            },
                            decremented: true,
                        }),
                    ));
                }
                false
            }
            None => {
                index += 1;
                true
            }
        }
    });

    let entering = in_flight
        .iter()
        .filter(|(code, flight)| {
            &flight.to == pool
                && current.contains(code)
                && !page.rows.iter().any(|row| row.tracking_code() == *code)
        })
        .count() as u64;
    let leaving = in_flight
        .values()
        .filter(|flight| &flight.from == pool && snapshots.has_removal(flight.snapshot, pool, view))
        .count() as u64
        + removed.len() as u64;
    let total = server_total.saturating_add(entering).saturating_sub(leaving);
    (total, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_core::{Assignment, CorrelationId, CustodyRow, Parcel};

    use crate::cache::CollectionCache;

    fn row(code: &str) -> CustodyRow {
        CustodyRow::assigned(
            Parcel::new(TrackingCode::parse(code).unwrap(), code),
            Assignment {
                record_id: 1,
                assigned_at_ms: 0,
            },
        )
    }

    fn flight(code: &str, handle: SnapshotHandle) -> (TrackingCode, InFlight) {
        let tracking_code = TrackingCode::parse(code).unwrap();
        let parcel = Arc::new(Parcel::new(tracking_code.clone(), code));
        (
            tracking_code,
            InFlight {
                correlation_id: CorrelationId::new(),
                from: PoolKey::Agency(1),
                to: PoolKey::Dispatch(7),
                row: CustodyRow::placeholder(parcel),
                snapshot: handle,
            },
        )
    }

    fn handle() -> SnapshotHandle {
        let mut snapshots = SnapshotManager::new();
        snapshots.begin_snapshot(&CollectionCache::new(), &Default::default())
    }

    #[test]
    fn rebase_moves_in_flight_rows() {
        let in_flight: BTreeMap<_, _> = [flight("P1", handle())].into_iter().collect();

        let mut source = View::single_page(vec![row("P1"), row("P2")], 2);
        let applied = rebase(&mut source, &PoolKey::Agency(1), &in_flight, InsertPosition::Head);
        assert_eq!(applied.len(), 1);
        assert_eq!(source.tracking_codes(), vec!["P2"]);
        assert_eq!(source.total(), 1);

        let mut destination = View::single_page(vec![row("P5")], 1);
        rebase(&mut destination, &PoolKey::Dispatch(7), &in_flight, InsertPosition::Head);
        assert_eq!(destination.tracking_codes(), vec!["P1", "P5"]);
        assert!(destination.rows().next().unwrap().is_placeholder());
    }

    #[test]
    fn rebase_skips_what_the_server_already_reflects() {
        let in_flight: BTreeMap<_, _> = [flight("P1", handle())].into_iter().collect();
        let mut destination = View::single_page(vec![row("P1")], 1);
        let applied = rebase(&mut destination, &PoolKey::Dispatch(7), &in_flight, InsertPosition::Head);
        assert!(applied.is_empty());
        assert_eq!(destination.total(), 1);
    }

    #[test]
    fn rebase_page_hides_departing_rows() {
        let mut snapshots = SnapshotManager::new();
        let handle = snapshots.begin_snapshot(&CollectionCache::new(), &Default::default());
        let in_flight: BTreeMap<_, _> = [flight("P3", handle)].into_iter().collect();
        let current = View::new(vec![Page::new(vec![row("P1"), row("P2")]).with_cursor("2")], 4);

        let mut page = Page::new(vec![row("P3"), row("P4")]);
        let (total, removed) = rebase_page(
            &mut page,
            &current,
            4,
            &PoolKey::Agency(1),
            &ViewKey::all(),
            &in_flight,
            &snapshots,
        );
        assert_eq!(page.rows.len(), 1);
        assert_eq!(total, 3);
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn departures_count_once_seen() {
        let pool = PoolKey::Agency(1);
        let view = ViewKey::all();
        let mut snapshots = SnapshotManager::new();
        let handle = snapshots.begin_snapshot(&CollectionCache::new(), &Default::default());
        let in_flight: BTreeMap<_, _> = [flight("P5", handle)].into_iter().collect();

        // A reload that does not reach P5 keeps the server's total.
        let mut loaded = View::new(vec![Page::new(vec![row("P1"), row("P2")]).with_cursor("2")], 6);
        assert!(rebase(&mut loaded, &pool, &in_flight, InsertPosition::Head).is_empty());
        assert_eq!(loaded.total(), 6);

        // So does a page that does not reach it.
        let mut second = Page::new(vec![row("P3"), row("P4")]);
        let (total, removed) =
            rebase_page(&mut second, &loaded, 6, &pool, &view, &in_flight, &snapshots);
        assert_eq!(total, 6);
        assert!(removed.is_empty());
        loaded.append_page(second.with_cursor("4"), total);

        // The page holding P5 drops it and the total follows.
        let mut third = Page::new(vec![row("P5"), row("P6")]);
        let (total, removed) =
            rebase_page(&mut third, &loaded, 6, &pool, &view, &in_flight, &snapshots);
        assert_eq!(total, 5);
        assert_eq!(third.rows.len(), 1);
        for (snapshot, patch) in removed {
            assert!(snapshots.record_rebased(snapshot, &pool, &view, patch));
        }
        loaded.append_page(third, total);

        // Seen once, counted once, even if the server repeats the row.
        let mut repeat = Page::new(vec![row("P5")]);
        let (total, removed) =
            rebase_page(&mut repeat, &loaded, 6, &pool, &view, &in_flight, &snapshots);
        assert_eq!(total, 5);
        assert!(removed.is_empty());
        assert!(repeat.rows.is_empty());
    }

    #[test]
    fn registry_tracks_positions() {
        struct Empty;

        #[async_trait::async_trait]
        impl ViewLoader for Empty {
            async fn load(
                &self,
                _pool: &PoolKey,
                _view: &ViewKey,
            ) -> Result<View, crate::remote::RemoteError> {
                Ok(View::default())
            }
        }

        let mut registry = ViewRegistry::new();
        let recent = ViewKey::all().with("order", "newest");
        registry.register(PoolKey::Dispatch(7), recent.clone(), Arc::new(Empty), None);
        registry.register(
            PoolKey::Dispatch(7),
            ViewKey::all(),
            Arc::new(Empty),
            Some(InsertPosition::Tail),
        );

        assert!(registry.is_registered(&PoolKey::Dispatch(7), &recent));
        assert_eq!(registry.insert_position(&PoolKey::Dispatch(7), &recent), None);
        assert_eq!(
            registry.insert_position(&PoolKey::Dispatch(7), &ViewKey::all()),
            Some(InsertPosition::Tail)
        );
        assert_eq!(registry.views_of(&PoolKey::Dispatch(7)).len(), 2);
        assert!(registry.loader(&PoolKey::Agency(1), &recent).is_none());
    }
}

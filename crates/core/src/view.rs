use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{CoreError, CustodyRow, TrackingCode, ViewDigest};

/// Where an optimistic row lands in a destination view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    /// Front of the first page (most-recent-first views).
    #[default]
    Head,
    /// End of the last loaded page (append-at-scroll-end views).
    Tail,
}

impl InsertPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Tail => "tail",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub rows: Vec<CustodyRow>,
    /// Cursor of the page that follows this one, for infinite views.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(rows: Vec<CustodyRow>) -> Self {
        Self {
            rows,
            next_cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub page: usize,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedRow {
    pub row: CustodyRow,
    pub location: RowLocation,
    /// False when the total was already zero and stayed there.
    pub decremented: bool,
}

/// A cached, paginated projection of one pool's membership.
///
/// Pages are shared behind `Arc`; every mutating method clones only the
/// page it touches, so a cloned `View` is a cheap structural snapshot.
/// All mutations are deterministic functions of the previous state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pages: Vec<Arc<Page>>,
    total: u64,
}

impl View {
    pub fn new(pages: Vec<Page>, total: u64) -> Self {
        Self {
            pages: pages.into_iter().map(Arc::new).collect(),
            total,
        }
    }

    pub fn single_page(rows: Vec<CustodyRow>, total: u64) -> Self {
        Self::new(vec![Page::new(rows)], total)
    }

    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of loaded rows across all pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> impl Iterator<Item = &CustodyRow> {
        self.pages.iter().flat_map(|p| p.rows.iter())
    }

    pub fn tracking_codes(&self) -> Vec<&str> {
        self.rows().map(|r| r.tracking_code().as_str()).collect()
    }

    pub fn contains(&self, code: &TrackingCode) -> bool {
        self.locate(code).is_some()
    }

    pub fn locate(&self, code: &TrackingCode) -> Option<RowLocation> {
        self.pages.iter().enumerate().find_map(|(page, p)| {
            p.rows
                .iter()
                .position(|r| r.tracking_code() == code)
                .map(|index| RowLocation { page, index })
        })
    }

    pub fn row(&self, code: &TrackingCode) -> Option<&CustodyRow> {
        let at = self.locate(code)?;
        self.pages[at.page].rows.get(at.index)
    }

    /// Cursor of the next unloaded page, if the server reported one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.pages.last().and_then(|p| p.next_cursor.as_deref())
    }

    /// Insert `row` at `position`, bumping the total. Returns false and
    /// leaves the view untouched when the tracking code is already present.
    pub fn insert_row(&mut self, row: CustodyRow, position: InsertPosition) -> bool {
        if self.contains(row.tracking_code()) {
            return false;
        }
        if self.pages.is_empty() {
            self.pages.push(Arc::new(Page::default()));
        }
        match position {
            InsertPosition::Head => Arc::make_mut(&mut self.pages[0]).rows.insert(0, row),
            InsertPosition::Tail => {
                let last = self.pages.len() - 1;
                Arc::make_mut(&mut self.pages[last]).rows.push(row);
            }
        }
        self.total = self.total.saturating_add(1);
        true
    }

    /// Put a previously removed row back where it was. Out-of-range
    /// locations are clamped to the nearest valid slot.
    pub fn restore_row(&mut self, removed: &RemovedRow) -> bool {
        if self.contains(removed.row.tracking_code()) {
            return false;
        }
        if self.pages.is_empty() {
            self.pages.push(Arc::new(Page::default()));
        }
        let page = removed.location.page.min(self.pages.len() - 1);
        let rows = &mut Arc::make_mut(&mut self.pages[page]).rows;
        let index = removed.location.index.min(rows.len());
        rows.insert(index, removed.row.clone());
        if removed.decremented {
            self.total = self.total.saturating_add(1);
        }
        true
    }

    /// Remove the row for `code` from whichever page holds it. The total
    /// is decremented but never below zero; the row is removed regardless.
    pub fn remove_row(&mut self, code: &TrackingCode) -> Option<RemovedRow> {
        let location = self.locate(code)?;
        let row = Arc::make_mut(&mut self.pages[location.page])
            .rows
            .remove(location.index);
        let decremented = self.total > 0;
        self.total = self.total.saturating_sub(1);
        Some(RemovedRow {
            row,
            location,
            decremented,
        })
    }

    /// Append a page fetched by cursor. Rows already present in earlier
    /// pages are dropped. Returns the number of rows dropped.
    pub fn append_page(&mut self, mut page: Page, total: u64) -> usize {
        let seen: HashSet<&TrackingCode> = self.rows().map(|r| r.tracking_code()).collect();
        let before = page.rows.len();
        let mut kept = HashSet::new();
        page.rows.retain(|r| {
            !seen.contains(r.tracking_code()) && kept.insert(r.tracking_code().clone())
        });
        let dropped = before - page.rows.len();
        self.pages.push(Arc::new(page));
        self.total = total.max(self.len() as u64);
        dropped
    }

    pub fn check_invariants(&self) -> Result<(), CoreError> {
        let loaded = self.len() as u64;
        if loaded > self.total {
            return Err(CoreError::InvalidData(format!(
                "view holds {loaded} rows but total is {}",
                self.total
            )));
        }
        let mut seen = HashSet::new();
        for row in self.rows() {
            if !seen.insert(row.tracking_code()) {
                return Err(CoreError::InvalidData(format!(
                    "tracking code {} appears twice",
                    row.tracking_code()
                )));
            }
        }
        Ok(())
    }

    pub fn digest(&self) -> Result<ViewDigest, CoreError> {
        let bytes = rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Ok(ViewDigest::from_bytes(*blake3::hash(&bytes).as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Assignment, Parcel};

    fn row(code: &str) -> CustodyRow {
        let parcel = Parcel::new(TrackingCode::parse(code).unwrap(), format!("parcel {code}"));
        CustodyRow::assigned(
            parcel,
            Assignment {
                record_id: 1,
                assigned_at_ms: 1_000,
            },
        )
    }

    fn code(s: &str) -> TrackingCode {
        TrackingCode::parse(s).unwrap()
    }

    #[test]
    fn head_insert_lands_on_first_page() {
        let mut view = View::new(
            vec![Page::new(vec![row("P1")]), Page::new(vec![row("P2")])],
            2,
        );
        assert!(view.insert_row(row("P3"), InsertPosition::Head));
        assert_eq!(view.tracking_codes(), vec!["P3", "P1", "P2"]);
        assert_eq!(view.pages()[0].rows.len(), 2);
        assert_eq!(view.total(), 3);
    }

    #[test]
    fn tail_insert_lands_on_last_page() {
        let mut view = View::new(
            vec![Page::new(vec![row("P1")]), Page::new(vec![row("P2")])],
            2,
        );
        assert!(view.insert_row(row("P3"), InsertPosition::Tail));
        assert_eq!(view.tracking_codes(), vec!["P1", "P2", "P3"]);
        assert_eq!(view.pages()[1].rows.len(), 2);
    }

    #[test]
    fn insert_into_pageless_view_creates_page() {
        let mut view = View::default();
        assert!(view.insert_row(row("P1"), InsertPosition::Tail));
        assert_eq!(view.pages().len(), 1);
        assert_eq!(view.total(), 1);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut view = View::single_page(vec![row("P1")], 1);
        let before = view.clone();
        assert!(!view.insert_row(row("P1"), InsertPosition::Head));
        assert_eq!(view, before);
    }

    #[test]
    fn remove_floors_total_at_zero_but_removes_row() {
        let mut view = View::single_page(vec![row("P1")], 0);
        let removed = view.remove_row(&code("P1")).unwrap();
        assert!(!removed.decremented);
        assert_eq!(view.total(), 0);
        assert!(view.is_empty());
    }

    #[test]
    fn remove_then_restore_is_exact() {
        let original = View::new(
            vec![
                Page::new(vec![row("P1"), row("P2")]),
                Page::new(vec![row("P3")]),
            ],
            5,
        );
        let mut view = original.clone();
        let removed = view.remove_row(&code("P2")).unwrap();
        assert_eq!(removed.location, RowLocation { page: 0, index: 1 });
        assert_eq!(view.total(), 4);
        assert!(view.restore_row(&removed));
        assert_eq!(view, original);
    }

    #[test]
    fn patches_do_not_touch_shared_pages() {
        let original = View::new(
            vec![Page::new(vec![row("P1")]), Page::new(vec![row("P2")])],
            2,
        );
        let mut view = original.clone();
        view.remove_row(&code("P2"));
        // Untouched first page is still shared with the original.
        assert!(Arc::ptr_eq(&view.pages()[0], &original.pages()[0]));
        assert_eq!(original.tracking_codes(), vec!["P1", "P2"]);
    }

    #[test]
    fn append_page_drops_codes_already_loaded() {
        let mut view = View::new(vec![Page::new(vec![row("P1"), row("P2")]).with_cursor("2")], 4);
        let dropped = view.append_page(Page::new(vec![row("P2"), row("P3"), row("P3")]), 4);
        assert_eq!(dropped, 2);
        assert_eq!(view.tracking_codes(), vec!["P1", "P2", "P3"]);
        view.check_invariants().unwrap();
    }

    #[test]
    fn invariants_catch_overfull_view() {
        let view = View::single_page(vec![row("P1"), row("P2")], 1);
        assert!(view.check_invariants().is_err());
    }

    #[test]
    fn digest_tracks_content() {
        let a = View::single_page(vec![row("P1")], 1);
        let b = View::single_page(vec![row("P1")], 1);
        let c = View::single_page(vec![row("P1")], 2);
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }
}

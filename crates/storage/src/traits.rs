use custody_core::{Assignment, CustodyRow, Parcel, Pool, PoolKey, PoolStatus, TrackingCode};

use crate::error::LedgerError;

/// Page size used when a view does not ask for one.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodyRecord {
    pub record_id: i64,
    pub tracking_code: TrackingCode,
    pub pool: PoolKey,
    pub assigned_at_ms: u64,
}

impl CustodyRecord {
    pub fn assignment(&self) -> Assignment {
        Assignment {
            record_id: self.record_id,
            assigned_at_ms: self.assigned_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberQuery {
    /// Substring match on tracking code or description.
    pub search: Option<String>,
    /// Most recently assigned first.
    pub newest_first: bool,
    pub offset: u64,
    pub limit: u64,
}

impl Default for MemberQuery {
    fn default() -> Self {
        Self {
            search: None,
            newest_first: true,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPage {
    pub rows: Vec<CustodyRow>,
    /// Members matching the query, across all pages.
    pub total: u64,
}

impl MemberPage {
    pub fn has_more(&self, query: &MemberQuery) -> bool {
        query.offset + (self.rows.len() as u64) < self.total
    }
}

/// Authoritative record of which pool holds each parcel.
pub trait Ledger {
    fn upsert_pool(&mut self, pool: &Pool) -> Result<(), LedgerError>;

    fn get_pool(&self, key: &PoolKey) -> Result<Option<Pool>, LedgerError>;

    fn set_pool_status(&mut self, key: &PoolKey, status: PoolStatus) -> Result<(), LedgerError>;

    fn insert_parcel(&mut self, parcel: &Parcel) -> Result<(), LedgerError>;

    fn get_parcel(&self, code: &TrackingCode) -> Result<Option<Parcel>, LedgerError>;

    /// Give an unassigned parcel its first custody location.
    fn place(&mut self, code: &TrackingCode, pool: &PoolKey) -> Result<CustodyRecord, LedgerError>;

    /// Move a parcel from `from` to `to`, issuing a new custody record.
    fn relocate(
        &mut self,
        code: &TrackingCode,
        from: &PoolKey,
        to: &PoolKey,
    ) -> Result<CustodyRecord, LedgerError>;

    fn custody_of(&self, code: &TrackingCode) -> Result<Option<CustodyRecord>, LedgerError>;

    fn list_members(&self, pool: &PoolKey, query: &MemberQuery) -> Result<MemberPage, LedgerError>;
}

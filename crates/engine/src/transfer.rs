use std::sync::{PoisonError, RwLock};

use custody_core::{CorrelationId, CustodyRow, Parcel, PoolDirectory, PoolKey, TrackingCode};

use crate::remote::ServerRecord;
use crate::snapshot::SnapshotHandle;

/// Lifecycle of one transfer. `Requested` lasts until validation and the
/// busy check finish; the three terminal states are journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    OptimisticApplied,
    Confirmed,
    RolledBack,
    Rejected,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::OptimisticApplied => "optimistic_applied",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::RolledBack | Self::Rejected)
    }
}

/// A transfer between its optimistic apply and its remote resolution.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub correlation_id: CorrelationId,
    pub from: PoolKey,
    pub to: PoolKey,
    /// Placeholder inserted into destination views; reused when a view
    /// of either pool is reloaded mid-flight.
    pub row: CustodyRow,
    pub snapshot: SnapshotHandle,
}

/// Handed from the synchronous begin phase to the task that awaits the remote.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub correlation_id: CorrelationId,
    pub tracking_code: TrackingCode,
    pub from: PoolKey,
    pub to: PoolKey,
}

/// Successful transfer as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub correlation_id: CorrelationId,
    pub tracking_code: TrackingCode,
    pub from: PoolKey,
    pub to: PoolKey,
    pub record: ServerRecord,
}

/// Caller-supplied check on whether a destination takes new parcels.
pub trait AcceptancePolicy: Send + Sync {
    /// `Err(reason)` refuses the transfer.
    fn check(&self, to: &PoolKey, parcel: &Parcel) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AcceptancePolicy for AcceptAll {
    fn check(&self, _to: &PoolKey, _parcel: &Parcel) -> Result<(), String> {
        Ok(())
    }
}

impl AcceptancePolicy for PoolDirectory {
    fn check(&self, to: &PoolKey, _parcel: &Parcel) -> Result<(), String> {
        match self.refusal(to) {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

/// Lets pools be sealed while the engine holds the directory.
impl AcceptancePolicy for RwLock<PoolDirectory> {
    fn check(&self, to: &PoolKey, parcel: &Parcel) -> Result<(), String> {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(to, parcel)
    }
}

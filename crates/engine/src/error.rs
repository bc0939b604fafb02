use custody_core::{CoreError, PoolKey, TrackingCode, ViewKey};
use thiserror::Error;

use crate::remote::{RemoteError, RemoteErrorKind};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("view not registered: {pool} [{view}]")]
    ViewNotRegistered { pool: PoolKey, view: ViewKey },

    #[error("view load failed: {0}")]
    Load(#[from] RemoteError),
}

/// Why a transfer was refused before anything was touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("source and destination are both {0}")]
    SamePool(PoolKey),

    #[error("{pool} does not accept transfers: {reason}")]
    DestinationRejected { pool: PoolKey, reason: String },
}

/// How a caller should present a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("a transfer for {tracking_code} is already in flight")]
    Busy { tracking_code: TrackingCode },

    #[error("parcel already at destination: {message}")]
    RemoteDuplicate { message: String },

    #[error("parcel unknown to destination: {message}")]
    RemoteNotFound { message: String },

    #[error("transfer failed ({}): {message}", .kind.as_str())]
    RemoteOther {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl TransferError {
    pub fn from_remote(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Duplicate => Self::RemoteDuplicate {
                message: err.message,
            },
            RemoteErrorKind::NotFound => Self::RemoteNotFound {
                message: err.message,
            },
            kind @ (RemoteErrorKind::Conflict | RemoteErrorKind::Other) => Self::RemoteOther {
                kind,
                message: err.message,
            },
        }
    }

    /// Duplicates are surfaced as warnings: the parcel is where the
    /// operator wanted it, just not by this request.
    pub fn severity(&self) -> Severity {
        match self {
            Self::RemoteDuplicate { .. } => Severity::Warning,
            _ => Severity::Failure,
        }
    }

    /// Whether resubmitting the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::RemoteOther {
                    kind: RemoteErrorKind::Other,
                    ..
                }
        )
    }

    /// False when the transfer was refused before the cache was patched.
    pub fn touched_cache(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Busy { .. })
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Busy { .. } => "busy",
            Self::RemoteDuplicate { .. } => RemoteErrorKind::Duplicate.as_str(),
            Self::RemoteNotFound { .. } => RemoteErrorKind::NotFound.as_str(),
            Self::RemoteOther { kind, .. } => kind.as_str(),
        }
    }
}

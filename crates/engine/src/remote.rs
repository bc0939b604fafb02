use async_trait::async_trait;
use thiserror::Error;

use custody_core::{Assignment, CoreError, Page, PoolKey, TrackingCode, View, ViewKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The parcel is already at the destination.
    Duplicate,
    /// The parcel is unknown to the destination context ("surplus").
    NotFound,
    Conflict,
    Other,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "duplicate" => Ok(Self::Duplicate),
            "not_found" => Ok(Self::NotFound),
            "conflict" => Ok(Self::Conflict),
            "other" => Ok(Self::Other),
            _ => Err(CoreError::InvalidData(format!("unknown remote error kind: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Other, message)
    }
}

/// Confirmation returned by the remote for an accepted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub tracking_code: TrackingCode,
    pub pool: PoolKey,
    pub assignment: Assignment,
}

/// The external system that owns custody.
#[async_trait]
pub trait CustodyRemote: Send + Sync {
    async fn request_transfer(
        &self,
        code: &TrackingCode,
        from: &PoolKey,
        to: &PoolKey,
    ) -> Result<ServerRecord, RemoteError>;
}

/// One page fetched by cursor, with the total reported alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    pub page: Page,
    pub total: u64,
}

/// Source of authoritative view contents.
#[async_trait]
pub trait ViewLoader: Send + Sync {
    /// Load the first page(s) of a view.
    async fn load(&self, pool: &PoolKey, view: &ViewKey) -> Result<View, RemoteError>;

    /// Load the page following `cursor`.
    async fn load_page(
        &self,
        pool: &PoolKey,
        view: &ViewKey,
        cursor: &str,
    ) -> Result<PageChunk, RemoteError> {
        let _ = (pool, view, cursor);
        Err(RemoteError::other("view is not paginated"))
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("core error: {0}")]
    Core(#[from] custody_core::CoreError),

    #[error("parcel not found: {0}")]
    ParcelNotFound(String),

    #[error("parcel already registered: {0}")]
    ParcelExists(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool {pool} does not accept parcels: sealed")]
    PoolSealed { pool: String },

    #[error("parcel {tracking_code} is already in {pool}")]
    AlreadyInPool { tracking_code: String, pool: String },

    #[error("parcel {tracking_code} is not in {pool}")]
    NotInPool { tracking_code: String, pool: String },
}

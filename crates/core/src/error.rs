use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid tracking code: {0:?}")]
    InvalidTrackingCode(String),

    #[error("invalid pool key: {0:?}")]
    InvalidPoolKey(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

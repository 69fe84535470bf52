use mytoken_core::MytokenError;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same key already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for MytokenError {
    fn from(e: StoreError) -> Self {
        MytokenError::Storage(e.to_string())
    }
}

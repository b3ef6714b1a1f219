//! Error types for the KV facade.

use thiserror::Error;

/// Result type alias for KV operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during KV operations. Absence of a record is not an
/// error; reads return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    Connect(String),

    #[error("failed to decode record at {key}: {message}")]
    Decode { key: String, message: String },

    #[error("store error: {0}")]
    Transient(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Transient(err.to_string())
    }
}

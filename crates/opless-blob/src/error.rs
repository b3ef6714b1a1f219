//! Error types for blob staging.

use thiserror::Error;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("unrecognized archive format")]
    UnknownFormat,

    #[error("failed to extract archive: {0}")]
    Extract(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        BlobError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Extract(err.to_string())
    }
}

//! Lifecycle error taxonomy.
//!
//! Every failure surfaced by the manager's services folds into one of these
//! kinds; the HTTP layer maps kinds to status codes and async task results.

use thiserror::Error;

use opless_blob::BlobError;
use opless_docker::HostError;
use opless_store::StoreError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Caller input malformed. Never retried.
    #[error("{0}")]
    Validation(String),

    /// A referenced entity is absent.
    #[error("{0}")]
    NotFound(String),

    /// Single-flight gate held, or a name/path is already taken.
    #[error("{0}")]
    Conflict(String),

    /// KV, blob store, or container host unavailable. Retryable.
    #[error("{0}")]
    Dependency(String),

    /// Decode failure or invariant violation.
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Decode { .. } => LifecycleError::Internal(err.to_string()),
            StoreError::Connect(_) | StoreError::Transient(_) => {
                LifecycleError::Dependency(err.to_string())
            }
        }
    }
}

impl From<BlobError> for LifecycleError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(_) => LifecycleError::NotFound(err.to_string()),
            BlobError::UnknownFormat | BlobError::Extract(_) => {
                LifecycleError::Validation(err.to_string())
            }
            BlobError::Storage(_) => LifecycleError::Dependency(err.to_string()),
        }
    }
}

impl From<HostError> for LifecycleError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::ImageExists(_) => LifecycleError::Conflict(err.to_string()),
            HostError::Incomplete => LifecycleError::Internal(err.to_string()),
            HostError::Build(_) | HostError::Network(_) | HostError::Api(_) => {
                LifecycleError::Dependency(err.to_string())
            }
        }
    }
}

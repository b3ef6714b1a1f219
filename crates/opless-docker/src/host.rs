//! The container-host contract.
//!
//! The lifecycle engine talks to the host exclusively through this trait so
//! tests can substitute a scripted fake for the Docker daemon.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use opless_core::Lambda;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    /// The lambda record lacks the docker fields this call needs.
    #[error("lambda model is not complete")]
    Incomplete,

    #[error("image already exists: {0}")]
    ImageExists(String),

    #[error("image build failed: {0}")]
    Build(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("container host error: {0}")]
    Api(String),
}

/// Observed state of a single container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub running: bool,
    pub restarting: bool,
    /// Health status string (`starting`, `healthy`, `unhealthy`, ...).
    pub health: String,
}

/// A container managed by this deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub names: Vec<String>,
}

/// Capability surface of the container host. Every image and container the
/// adapter creates is labeled with the deployment id so multiple manager
/// installations can share one host.
#[async_trait]
pub trait ContainerHost: Send + Sync {
    /// Build the lambda's image from a tar build context (rejecting a
    /// duplicate image tag for this deployment), then create its container.
    async fn create(&self, lambda: &Lambda, context: Bytes) -> HostResult<String>;

    /// Create a container from the lambda's already-built image and attach
    /// it to the internal network under an alias equal to the lambda name.
    /// Rolls back the created container on a later step's failure.
    async fn create_container(&self, lambda: &Lambda) -> HostResult<String>;

    /// Start the lambda's container. No-op when already running or
    /// restarting.
    async fn start(&self, lambda: &Lambda) -> HostResult<()>;

    /// Stop the lambda's container. No-op when not running or restarting.
    async fn stop(&self, lambda: &Lambda) -> HostResult<()>;

    /// Stop, remove the container, then remove the image.
    async fn remove(&self, lambda: &Lambda) -> HostResult<()>;

    /// Inspect a container by id.
    async fn inspect(&self, id: &str) -> HostResult<ContainerInfo>;

    /// All containers labeled with this deployment id.
    async fn list(&self) -> HostResult<Vec<ManagedContainer>>;
}

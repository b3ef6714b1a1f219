//! The lambda lifecycle engine.
//!
//! Single writer for every Lambda transition: bootstrap, start, destroy,
//! restart recovery, and per-lambda health inspection. Operations on the
//! same identity are serialized by single-flight gates; release is tied to
//! guard drop so a panicking operation cannot wedge its lambda.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use opless_blob::BlobStore;
use opless_core::{
    epoch_millis, fresh_id, CreateLambda, CreateRuntime, DockerState, Lambda, LambdaType,
    Runtime, LAMBDA_PREFIX, RUNTIME_PREFIX,
};
use opless_data::{ConcurrentMap, ConcurrentSet};
use opless_docker::ContainerHost;
use opless_store::KvStore;

use crate::error::{LifecycleError, LifecycleResult};

/// Default period of the per-lambda inspect loop.
const INSPECT_PERIOD: Duration = Duration::from_secs(10);

struct Inner {
    store: KvStore,
    blobs: BlobStore,
    host: Arc<dyn ContainerHost>,
    /// Bootstrap gate, keyed by staged blob id.
    bootstrapping: ConcurrentSet<String>,
    /// Start/destroy gate, keyed by lambda id.
    processing: ConcurrentSet<String>,
    /// In-memory mirror of persisted lambda records.
    lambdas: ConcurrentMap<String, Lambda>,
    /// Shutdown senders for running inspect loops, keyed by lambda id.
    inspectors: ConcurrentMap<String, watch::Sender<bool>>,
    inspect_period: Duration,
}

/// Clonable handle to the lifecycle engine.
#[derive(Clone)]
pub struct LambdaService {
    inner: Arc<Inner>,
}

impl LambdaService {
    pub fn new(store: KvStore, blobs: BlobStore, host: Arc<dyn ContainerHost>) -> Self {
        Self::with_inspect_period(store, blobs, host, INSPECT_PERIOD)
    }

    pub fn with_inspect_period(
        store: KvStore,
        blobs: BlobStore,
        host: Arc<dyn ContainerHost>,
        inspect_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                blobs,
                host,
                bootstrapping: ConcurrentSet::new(),
                processing: ConcurrentSet::new(),
                lambdas: ConcurrentMap::new(),
                inspectors: ConcurrentMap::new(),
                inspect_period,
            }),
        }
    }

    /// Recover state after a manager restart: reload every lambda, revive
    /// lambdas whose containers were lost while we were down, and resume
    /// their inspect loops. The first unrecoverable lambda aborts startup.
    pub async fn init(&self) -> LifecycleResult<()> {
        let records: Vec<Lambda> = self.inner.store.scan(LAMBDA_PREFIX).await?;
        for lambda in records {
            self.inner.lambdas.insert(lambda.id.clone(), lambda);
        }

        for mut lambda in self.inner.lambdas.values() {
            let Some(container_id) = lambda.container_id().map(str::to_string) else {
                continue;
            };

            match self.inner.host.inspect(&container_id).await {
                Ok(_) => {
                    // Container survived; start is a no-op unless stopped.
                    if let Err(e) = self.inner.host.start(&lambda).await {
                        error!(
                            lambda = %lambda.id,
                            container_id = %container_id,
                            error = %e,
                            "failed to start recovered lambda"
                        );
                    }
                }
                Err(_) => {
                    let new_id = match self.inner.host.create_container(&lambda).await {
                        Ok(id) => id,
                        Err(e) => {
                            debug!(
                                lambda = %lambda.id,
                                error = %e,
                                "recreate from image failed, rebuilding"
                            );
                            self.build_and_start(&mut lambda).await?
                        }
                    };

                    if !new_id.is_empty() {
                        if let Some(docker) = lambda.docker.as_mut() {
                            docker.container_id = Some(new_id);
                        }
                        lambda.updated_at = epoch_millis();
                        self.persist(lambda.clone()).await?;
                    }
                }
            }
        }

        for lambda in self.inner.lambdas.values() {
            if lambda.container_id().is_some() {
                self.spawn_inspector(&lambda);
            }
        }

        info!(lambdas = self.inner.lambdas.len(), "lifecycle engine initialized");
        Ok(())
    }

    /// Persist a new runtime from a staged Dockerfile.
    pub async fn bootstrap_runtime(&self, req: CreateRuntime) -> LifecycleResult<Runtime> {
        let _gate = self
            .inner
            .bootstrapping
            .acquire(req.dockerfile.clone())
            .ok_or_else(|| {
                LifecycleError::Conflict(format!(
                    "upload '{}' is already being bootstrapped",
                    req.dockerfile
                ))
            })?;

        let id = fresh_id();
        self.inner.blobs.bootstrap_runtime(&id, &req.dockerfile).await?;

        let now = epoch_millis();
        let runtime = Runtime {
            id: id.clone(),
            name: req.name,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .store
            .set(&format!("{RUNTIME_PREFIX}:{id}"), &runtime)
            .await?;

        info!(runtime = %runtime.id, name = %runtime.name, "runtime bootstrapped");
        Ok(runtime)
    }

    /// Extract a staged archive and persist a new lambda in CREATED state.
    pub async fn bootstrap_lambda(&self, req: CreateLambda) -> LifecycleResult<Lambda> {
        let _gate = self
            .inner
            .bootstrapping
            .acquire(req.archive.clone())
            .ok_or_else(|| {
                LifecycleError::Conflict(format!(
                    "upload '{}' is already being bootstrapped",
                    req.archive
                ))
            })?;

        let existing: Option<Lambda> = self.inner.store.get(LAMBDA_PREFIX, &req.name).await?;
        if existing.is_some() {
            return Err(LifecycleError::Conflict(format!(
                "lambda '{}' already exists",
                req.name
            )));
        }

        let runtime: Option<Runtime> = self.inner.store.get(RUNTIME_PREFIX, &req.runtime).await?;
        if runtime.is_none() {
            return Err(LifecycleError::NotFound(format!(
                "runtime is not found: {}",
                req.runtime
            )));
        }

        let lambda_type = match req.lambda_type.as_str() {
            "ENDPOINT" => LambdaType::Endpoint,
            "INTERNAL" => LambdaType::Internal,
            other => {
                return Err(LifecycleError::Validation(format!(
                    "invalid 'lambda_type' value: {other}"
                )))
            }
        };

        self.inner.blobs.bootstrap_lambda(&req.name, &req.archive).await?;

        let now = epoch_millis();
        let lambda = Lambda {
            id: req.name.clone(),
            name: req.name,
            created_at: now,
            updated_at: now,
            runtime: req.runtime,
            lambda_type,
            docker: None,
        };
        self.persist(lambda.clone()).await?;

        info!(lambda = %lambda.id, "lambda bootstrapped");
        Ok(lambda)
    }

    /// Build the lambda's image, create and start its container, and begin
    /// supervising it.
    pub async fn start(&self, id: &str) -> LifecycleResult<()> {
        let _gate = self.processing_gate(id)?;

        let mut lambda: Lambda = self
            .inner
            .store
            .get(LAMBDA_PREFIX, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("lambda is not found: {id}")))?;

        self.build_and_start(&mut lambda).await?;
        lambda.updated_at = epoch_millis();
        self.persist(lambda.clone()).await?;

        self.spawn_inspector(&lambda);
        info!(lambda = %lambda.id, "lambda started");
        Ok(())
    }

    /// Tear the lambda's container and image down and clear its docker
    /// binding. The record itself survives for a later restart.
    pub async fn destroy(&self, id: &str) -> LifecycleResult<()> {
        let _gate = self.processing_gate(id)?;

        let mut lambda: Lambda = self
            .inner
            .store
            .get(LAMBDA_PREFIX, id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("lambda is not found: {id}")))?;

        self.stop_inspector(id);
        self.inner.host.remove(&lambda).await?;

        lambda.docker = None;
        lambda.updated_at = epoch_millis();
        self.persist(lambda).await?;

        info!(lambda = %id, "lambda destroyed");
        Ok(())
    }

    /// Graceful shutdown: cancel every inspect loop, then stop every running
    /// container, best-effort.
    pub async fn stop(&self) {
        for (_, shutdown) in self.inner.inspectors.drain() {
            let _ = shutdown.send(true);
        }

        for lambda in self.inner.lambdas.values() {
            if lambda.container_id().is_none() {
                continue;
            }
            if let Err(e) = self.inner.host.stop(&lambda).await {
                error!(lambda = %lambda.id, error = %e, "failed to stop lambda container");
            }
        }
    }

    fn processing_gate(&self, id: &str) -> LifecycleResult<opless_data::SetGuard<String>> {
        self.inner.processing.acquire(id.to_string()).ok_or_else(|| {
            LifecycleError::Conflict(format!("lambda '{id}' is already being processed"))
        })
    }

    /// Assemble the build context, build + create + start the container, and
    /// record the docker binding on `lambda`. Returns the container id.
    async fn build_and_start(&self, lambda: &mut Lambda) -> LifecycleResult<String> {
        let context = self
            .inner
            .blobs
            .tar_context(&lambda.id, &lambda.runtime)
            .await?;

        let docker = lambda.docker.get_or_insert_with(DockerState::default);
        docker.image = Some(lambda.name.clone());
        docker.container = Some(format!("opless-{}", lambda.name));

        let container_id = self.inner.host.create(lambda, context).await?;
        if let Some(docker) = lambda.docker.as_mut() {
            docker.container_id = Some(container_id.clone());
        }

        self.inner.host.start(lambda).await?;
        Ok(container_id)
    }

    async fn persist(&self, lambda: Lambda) -> LifecycleResult<()> {
        self.inner
            .store
            .set(&format!("{LAMBDA_PREFIX}:{}", lambda.id), &lambda)
            .await?;
        self.inner.lambdas.insert(lambda.id.clone(), lambda);
        Ok(())
    }

    fn spawn_inspector(&self, lambda: &Lambda) {
        let Some(container_id) = lambda.container_id().map(str::to_string) else {
            return;
        };

        // Replace any loop already supervising this lambda.
        self.stop_inspector(&lambda.id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.inspectors.insert(lambda.id.clone(), shutdown_tx);

        tokio::spawn(run_inspect_loop(
            self.inner.store.clone(),
            self.inner.lambdas.clone(),
            Arc::clone(&self.inner.host),
            lambda.id.clone(),
            container_id,
            self.inner.inspect_period,
            shutdown_rx,
        ));
    }

    fn stop_inspector(&self, id: &str) {
        if let Some(shutdown) = self.inner.inspectors.remove(&id.to_string()) {
            let _ = shutdown.send(true);
        }
    }
}

/// Per-lambda supervision: poll the container and reconcile the observed
/// health into the persisted record. Errors never terminate the loop; only
/// cancellation does.
async fn run_inspect_loop(
    store: KvStore,
    lambdas: ConcurrentMap<String, Lambda>,
    host: Arc<dyn ContainerHost>,
    lambda_id: String,
    container_id: String,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(lambda = %lambda_id, container_id = %container_id, "inspect loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                inspect_once(&store, &lambdas, &host, &lambda_id, &container_id).await;
            }
            _ = shutdown.changed() => {
                debug!(lambda = %lambda_id, "inspect loop shutting down");
                break;
            }
        }
    }
}

async fn inspect_once(
    store: &KvStore,
    lambdas: &ConcurrentMap<String, Lambda>,
    host: &Arc<dyn ContainerHost>,
    lambda_id: &str,
    container_id: &str,
) {
    let status = match host.inspect(container_id).await {
        Ok(info) => info.health,
        Err(e) => {
            error!(
                lambda = %lambda_id,
                container_id = %container_id,
                error = %e,
                "failed to inspect container"
            );
            "error".to_string()
        }
    };

    let mut actual: Lambda = match store.get(LAMBDA_PREFIX, lambda_id).await {
        Ok(Some(lambda)) => lambda,
        Ok(None) => {
            error!(lambda = %lambda_id, "lambda record is gone");
            return;
        }
        Err(e) => {
            error!(lambda = %lambda_id, error = %e, "failed to read lambda record");
            return;
        }
    };

    let persisted = actual.docker.as_ref().and_then(|d| d.status.as_deref());
    if persisted == Some(status.as_str()) {
        return;
    }
    // Destroyed while we were polling; nothing to reconcile.
    let Some(docker) = actual.docker.as_mut() else {
        return;
    };

    docker.status = Some(status);
    actual.updated_at = epoch_millis();
    if let Err(e) = store
        .set(&format!("{LAMBDA_PREFIX}:{lambda_id}"), &actual)
        .await
    {
        error!(
            lambda = %lambda_id,
            container_id = %container_id,
            error = %e,
            "failed to update lambda status"
        );
        return;
    }
    lambdas.insert(lambda_id.to_string(), actual);
}

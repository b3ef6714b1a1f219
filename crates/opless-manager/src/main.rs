//! opless-manager — the lifecycle process.
//!
//! Startup order: config, KV (fatal after retries), deployment id, blob
//! buckets (fatal), container host, lifecycle recovery, HTTP. Shutdown:
//! drain HTTP briefly, then stop supervised containers best-effort.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use opless_blob::{BlobConfig, BlobStore};
use opless_core::ManagerConfig;
use opless_docker::{ContainerHost, DockerHost};
use opless_manager::{api, AppState, EndpointService, LambdaService, TaskService};
use opless_store::KvStore;

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const LAMBDA_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let config = ManagerConfig::from_env()?;

    let store = KvStore::connect(&config.redis_endpoint).await?;
    let deployment_id = store.deployment_id().await?;
    info!(%deployment_id, "manager starting");

    let blobs = BlobStore::connect(&BlobConfig {
        endpoint: config.minio_endpoint.clone(),
        access_key: config.minio_access_key.clone(),
        secret_key: config.minio_secret_key.clone(),
        tmp_ttl: Duration::from_secs(config.tmp_ttl_secs),
    })?;
    blobs.ensure_buckets().await?;
    info!("blob buckets ensured");

    let host: Arc<dyn ContainerHost> = Arc::new(DockerHost::connect(
        deployment_id,
        config.internal_network.clone(),
    )?);

    let lambdas = LambdaService::new(store.clone(), blobs.clone(), host);
    lambdas
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("lifecycle recovery failed: {e}"))?;

    let state = AppState {
        endpoints: EndpointService::new(store.clone()),
        tasks: TaskService::new(),
        lambdas: lambdas.clone(),
        store,
        blobs,
    };
    let app = api::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "manager API listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, server).await {
        Ok(result) => result??,
        Err(_) => warn!("http drain timed out"),
    }

    if tokio::time::timeout(LAMBDA_STOP_TIMEOUT, lambdas.stop())
        .await
        .is_err()
    {
        warn!("lambda shutdown timed out");
    }

    info!("manager stopped");
    Ok(())
}

//! opless-router — the proxy process.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use opless_core::{Endpoint, RouterConfig, ENDPOINT_PREFIX};
use opless_router::{build_router, spawn_watch, ProxyState, RouteTable};
use opless_store::KvStore;

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let config = RouterConfig::from_env()?;

    let store = KvStore::connect(&config.redis_endpoint).await?;
    let table = RouteTable::new();
    table.load(&store).await?;

    let sub = store.subscribe::<Endpoint>(ENDPOINT_PREFIX).await?;
    let watcher = spawn_watch(table.clone(), sub);

    let state = ProxyState {
        table,
        client: reqwest::Client::new(),
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "router listening");

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

    watcher.abort();
    info!("router stopped");
    Ok(())
}

//! Route table for the manager's REST surface.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use opless_blob::BlobStore;
use opless_store::KvStore;

use crate::endpoints::EndpointService;
use crate::handlers;
use crate::lifecycle::LambdaService;
use crate::tasks::TaskService;

/// Largest accepted upload (code archives and Dockerfiles).
const MAX_UPLOAD_BYTES: usize = 128 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: KvStore,
    pub blobs: BlobStore,
    pub lambdas: LambdaService,
    pub endpoints: EndpointService,
    pub tasks: TaskService,
}

/// Build the manager's API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(handlers::upload))
        .route(
            "/lambda",
            get(handlers::list_lambdas).post(handlers::create_lambda),
        )
        .route("/lambda/{id}", get(handlers::get_lambda))
        .route("/lambda/{id}/start", post(handlers::start_lambda))
        .route("/lambda/{id}/destroy", post(handlers::destroy_lambda))
        .route(
            "/runtime",
            get(handlers::list_runtimes).post(handlers::create_runtime),
        )
        .route("/runtime/{id}", get(handlers::get_runtime))
        .route(
            "/endpoint",
            get(handlers::list_endpoints).post(handlers::create_endpoint),
        )
        .route("/endpoint/{id}", get(handlers::get_endpoint))
        .route("/task/{id}", get(handlers::get_task))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

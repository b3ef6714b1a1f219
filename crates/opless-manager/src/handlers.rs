//! REST API handlers for the manager.
//!
//! Thin adaptation only: validate, call the service, map the error kind to a
//! status code. Error bodies are always `{"error": "<message>"}`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use opless_core::{
    fresh_id, validate, CreateEndpoint, CreateLambda, CreateRuntime, Endpoint, Lambda, Runtime,
    ENDPOINT_PREFIX, LAMBDA_PREFIX, RUNTIME_PREFIX,
};

use crate::api::AppState;
use crate::error::LifecycleError;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Create-path failures all surface as 400, matching the API contract;
/// dependency and internal failures are 500.
fn create_error(err: LifecycleError) -> Response {
    match err {
        LifecycleError::Validation(_)
        | LifecycleError::NotFound(_)
        | LifecycleError::Conflict(_) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        LifecycleError::Dependency(_) | LifecycleError::Internal(_) => {
            error!(error = %err, "create failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "internal server error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

// ── Upload ─────────────────────────────────────────────────────────

/// POST /upload — stage a multipart `file` into the tmp bucket.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(e) => return internal_error(e),
                };
                return match state.blobs.upload_tmp(data).await {
                    Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
                    Err(e) => internal_error(e),
                };
            }
            Ok(Some(_)) => continue,
            Ok(None) => return internal_error("missing 'file' field"),
            Err(e) => return internal_error(e),
        }
    }
}

// ── Lambdas ────────────────────────────────────────────────────────

/// GET /lambda
pub async fn list_lambdas(State(state): State<AppState>) -> Response {
    match state.store.scan::<Lambda>(LAMBDA_PREFIX).await {
        Ok(lambdas) => Json(lambdas).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /lambda/:id
pub async fn get_lambda(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get::<Lambda>(LAMBDA_PREFIX, &id).await {
        Ok(Some(lambda)) => Json(lambda).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "lambda not found"),
        Err(e) => internal_error(e),
    }
}

/// POST /lambda
pub async fn create_lambda(
    State(state): State<AppState>,
    payload: Result<Json<CreateLambda>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.body_text()),
    };
    if let Err(e) = validate::validate_create_lambda(&req) {
        return error_response(StatusCode::BAD_REQUEST, &e.to_string());
    }

    match state.lambdas.bootstrap_lambda(req).await {
        Ok(lambda) => (StatusCode::CREATED, Json(lambda)).into_response(),
        Err(e) => create_error(e),
    }
}

/// POST /lambda/:id/start — async; returns a task receipt.
pub async fn start_lambda(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task = fresh_id();
    state.tasks.add(&task);

    let lambdas = state.lambdas.clone();
    let tasks = state.tasks.clone();
    let receipt = task.clone();
    tokio::spawn(async move {
        match lambdas.start(&id).await {
            Ok(()) => tasks.succeeded(&receipt, None),
            Err(e) => tasks.failed(&receipt, Some(json!({ "error": e.to_string() }))),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "task": task }))).into_response()
}

/// POST /lambda/:id/destroy — async; returns a task receipt.
pub async fn destroy_lambda(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let task = fresh_id();
    state.tasks.add(&task);

    let lambdas = state.lambdas.clone();
    let tasks = state.tasks.clone();
    let receipt = task.clone();
    tokio::spawn(async move {
        match lambdas.destroy(&id).await {
            Ok(()) => tasks.succeeded(&receipt, None),
            Err(e) => tasks.failed(&receipt, Some(json!({ "error": e.to_string() }))),
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "task": task }))).into_response()
}

// ── Runtimes ───────────────────────────────────────────────────────

/// GET /runtime
pub async fn list_runtimes(State(state): State<AppState>) -> Response {
    match state.store.scan::<Runtime>(RUNTIME_PREFIX).await {
        Ok(runtimes) => Json(runtimes).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /runtime/:id
pub async fn get_runtime(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get::<Runtime>(RUNTIME_PREFIX, &id).await {
        Ok(Some(runtime)) => Json(runtime).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "runtime not found"),
        Err(e) => internal_error(e),
    }
}

/// POST /runtime
pub async fn create_runtime(
    State(state): State<AppState>,
    payload: Result<Json<CreateRuntime>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.body_text()),
    };
    if let Err(e) = validate::validate_create_runtime(&req) {
        return error_response(StatusCode::BAD_REQUEST, &e.to_string());
    }

    match state.lambdas.bootstrap_runtime(req).await {
        Ok(runtime) => (StatusCode::CREATED, Json(runtime)).into_response(),
        Err(e) => create_error(e),
    }
}

// ── Endpoints ──────────────────────────────────────────────────────

/// GET /endpoint
pub async fn list_endpoints(State(state): State<AppState>) -> Response {
    match state.store.scan::<Endpoint>(ENDPOINT_PREFIX).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /endpoint/:id
pub async fn get_endpoint(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.endpoints.get(&id).await {
        Ok(Some(endpoint)) => Json(endpoint).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "endpoint not found"),
        Err(e) => internal_error(e),
    }
}

/// POST /endpoint
pub async fn create_endpoint(
    State(state): State<AppState>,
    payload: Result<Json<CreateEndpoint>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.body_text()),
    };
    if let Err(e) = validate::validate_create_endpoint(&req) {
        return error_response(StatusCode::BAD_REQUEST, &e.to_string());
    }

    match state.endpoints.create(req).await {
        Ok(endpoint) => (StatusCode::CREATED, Json(endpoint)).into_response(),
        Err(e) => create_error(e),
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// GET /task/:id
pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.tasks.get(&id) {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "task not found"),
    }
}

//! The reverse-proxy handler.
//!
//! Every inbound request is resolved through the route table and forwarded
//! verbatim to the function container; status, headers, and body mirror
//! back. Table misses are the caller's problem (400); transport failures
//! toward the backend are ours (500).

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::table::RouteTable;

/// Largest request body the proxy will buffer for a forward.
const MAX_PROXY_BODY: usize = 128 * 1024 * 1024;

/// Headers that describe the connection rather than the payload; never
/// forwarded in either direction.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

#[derive(Clone)]
pub struct ProxyState {
    pub table: RouteTable,
    pub client: reqwest::Client,
}

/// Build the router: a single catch-all proxy handler for every method and
/// path.
pub fn build_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn proxy(State(state): State<ProxyState>, req: Request) -> Response {
    info!(url = %req.uri(), "new request");

    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let target = match state.table.redirect_url(&path, query.as_deref()) {
        Ok(target) => target,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_PROXY_BODY).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let mut headers = parts.headers;
    headers.remove(http::header::HOST);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }

    let upstream = match state
        .client
        .request(parts.method, target.as_str())
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(%target, error = %e, "proxy forward failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(%target, error = %e, "failed to read upstream body");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    (status, headers, body).into_response()
}

//! Shared domain types used across opless crates.
//!
//! Entity records are persisted as JSON under `<kind>:<id>` keys in the KV
//! store and use `camelCase` field names. Create-request bodies come from the
//! HTTP API and use `snake_case`.

use serde::{Deserialize, Serialize};

/// KV key prefix for lambda records.
pub const LAMBDA_PREFIX: &str = "lambda";
/// KV key prefix for runtime records.
pub const RUNTIME_PREFIX: &str = "runtime";
/// KV key prefix for endpoint records.
pub const ENDPOINT_PREFIX: &str = "endpoint";
/// Singleton key holding the per-installation deployment id.
pub const DEPLOYMENT_ID_KEY: &str = "opless-id";

/// Port every function container listens on inside the internal network.
pub const LAMBDA_PORT: u16 = 3000;

// ── Runtime ────────────────────────────────────────────────────────

/// A named container build recipe. The Dockerfile content itself lives in
/// the blob store under `runtime/<id>`; the record is immutable after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Lambda ─────────────────────────────────────────────────────────

/// A deployable function. `id` always equals `name`; code files live in the
/// blob store under `lambda/<id>/<relpath>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lambda {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Id of the runtime this lambda is built from.
    pub runtime: String,
    pub lambda_type: LambdaType,
    /// Container state; absent until Start, cleared by Destroy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerState>,
}

impl Lambda {
    /// Id of the running container, if one has been created.
    pub fn container_id(&self) -> Option<&str> {
        self.docker.as_ref()?.container_id.as_deref()
    }
}

/// Whether a lambda may be bound to an external URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LambdaType {
    #[serde(rename = "ENDPOINT")]
    Endpoint,
    #[serde(rename = "INTERNAL")]
    Internal,
}

/// Image/container binding for a started lambda.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerState {
    /// Image tag (the lambda name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Friendly container name (`opless-<name>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Last observed health status (`starting`, `healthy`, `unhealthy`,
    /// `error`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ── Endpoint ───────────────────────────────────────────────────────

/// A path-prefix binding from an external URL to a lambda name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// URL path prefix, unique across endpoints.
    pub path: String,
    /// Name/id of the lambda requests are forwarded to.
    pub lambda: String,
}

// ── Create requests ────────────────────────────────────────────────

/// Request body for `POST /lambda`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLambda {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub lambda_type: String,
    /// Staged archive id returned by `POST /upload`.
    #[serde(default)]
    pub archive: String,
}

/// Request body for `POST /runtime`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRuntime {
    #[serde(default)]
    pub name: String,
    /// Staged Dockerfile id returned by `POST /upload`.
    #[serde(default)]
    pub dockerfile: String,
}

/// Request body for `POST /endpoint`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lambda: String,
    #[serde(default)]
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambda_roundtrips_through_json() {
        let lambda = Lambda {
            id: "hello".to_string(),
            name: "hello".to_string(),
            created_at: 1000,
            updated_at: 1000,
            runtime: "rt-1".to_string(),
            lambda_type: LambdaType::Endpoint,
            docker: Some(DockerState {
                image: Some("hello".to_string()),
                container: Some("opless-hello".to_string()),
                container_id: Some("abc123".to_string()),
                status: Some("healthy".to_string()),
            }),
        };

        let json = serde_json::to_string(&lambda).unwrap();
        let back: Lambda = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lambda);
    }

    #[test]
    fn lambda_serializes_camel_case_and_tagged_type() {
        let lambda = Lambda {
            id: "hello".to_string(),
            name: "hello".to_string(),
            created_at: 1000,
            updated_at: 2000,
            runtime: "rt-1".to_string(),
            lambda_type: LambdaType::Internal,
            docker: None,
        };

        let value: serde_json::Value = serde_json::to_value(&lambda).unwrap();
        assert_eq!(value["createdAt"], 1000);
        assert_eq!(value["updatedAt"], 2000);
        assert_eq!(value["lambdaType"], "INTERNAL");
        // Absent docker is omitted entirely.
        assert!(value.get("docker").is_none());
    }

    #[test]
    fn docker_state_omits_absent_fields() {
        let value: serde_json::Value = serde_json::to_value(DockerState {
            container_id: Some("abc".to_string()),
            ..DockerState::default()
        })
        .unwrap();

        assert_eq!(value["containerId"], "abc");
        assert!(value.get("image").is_none());
        assert!(value.get("status").is_none());
    }

    #[test]
    fn create_lambda_tolerates_missing_fields() {
        let req: CreateLambda = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(req.name, "x");
        assert!(req.runtime.is_empty());
        assert!(req.lambda_type.is_empty());
    }
}

//! Endpoint CRUD: path-prefix bindings from external URLs to lambdas.
//!
//! The manager is the only writer; the router picks changes up through the
//! KV store's keyspace events.

use tracing::info;

use opless_core::{
    epoch_millis, fresh_id, CreateEndpoint, Endpoint, Lambda, LambdaType, ENDPOINT_PREFIX,
    LAMBDA_PREFIX,
};
use opless_store::KvStore;

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Clone)]
pub struct EndpointService {
    store: KvStore,
}

impl EndpointService {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> LifecycleResult<Vec<Endpoint>> {
        Ok(self.store.scan(ENDPOINT_PREFIX).await?)
    }

    pub async fn get(&self, id: &str) -> LifecycleResult<Option<Endpoint>> {
        Ok(self.store.get(ENDPOINT_PREFIX, id).await?)
    }

    /// Bind a path prefix to a lambda. The lambda must exist, be of
    /// `ENDPOINT` type, and the path must not be taken.
    pub async fn create(&self, req: CreateEndpoint) -> LifecycleResult<Endpoint> {
        let lambda: Option<Lambda> = self.store.get(LAMBDA_PREFIX, &req.lambda).await?;
        let lambda = lambda.ok_or_else(|| {
            LifecycleError::NotFound(format!("lambda is not found: {}", req.lambda))
        })?;

        if lambda.lambda_type != LambdaType::Endpoint {
            return Err(LifecycleError::Validation(
                "lambda is not an endpoint".to_string(),
            ));
        }

        let existing: Option<Endpoint> = self
            .store
            .find(ENDPOINT_PREFIX, |e: &Endpoint| e.path == req.path)
            .await?;
        if let Some(existing) = existing {
            return Err(LifecycleError::Conflict(format!(
                "endpoint already exists: {}",
                existing.id
            )));
        }

        let now = epoch_millis();
        let endpoint = Endpoint {
            id: fresh_id(),
            name: req.name,
            created_at: now,
            updated_at: now,
            path: req.path,
            lambda: req.lambda,
        };
        self.store
            .set(&format!("{ENDPOINT_PREFIX}:{}", endpoint.id), &endpoint)
            .await?;

        info!(endpoint = %endpoint.id, path = %endpoint.path, lambda = %endpoint.lambda, "endpoint created");
        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_lambda(store: &KvStore, name: &str, lambda_type: LambdaType) {
        let lambda = Lambda {
            id: name.to_string(),
            name: name.to_string(),
            created_at: 1,
            updated_at: 1,
            runtime: "rt-1".to_string(),
            lambda_type,
            docker: None,
        };
        store
            .set(&format!("{LAMBDA_PREFIX}:{name}"), &lambda)
            .await
            .unwrap();
    }

    fn request(path: &str, lambda: &str) -> CreateEndpoint {
        CreateEndpoint {
            name: "h".to_string(),
            lambda: lambda.to_string(),
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn create_persists_endpoint() {
        let store = KvStore::in_memory();
        seed_lambda(&store, "hello", LambdaType::Endpoint).await;
        let svc = EndpointService::new(store.clone());

        let endpoint = svc.create(request("/hello", "hello")).await.unwrap();
        assert_eq!(endpoint.path, "/hello");
        assert_eq!(endpoint.lambda, "hello");

        let listed = svc.list().await.unwrap();
        assert_eq!(listed, vec![endpoint.clone()]);
        assert_eq!(svc.get(&endpoint.id).await.unwrap(), Some(endpoint));
    }

    #[tokio::test]
    async fn create_rejects_missing_lambda() {
        let store = KvStore::in_memory();
        let svc = EndpointService::new(store);

        let err = svc.create(request("/hello", "ghost")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn create_rejects_internal_lambda() {
        let store = KvStore::in_memory();
        seed_lambda(&store, "worker", LambdaType::Internal).await;
        let svc = EndpointService::new(store);

        let err = svc.create(request("/w", "worker")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_path() {
        let store = KvStore::in_memory();
        seed_lambda(&store, "hello", LambdaType::Endpoint).await;
        let svc = EndpointService::new(store);

        svc.create(request("/hello", "hello")).await.unwrap();
        let err = svc.create(request("/hello", "hello")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Conflict(_)), "{err}");
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let svc = EndpointService::new(KvStore::in_memory());
        assert!(svc.get("nope").await.unwrap().is_none());
    }
}

//! The live routing table.
//!
//! Longest-prefix match from URL path to a lambda backend, reconciled from
//! persisted endpoints at startup and keyspace events afterwards.
//! Reconciliation is idempotent: the upstream may redeliver events, and each
//! `Set` first removes the path previously cached for that endpoint id.

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use opless_core::{Endpoint, ENDPOINT_PREFIX, LAMBDA_PORT};
use opless_data::{ConcurrentMap, PrefixTree};
use opless_store::{Event, KvStore, StoreResult, Subscription};

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("route is not found")]
    NotFound,

    #[error("invalid route: {0}")]
    Invalid(String),
}

/// Clonable routing table shared between the proxy handler and the
/// subscription consumer.
#[derive(Clone, Default)]
pub struct RouteTable {
    tree: PrefixTree<String>,
    endpoints: ConcurrentMap<String, Endpoint>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            tree: PrefixTree::new(),
            endpoints: ConcurrentMap::new(),
        }
    }

    /// Register every persisted endpoint. Returns how many routes loaded.
    pub async fn load(&self, store: &KvStore) -> StoreResult<usize> {
        let endpoints: Vec<Endpoint> = store.scan(ENDPOINT_PREFIX).await?;
        let count = endpoints.len();
        for endpoint in endpoints {
            self.apply_set(endpoint);
        }
        info!(routes = count, "routing table loaded");
        Ok(count)
    }

    pub fn apply(&self, event: Event<Endpoint>) {
        match event {
            Event::Set(endpoint) => self.apply_set(endpoint),
            Event::Del(key) => self.apply_del(&key),
        }
    }

    /// Insert or update a route. The endpoint's previous path (if any) is
    /// unregistered first so a path change leaves no stale entry.
    pub fn apply_set(&self, endpoint: Endpoint) {
        if let Some(prev) = self.endpoints.get(&endpoint.id) {
            self.tree.remove(&prev.path);
        }

        info!(route = %endpoint.path, lambda = %endpoint.lambda, "route registered");
        self.tree.add(&endpoint.path, endpoint.lambda.clone());
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    /// Drop the route for a deleted endpoint key (`endpoint:<id>`).
    pub fn apply_del(&self, key: &str) {
        let id = key
            .strip_prefix(&format!("{ENDPOINT_PREFIX}:"))
            .unwrap_or(key);
        if let Some(prev) = self.endpoints.remove(&id.to_string()) {
            info!(route = %prev.path, "route removed");
            self.tree.remove(&prev.path);
        }
    }

    /// Resolve a request path to the backend URL it proxies to.
    ///
    /// The longest registered prefix wins. An exact match forwards to `/`;
    /// otherwise the unmatched rest is appended, with a `/` inserted when
    /// the rest doesn't begin with one. The query string carries over.
    pub fn redirect_url(&self, path: &str, query: Option<&str>) -> Result<String, RouteError> {
        let (payload, matched) = self.tree.last_payload(path);
        let lambda = payload.ok_or(RouteError::NotFound)?;

        let mut url = format!("http://{lambda}:{LAMBDA_PORT}");
        if matched.len() == path.len() {
            url.push('/');
        } else {
            let rest = &path[matched.len()..];
            if !rest.starts_with('/') {
                url.push('/');
            }
            url.push_str(rest);
        }
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        url.parse::<http::Uri>()
            .map_err(|e| RouteError::Invalid(e.to_string()))?;
        Ok(url)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Apply endpoint change events to the table until the feed shuts down.
pub fn spawn_watch(table: RouteTable, mut sub: Subscription<Endpoint>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            table.apply(event);
        }
        info!("endpoint subscription closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(id: &str, path: &str, lambda: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            name: id.to_string(),
            created_at: 1,
            updated_at: 1,
            path: path.to_string(),
            lambda: lambda.to_string(),
        }
    }

    #[test]
    fn longest_prefix_dispatch() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));
        table.apply_set(endpoint("e2", "/a/b", "y"));

        assert_eq!(
            table.redirect_url("/a/b/c", None).unwrap(),
            "http://y:3000/c"
        );
        assert_eq!(table.redirect_url("/a/x", None).unwrap(), "http://x:3000/x");
        assert_eq!(table.redirect_url("/a", None).unwrap(), "http://x:3000/");
    }

    #[test]
    fn unmatched_path_is_not_found() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));

        assert_eq!(table.redirect_url("/b", None), Err(RouteError::NotFound));
        assert_eq!(table.redirect_url("/", None), Err(RouteError::NotFound));
    }

    #[test]
    fn rest_without_leading_slash_gets_one() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));
        // Payload sits at "/a"; the rest "bc" lacks a slash.
        assert_eq!(
            table.redirect_url("/abc", None).unwrap(),
            "http://x:3000/bc"
        );
    }

    #[test]
    fn query_string_carries_over() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));

        assert_eq!(
            table.redirect_url("/a/list", Some("page=2")).unwrap(),
            "http://x:3000/list?page=2"
        );
        assert_eq!(
            table.redirect_url("/a", Some("q=1")).unwrap(),
            "http://x:3000/?q=1"
        );
    }

    #[test]
    fn set_replaces_previous_path_for_same_id() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/old", "x"));
        table.apply_set(endpoint("e1", "/new", "x"));

        assert_eq!(table.redirect_url("/old", None), Err(RouteError::NotFound));
        assert_eq!(table.redirect_url("/new", None).unwrap(), "http://x:3000/");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_redelivery_is_idempotent() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));
        table.apply_set(endpoint("e1", "/a", "x"));

        assert_eq!(table.redirect_url("/a", None).unwrap(), "http://x:3000/");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn del_removes_route_and_tolerates_unknown_ids() {
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "x"));

        table.apply_del("endpoint:e1");
        assert_eq!(table.redirect_url("/a", None), Err(RouteError::NotFound));
        assert!(table.is_empty());

        // Deleting something never cached is a no-op.
        table.apply_del("endpoint:ghost");
    }

    #[test]
    fn dangling_route_still_resolves_to_backend() {
        // A deleted lambda leaves the endpoint dangling; dispatch still
        // produces the URL and the proxy surfaces the connection failure.
        let table = RouteTable::new();
        table.apply_set(endpoint("e1", "/a", "gone"));
        assert_eq!(table.redirect_url("/a", None).unwrap(), "http://gone:3000/");
    }

    #[tokio::test]
    async fn load_registers_persisted_endpoints() {
        let store = KvStore::in_memory();
        store
            .set("endpoint:e1", &endpoint("e1", "/hello", "hello"))
            .await
            .unwrap();

        let table = RouteTable::new();
        let count = table.load(&store).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            table.redirect_url("/hello/world", None).unwrap(),
            "http://hello:3000/world"
        );
    }

    #[tokio::test]
    async fn watch_applies_live_updates() {
        let store = KvStore::in_memory();
        let table = RouteTable::new();
        table.load(&store).await.unwrap();
        assert_eq!(table.redirect_url("/x", None), Err(RouteError::NotFound));

        let sub = store.subscribe::<Endpoint>(ENDPOINT_PREFIX).await.unwrap();
        let _watch = spawn_watch(table.clone(), sub);

        store
            .set("endpoint:e1", &endpoint("e1", "/x", "hello"))
            .await
            .unwrap();

        let mut resolved = None;
        for _ in 0..100 {
            if let Ok(url) = table.redirect_url("/x", None) {
                resolved = Some(url);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(resolved.as_deref(), Some("http://hello:3000/"));

        store.delete("endpoint:e1").await.unwrap();
        for _ in 0..100 {
            if table.redirect_url("/x", None).is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(table.redirect_url("/x", None), Err(RouteError::NotFound));
    }
}

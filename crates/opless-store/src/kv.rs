//! Typed key/value facade over Redis.
//!
//! Records are JSON-encoded under `<prefix>:<id>` keys. Two backends sit
//! behind one API: a Redis connection (production) and a process-local map
//! (tests). Both support keyspace-event subscriptions so the router's CDC
//! path is testable without a server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use opless_core::{fresh_id, DEPLOYMENT_ID_KEY};

use crate::error::{StoreError, StoreResult};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
const KEYSPACE_CHANNEL_PREFIX: &str = "__keyspace@0__:";

/// A keyspace change observed through a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// The record at some key under the prefix now has this value.
    Set(T),
    /// The record at this (full) key was deleted or expired.
    Del(String),
}

/// Change feed for one key prefix. Dropping (or `stop`ping) the subscription
/// cancels the consumer task.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Event<T>>,
    handle: JoinHandle<()>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the feed has shut down.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct MemoryInner {
    data: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<(String, String)>,
}

#[derive(Clone)]
enum Backend {
    Redis {
        client: redis::Client,
        manager: ConnectionManager,
    },
    Memory(Arc<MemoryInner>),
}

/// Clonable handle to the shared KV store.
#[derive(Clone)]
pub struct KvStore {
    backend: Backend,
}

impl KvStore {
    /// Connect to Redis at `endpoint` (`host:port` or a full URL), pinging
    /// with a 1-second backoff before giving up.
    pub async fn connect(endpoint: &str) -> StoreResult<Self> {
        let url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("redis://{endpoint}")
        };
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connect(e.to_string()))?;

        let mut last_err = String::new();
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }

            match client.get_connection_manager().await {
                Ok(mut manager) => {
                    let pong: Result<String, _> =
                        redis::cmd("PING").query_async(&mut manager).await;
                    match pong {
                        Ok(_) => {
                            info!(endpoint, "connected to kv store");
                            return Ok(Self {
                                backend: Backend::Redis { client, manager },
                            });
                        }
                        Err(e) => last_err = e.to_string(),
                    }
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        Err(StoreError::Connect(format!(
            "no ping after {CONNECT_ATTEMPTS} attempts: {last_err}"
        )))
    }

    /// Process-local store for tests.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            backend: Backend::Memory(Arc::new(MemoryInner {
                data: Mutex::new(HashMap::new()),
                events,
            })),
        }
    }

    /// Fetch the record at `<prefix>:<id>`. Absence is `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        prefix: &str,
        id: &str,
    ) -> StoreResult<Option<T>> {
        let key = format!("{prefix}:{id}");
        match self.get_raw(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// JSON-encode `value` and write it at `key` with no TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set_raw(key, raw).await
    }

    /// Every decodable record under `<prefix>:`. Undecodable or unreadable
    /// records are logged and skipped; duplicate keys from cursor revisits
    /// are returned once.
    pub async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for key in self.scan_keys(prefix).await? {
            match self.get_raw(&key).await {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(value) => out.push(value),
                    Err(e) => warn!(%key, error = %e, "skipping undecodable record"),
                },
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }

    /// First record under `<prefix>:` matching `predicate`; scanning halts
    /// as soon as it returns true.
    pub async fn find<T: DeserializeOwned>(
        &self,
        prefix: &str,
        predicate: impl Fn(&T) -> bool,
    ) -> StoreResult<Option<T>> {
        for key in self.scan_keys(prefix).await? {
            let value: Option<T> = match self.get_raw(&key).await {
                Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
                _ => None,
            };
            if let Some(value) = value {
                if predicate(&value) {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// Subscribe to keyspace events for keys under `<prefix>:`.
    ///
    /// A `del`/`expired` event emits [`Event::Del`] with the affected key;
    /// any other kind fetches the current value and emits [`Event::Set`],
    /// dropping the event with a log line when the fetch or decode fails.
    pub async fn subscribe<T>(&self, prefix: &str) -> StoreResult<Subscription<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);

        let handle = match &self.backend {
            Backend::Redis { client, manager } => {
                let topic = format!("{KEYSPACE_CHANNEL_PREFIX}{prefix}:*");
                let mut pubsub = client
                    .get_async_pubsub()
                    .await
                    .map_err(|e| StoreError::Connect(e.to_string()))?;
                pubsub.psubscribe(&topic).await?;
                info!(%topic, "subscribed to keyspace events");

                let mut fetcher = manager.clone();
                tokio::spawn(async move {
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let channel = msg.get_channel_name().to_string();
                        let kind: String = match msg.get_payload() {
                            Ok(kind) => kind,
                            Err(e) => {
                                warn!(%channel, error = %e, "unreadable keyspace event");
                                continue;
                            }
                        };
                        let Some(key) = channel.strip_prefix(KEYSPACE_CHANNEL_PREFIX)
                        else {
                            warn!(%channel, "unexpected notification channel");
                            continue;
                        };

                        let event = if kind == "del" || kind == "expired" {
                            Event::Del(key.to_string())
                        } else {
                            let raw: Option<String> = match redis::cmd("GET")
                                .arg(key)
                                .query_async(&mut fetcher)
                                .await
                            {
                                Ok(raw) => raw,
                                Err(e) => {
                                    error!(%key, error = %e, "failed to fetch notified value");
                                    continue;
                                }
                            };
                            let Some(raw) = raw else { continue };
                            match serde_json::from_str(&raw) {
                                Ok(value) => Event::Set(value),
                                Err(e) => {
                                    error!(%key, error = %e, "failed to decode notified value");
                                    continue;
                                }
                            }
                        };

                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                })
            }
            Backend::Memory(inner) => {
                let mut events = inner.events.subscribe();
                let scoped = format!("{prefix}:");
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    loop {
                        let (key, kind) = match events.recv().await {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if !key.starts_with(&scoped) {
                            continue;
                        }

                        let event = if kind == "del" {
                            Event::Del(key)
                        } else {
                            let raw = inner.data.lock().expect("kv lock").get(&key).cloned();
                            let Some(raw) = raw else { continue };
                            match serde_json::from_str(&raw) {
                                Ok(value) => Event::Set(value),
                                Err(_) => continue,
                            }
                        };

                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                })
            }
        };

        Ok(Subscription { rx, handle })
    }

    /// Per-installation deployment id: read the `opless-id` singleton, or
    /// generate and persist one on first run.
    pub async fn deployment_id(&self) -> StoreResult<String> {
        if let Some(id) = self.get_raw(DEPLOYMENT_ID_KEY).await? {
            return Ok(id);
        }

        let id = fresh_id();
        self.set_raw(DEPLOYMENT_ID_KEY, id.clone()).await?;
        Ok(id)
    }

    /// Delete the record at `key`.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        match &self.backend {
            Backend::Redis { manager, .. } => {
                let mut con = manager.clone();
                let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
            }
            Backend::Memory(inner) => {
                inner.data.lock().expect("kv lock").remove(key);
                let _ = inner.events.send((key.to_string(), "del".to_string()));
            }
        }
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> StoreResult<Option<String>> {
        match &self.backend {
            Backend::Redis { manager, .. } => {
                let mut con = manager.clone();
                let raw: Option<String> =
                    redis::cmd("GET").arg(key).query_async(&mut con).await?;
                Ok(raw)
            }
            Backend::Memory(inner) => {
                Ok(inner.data.lock().expect("kv lock").get(key).cloned())
            }
        }
    }

    async fn set_raw(&self, key: &str, raw: String) -> StoreResult<()> {
        match &self.backend {
            Backend::Redis { manager, .. } => {
                let mut con = manager.clone();
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(raw)
                    .query_async(&mut con)
                    .await?;
            }
            Backend::Memory(inner) => {
                inner
                    .data
                    .lock()
                    .expect("kv lock")
                    .insert(key.to_string(), raw);
                let _ = inner.events.send((key.to_string(), "set".to_string()));
            }
        }
        Ok(())
    }

    async fn scan_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        match &self.backend {
            Backend::Redis { manager, .. } => {
                let pattern = format!("{prefix}:*");
                let mut con = manager.clone();
                let mut cursor: u64 = 0;
                let mut seen = HashSet::new();
                let mut keys = Vec::new();
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .query_async(&mut con)
                        .await?;
                    for key in batch {
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                    if next == 0 {
                        return Ok(keys);
                    }
                    cursor = next;
                }
            }
            Backend::Memory(inner) => {
                let scoped = format!("{prefix}:");
                Ok(inner
                    .data
                    .lock()
                    .expect("kv lock")
                    .keys()
                    .filter(|k| k.starts_with(&scoped))
                    .cloned()
                    .collect())
            }
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: String,
        value: u32,
    }

    fn record(id: &str, value: u32) -> Record {
        Record {
            id: id.to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let kv = KvStore::in_memory();
        let rec = record("a", 1);

        kv.set("widget:a", &rec).await.unwrap();
        let back: Option<Record> = kv.get("widget", "a").await.unwrap();
        assert_eq!(back, Some(rec));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let kv = KvStore::in_memory();
        let got: Option<Record> = kv.get("widget", "nope").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn get_undecodable_is_an_error() {
        let kv = KvStore::in_memory();
        kv.set_raw("widget:bad", "not json".to_string()).await.unwrap();

        let got: StoreResult<Option<Record>> = kv.get("widget", "bad").await;
        assert!(matches!(got, Err(StoreError::Decode { .. })));
    }

    #[tokio::test]
    async fn scan_filters_by_prefix_and_skips_garbage() {
        let kv = KvStore::in_memory();
        kv.set("widget:a", &record("a", 1)).await.unwrap();
        kv.set("widget:b", &record("b", 2)).await.unwrap();
        kv.set("gadget:c", &record("c", 3)).await.unwrap();
        kv.set_raw("widget:junk", "%%%".to_string()).await.unwrap();

        let mut all: Vec<Record> = kv.scan("widget").await.unwrap();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(all, vec![record("a", 1), record("b", 2)]);
    }

    #[tokio::test]
    async fn find_returns_first_match() {
        let kv = KvStore::in_memory();
        kv.set("widget:a", &record("a", 1)).await.unwrap();
        kv.set("widget:b", &record("b", 2)).await.unwrap();

        let found: Option<Record> =
            kv.find("widget", |r: &Record| r.value == 2).await.unwrap();
        assert_eq!(found, Some(record("b", 2)));

        let missing: Option<Record> =
            kv.find("widget", |r: &Record| r.value == 9).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn subscribe_sees_sets_and_deletes() {
        let kv = KvStore::in_memory();
        let mut sub: Subscription<Record> = kv.subscribe("widget").await.unwrap();

        kv.set("widget:a", &record("a", 1)).await.unwrap();
        match sub.recv().await.unwrap() {
            Event::Set(rec) => assert_eq!(rec, record("a", 1)),
            other => panic!("expected set, got {other:?}"),
        }

        kv.delete("widget:a").await.unwrap();
        match sub.recv().await.unwrap() {
            Event::Del(key) => assert_eq!(key, "widget:a"),
            other => panic!("expected del, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_ignores_other_prefixes() {
        let kv = KvStore::in_memory();
        let mut sub: Subscription<Record> = kv.subscribe("widget").await.unwrap();

        kv.set("gadget:x", &record("x", 9)).await.unwrap();
        kv.set("widget:a", &record("a", 1)).await.unwrap();

        match sub.recv().await.unwrap() {
            Event::Set(rec) => assert_eq!(rec.id, "a"),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deployment_id_is_stable_across_reads() {
        let kv = KvStore::in_memory();
        let first = kv.deployment_id().await.unwrap();
        let second = kv.deployment_id().await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}

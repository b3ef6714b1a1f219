//! Shared test fixtures: a scripted container host and blob/KV seeding.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use opless_blob::BlobStore;
use opless_core::{epoch_millis, fresh_id, Lambda, Runtime, RUNTIME_PREFIX};
use opless_docker::{ContainerHost, ContainerInfo, HostError, HostResult, ManagedContainer};
use opless_store::KvStore;

/// In-memory stand-in for the Docker daemon. Counts calls and lets tests
/// script failures and health transitions.
pub struct FakeHost {
    create_calls: AtomicUsize,
    create_container_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_create_container: AtomicBool,
    create_delay: Duration,
    containers: Mutex<HashSet<String>>,
    health: Mutex<String>,
    next_id: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            create_calls: AtomicUsize::new(0),
            create_container_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_create_container: AtomicBool::new(false),
            create_delay: Duration::ZERO,
            containers: Mutex::new(HashSet::new()),
            health: Mutex::new("starting".to_string()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_failing_create(self) -> Self {
        self.fail_create.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_failing_create_container(self) -> Self {
        self.fail_create_container.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_health(&self, health: &str) {
        *self.health.lock().unwrap() = health.to_string();
    }

    /// Simulate every container vanishing from the host.
    pub fn drop_containers(&self) {
        self.containers.lock().unwrap().clear();
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn create_container_calls(&self) -> usize {
        self.create_container_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn fresh_container(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("cid-{n}");
        self.containers.lock().unwrap().insert(id.clone());
        id
    }
}

#[async_trait]
impl ContainerHost for FakeHost {
    async fn create(&self, _lambda: &Lambda, _context: Bytes) -> HostResult<String> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(HostError::Build("scripted build failure".to_string()));
        }
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fresh_container())
    }

    async fn create_container(&self, _lambda: &Lambda) -> HostResult<String> {
        if self.fail_create_container.load(Ordering::SeqCst) {
            return Err(HostError::Api("scripted create failure".to_string()));
        }
        self.create_container_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fresh_container())
    }

    async fn start(&self, _lambda: &Lambda) -> HostResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _lambda: &Lambda) -> HostResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, lambda: &Lambda) -> HostResult<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = lambda.container_id() {
            self.containers.lock().unwrap().remove(id);
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> HostResult<ContainerInfo> {
        if !self.containers.lock().unwrap().contains(id) {
            return Err(HostError::Api(format!("no such container: {id}")));
        }
        Ok(ContainerInfo {
            running: true,
            restarting: false,
            health: self.health.lock().unwrap().clone(),
        })
    }

    async fn list(&self) -> HostResult<Vec<ManagedContainer>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|id| ManagedContainer {
                id: id.clone(),
                names: Vec::new(),
            })
            .collect())
    }
}

/// Persist a runtime record plus its recipe blob, as `POST /runtime` would.
pub async fn seed_runtime(store: &KvStore, blobs: &BlobStore, name: &str) -> Runtime {
    let tmp = blobs
        .upload_tmp(Bytes::from_static(b"FROM node:20"))
        .await
        .unwrap();
    let id = fresh_id();
    blobs.bootstrap_runtime(&id, &tmp).await.unwrap();

    let now = epoch_millis();
    let runtime = Runtime {
        id: id.clone(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    };
    store
        .set(&format!("{RUNTIME_PREFIX}:{id}"), &runtime)
        .await
        .unwrap();
    runtime
}

/// Stage a small tar.gz code archive and return its tmp id.
pub async fn upload_archive(blobs: &BlobStore) -> String {
    use std::io::Write;

    let mut builder = tar::Builder::new(Vec::new());
    let data = b"module.exports = () => 'hi'";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "index.js", &data[..]).unwrap();
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    let archive = encoder.finish().unwrap();

    blobs.upload_tmp(Bytes::from(archive)).await.unwrap()
}

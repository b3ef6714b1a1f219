//! Blob staging over S3-compatible object storage.
//!
//! Three buckets back the control plane: `lambda-tmp` for staged uploads
//! (deleted after a TTL), `runtime` for Dockerfile recipes, and `lambda` for
//! extracted function trees under `<id>/<relpath>` keys. An in-memory
//! backend serves tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use tracing::{debug, warn};

use opless_core::fresh_id;

use crate::archive;
use crate::error::{BlobError, BlobResult};

const LAMBDA_BUCKET: &str = "lambda";
const RUNTIME_BUCKET: &str = "runtime";
const TMP_BUCKET: &str = "lambda-tmp";

/// Connection settings for the object-storage backend.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// MinIO/S3 `host:port` or full URL.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Lifetime of staged uploads.
    pub tmp_ttl: Duration,
}

/// Clonable handle to the three blob buckets.
#[derive(Clone)]
pub struct BlobStore {
    tmp: Arc<dyn ObjectStore>,
    lambda: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ObjectStore>,
    tmp_ttl: Duration,
}

impl BlobStore {
    /// Connect to the configured S3-compatible endpoint.
    pub fn connect(config: &BlobConfig) -> BlobResult<Self> {
        Ok(Self {
            tmp: open_bucket(config, TMP_BUCKET)?,
            lambda: open_bucket(config, LAMBDA_BUCKET)?,
            runtime: open_bucket(config, RUNTIME_BUCKET)?,
            tmp_ttl: config.tmp_ttl,
        })
    }

    /// Process-local store for tests.
    pub fn in_memory(tmp_ttl: Duration) -> Self {
        Self {
            tmp: Arc::new(InMemory::new()),
            lambda: Arc::new(InMemory::new()),
            runtime: Arc::new(InMemory::new()),
            tmp_ttl,
        }
    }

    /// Probe every bucket; an unreachable or missing bucket is fatal at
    /// startup. (Bucket provisioning belongs to the environment — the
    /// object-store API has no create-bucket call.)
    pub async fn ensure_buckets(&self) -> BlobResult<()> {
        for (name, store) in [
            (TMP_BUCKET, &self.tmp),
            (LAMBDA_BUCKET, &self.lambda),
            (RUNTIME_BUCKET, &self.runtime),
        ] {
            store.list_with_delimiter(None).await.map_err(|e| {
                BlobError::Storage(format!("bucket '{name}' is not usable: {e}"))
            })?;
        }
        Ok(())
    }

    /// Stage an uploaded file under a fresh id and schedule its deletion
    /// after the configured TTL.
    pub async fn upload_tmp(&self, data: Bytes) -> BlobResult<String> {
        let id = fresh_id();
        let path = ObjectPath::from(id.as_str());
        self.tmp.put(&path, data.into()).await?;

        let store = Arc::clone(&self.tmp);
        let ttl = self.tmp_ttl;
        let blob = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            match store.delete(&ObjectPath::from(blob.as_str())).await {
                Ok(()) => debug!(%blob, "expired staged upload"),
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => warn!(%blob, error = %e, "failed to expire staged upload"),
            }
        });

        Ok(id)
    }

    /// Raw bytes of a staged upload.
    pub async fn fetch_tmp(&self, id: &str) -> BlobResult<Bytes> {
        fetch(&self.tmp, id).await
    }

    /// Promote a staged Dockerfile into the runtime bucket under `id`.
    pub async fn bootstrap_runtime(&self, id: &str, tmp_dockerfile_id: &str) -> BlobResult<()> {
        let recipe = self.fetch_tmp(tmp_dockerfile_id).await?;
        self.runtime
            .put(&ObjectPath::from(id), recipe.into())
            .await?;
        Ok(())
    }

    /// Extract a staged code archive and mirror its tree into the lambda
    /// bucket under `<id>/<relpath>`. Detection or extraction failure aborts
    /// before anything is written.
    pub async fn bootstrap_lambda(&self, id: &str, tmp_archive_id: &str) -> BlobResult<()> {
        let raw = self.fetch_tmp(tmp_archive_id).await?;
        let files = archive::extract(&raw)?;

        for (rel, data) in files {
            let path = ObjectPath::from(format!("{id}/{rel}"));
            self.lambda.put(&path, data.into()).await?;
        }

        Ok(())
    }

    /// Dockerfile recipe stored for a runtime.
    pub async fn runtime_recipe(&self, id: &str) -> BlobResult<Bytes> {
        fetch(&self.runtime, id).await
    }

    /// Assemble the image build context for a lambda: every object under
    /// `<lambda_id>/` at its relative path plus the runtime recipe as
    /// `Dockerfile` at the root, packed as an in-memory tar.
    pub async fn tar_context(&self, lambda_id: &str, runtime_id: &str) -> BlobResult<Bytes> {
        let prefix = ObjectPath::from(lambda_id);
        let metas: Vec<ObjectMeta> = self.lambda.list(Some(&prefix)).try_collect().await?;

        let mut builder = tar::Builder::new(Vec::new());
        let strip = format!("{lambda_id}/");
        for meta in metas {
            let key = meta.location.to_string();
            let Some(rel) = key.strip_prefix(&strip) else {
                continue;
            };
            let data = self.lambda.get(&meta.location).await?.bytes().await?;
            append_file(&mut builder, rel, &data)?;
        }

        let recipe = self.runtime_recipe(runtime_id).await?;
        append_file(&mut builder, "Dockerfile", &recipe)?;

        let tar = builder
            .into_inner()
            .map_err(|e| BlobError::Extract(e.to_string()))?;
        Ok(Bytes::from(tar))
    }
}

fn open_bucket(config: &BlobConfig, bucket: &str) -> BlobResult<Arc<dyn ObjectStore>> {
    let endpoint = if config.endpoint.contains("://") {
        config.endpoint.clone()
    } else {
        format!("http://{}", config.endpoint)
    };

    let store = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("us-east-1")
        .with_endpoint(endpoint)
        .with_access_key_id(config.access_key.clone())
        .with_secret_access_key(config.secret_key.clone())
        .with_allow_http(true)
        .build()
        .map_err(|e| BlobError::Storage(e.to_string()))?;

    Ok(Arc::new(store))
}

async fn fetch(store: &Arc<dyn ObjectStore>, id: &str) -> BlobResult<Bytes> {
    let result = store.get(&ObjectPath::from(id)).await.map_err(|e| match e {
        object_store::Error::NotFound { .. } => BlobError::NotFound(id.to_string()),
        other => other.into(),
    })?;
    Ok(result.bytes().await?)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> BlobResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| BlobError::Extract(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;

    fn store() -> BlobStore {
        BlobStore::in_memory(Duration::from_secs(60))
    }

    fn build_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;

        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let tar = builder.into_inner().unwrap();

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }

    fn read_tar(bytes: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(bytes);
        let mut out = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(path, data);
        }
        out
    }

    #[tokio::test]
    async fn upload_tmp_roundtrips_bytes() {
        let blobs = store();
        let id = blobs.upload_tmp(Bytes::from_static(b"FROM node:20")).await.unwrap();
        let back = blobs.fetch_tmp(&id).await.unwrap();
        assert_eq!(&back[..], b"FROM node:20");
    }

    #[tokio::test]
    async fn upload_tmp_expires_after_ttl() {
        let blobs = BlobStore::in_memory(Duration::from_millis(50));
        let id = blobs.upload_tmp(Bytes::from_static(b"x")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = blobs.fetch_tmp(&id).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn bootstrap_runtime_copies_recipe() {
        let blobs = store();
        let tmp_id = blobs.upload_tmp(Bytes::from_static(b"FROM node:20")).await.unwrap();

        blobs.bootstrap_runtime("rt-1", &tmp_id).await.unwrap();
        let recipe = blobs.runtime_recipe("rt-1").await.unwrap();
        assert_eq!(&recipe[..], b"FROM node:20");
    }

    #[tokio::test]
    async fn bootstrap_runtime_with_expired_upload_fails() {
        let blobs = store();
        let err = blobs.bootstrap_runtime("rt-1", "missing").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn bootstrap_lambda_mirrors_extracted_tree() {
        let blobs = store();
        let archive = build_tar_gz(&[
            ("index.js", b"console.log(1)"),
            ("lib/util.js", b"module.exports = {}"),
        ]);
        let tmp_id = blobs.upload_tmp(Bytes::from(archive)).await.unwrap();

        blobs.bootstrap_lambda("hello", &tmp_id).await.unwrap();

        let data = blobs
            .lambda
            .get(&ObjectPath::from("hello/index.js"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"console.log(1)");

        let data = blobs
            .lambda
            .get(&ObjectPath::from("hello/lib/util.js"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"module.exports = {}");
    }

    #[tokio::test]
    async fn bootstrap_lambda_rejects_garbage_without_partial_writes() {
        let blobs = store();
        let tmp_id = blobs.upload_tmp(Bytes::from_static(b"not an archive")).await.unwrap();

        let err = blobs.bootstrap_lambda("hello", &tmp_id).await.unwrap_err();
        assert!(matches!(err, BlobError::UnknownFormat));

        let metas: Vec<ObjectMeta> = blobs.lambda.list(None).try_collect().await.unwrap();
        assert!(metas.is_empty());
    }

    #[tokio::test]
    async fn tar_context_contains_tree_and_dockerfile() {
        let blobs = store();

        let archive = build_tar_gz(&[
            ("index.js", b"console.log(1)"),
            ("lib/util.js", b"module.exports = {}"),
        ]);
        let tmp_archive = blobs.upload_tmp(Bytes::from(archive)).await.unwrap();
        blobs.bootstrap_lambda("hello", &tmp_archive).await.unwrap();

        let tmp_recipe = blobs.upload_tmp(Bytes::from_static(b"FROM node:20")).await.unwrap();
        blobs.bootstrap_runtime("rt-1", &tmp_recipe).await.unwrap();

        let context = blobs.tar_context("hello", "rt-1").await.unwrap();
        let entries = read_tar(&context);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries["Dockerfile"], b"FROM node:20");
        assert_eq!(entries["index.js"], b"console.log(1)");
        assert_eq!(entries["lib/util.js"], b"module.exports = {}");
    }

    #[tokio::test]
    async fn tar_context_with_missing_runtime_fails() {
        let blobs = store();
        let err = blobs.tar_context("hello", "missing-rt").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }
}

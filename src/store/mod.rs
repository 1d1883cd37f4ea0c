//! Object store client for content blobs.
//!
//! Datasets, algorithm image tarballs, models, metrics, predictions and
//! auxiliary metadata each live in their own bucket, keyed by uuid. The
//! `ObjectStore` trait is the seam between the orchestrator and the
//! deployment's actual blob backend; the filesystem implementation here
//! is the shared-volume shape, with a sha-256 digest recorded for every
//! stored blob.
//!
//! Writes are content-keyed by fresh uuids, so concurrent workers never
//! conflict on unrelated jobs.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Logical namespaces within the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bucket {
    Datasets,
    AlgorithmImages,
    Models,
    Metrics,
    Predictions,
    Metadata,
}

impl Bucket {
    /// Directory name backing this bucket.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Bucket::Datasets => "datasets",
            Bucket::AlgorithmImages => "algorithm-images",
            Bucket::Models => "models",
            Bucket::Metrics => "metrics",
            Bucket::Predictions => "predictions",
            Bucket::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub bucket: Bucket,
    pub key: Uuid,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Errors that can occur against the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Blob {key} not found in bucket '{bucket}'")]
    NotFound { bucket: Bucket, key: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform get/put/delete over the content bucket namespace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches a blob's bytes.
    async fn get(&self, bucket: Bucket, key: Uuid) -> Result<Vec<u8>, StoreError>;

    /// Stores bytes under an explicit key, overwriting any previous
    /// content at that key.
    async fn put(&self, bucket: Bucket, key: Uuid, data: &[u8]) -> Result<BlobRef, StoreError>;

    /// Deletes a blob. Deleting an absent blob is a no-op.
    async fn delete(&self, bucket: Bucket, key: Uuid) -> Result<(), StoreError>;

    /// Whether a blob exists.
    async fn exists(&self, bucket: Bucket, key: Uuid) -> Result<bool, StoreError>;

    /// Stores bytes under a freshly generated key.
    async fn put_new(&self, bucket: Bucket, data: &[u8]) -> Result<BlobRef, StoreError> {
        self.put(bucket, Uuid::new_v4(), data).await
    }
}

/// Filesystem-backed object store: one directory per bucket, one file
/// per blob, named by key.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, bucket: Bucket, key: Uuid) -> PathBuf {
        self.root.join(bucket.dir_name()).join(key.to_string())
    }

    fn digest(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, bucket: Bucket, key: Uuid) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(bucket, key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { bucket, key })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: Bucket, key: Uuid, data: &[u8]) -> Result<BlobRef, StoreError> {
        let path = self.blob_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write through a temp name so a crashed write never leaves a
        // half-visible blob under the real key.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;

        debug!(bucket = %bucket, key = %key, size = data.len(), "Stored blob");

        Ok(BlobRef {
            bucket,
            key,
            size_bytes: data.len() as u64,
            sha256: Self::digest(data),
        })
    }

    async fn delete(&self, bucket: Bucket, key: Uuid) -> Result<(), StoreError> {
        let path = self.blob_path(bucket, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, bucket: Bucket, key: Uuid) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.blob_path(bucket, key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = Uuid::new_v4();

        let blob = store.put(Bucket::Datasets, key, b"a,b\n1,2\n").await.unwrap();
        assert_eq!(blob.key, key);
        assert_eq!(blob.size_bytes, 8);
        assert_eq!(blob.sha256.len(), 64);

        let bytes = store.get(Bucket::Datasets, key).await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_get_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let err = store.get(Bucket::Models, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { bucket: Bucket::Models, .. }));
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = Uuid::new_v4();

        store.put(Bucket::Models, key, b"model").await.unwrap();

        assert!(store.exists(Bucket::Models, key).await.unwrap());
        assert!(!store.exists(Bucket::Metrics, key).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = Uuid::new_v4();

        store.put(Bucket::Predictions, key, b"p").await.unwrap();
        store.delete(Bucket::Predictions, key).await.unwrap();
        store.delete(Bucket::Predictions, key).await.unwrap();

        assert!(!store.exists(Bucket::Predictions, key).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_new_generates_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        let a = store.put_new(Bucket::Metadata, b"x").await.unwrap();
        let b = store.put_new(Bucket::Metadata, b"x").await.unwrap();

        assert_ne!(a.key, b.key);
        assert_eq!(a.sha256, b.sha256);
    }
}

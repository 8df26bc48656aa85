//! Blob storage boundary used for offloaded snapshots.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

/// Opaque handle returned by [`BlobStore::write`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(BlobKey),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    #[error("blob I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Object storage for large payloads.
///
/// `label` is a hint for key layout (e.g. a projector name); implementations
/// choose the final key and must never overwrite an existing blob.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(
        &self,
        label: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BlobKey, BlobStoreError>;

    async fn open_read(
        &self,
        key: &BlobKey,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError>;

    /// Remove a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &BlobKey) -> Result<(), BlobStoreError>;
}

/// Blob store backed by a map; for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn write(
        &self,
        label: &str,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<BlobKey, BlobStoreError> {
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes).await?;

        let key = BlobKey::new(format!("{label}/{}", Uuid::now_v7()));
        self.blobs
            .write()
            .map_err(|_| BlobStoreError::Unavailable("lock poisoned".to_string()))?
            .insert(key.clone(), bytes);
        Ok(key)
    }

    async fn open_read(
        &self,
        key: &BlobKey,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, BlobStoreError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| BlobStoreError::Unavailable("lock poisoned".to_string()))?;
        let bytes = blobs
            .get(key)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(key.clone()))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), BlobStoreError> {
        self.blobs
            .write()
            .map_err(|_| BlobStoreError::Unavailable("lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn written_blobs_read_back_under_their_label() {
        let store = InMemoryBlobStore::new();
        let mut body: &[u8] = b"hello";

        let key = store.write("carts/1", &mut body).await.unwrap();
        let mut reader = store.open_read(&key).await.unwrap();
        let mut read = Vec::new();
        reader.read_to_end(&mut read).await.unwrap();

        assert!(key.as_str().starts_with("carts/1/"));
        assert_eq!(read, b"hello");
    }

    #[tokio::test]
    async fn deleted_blobs_are_gone_and_deleting_twice_is_fine() {
        let store = InMemoryBlobStore::new();
        let mut first: &[u8] = b"one";
        let mut second: &[u8] = b"two";
        let old = store.write("carts", &mut first).await.unwrap();
        let kept = store.write("carts", &mut second).await.unwrap();

        store.delete(&old).await.unwrap();
        store.delete(&old).await.unwrap();

        assert_eq!(store.len(), 1);
        assert!(matches!(store.open_read(&old).await, Err(BlobStoreError::NotFound(_))));
        assert!(store.open_read(&kept).await.is_ok());
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = InMemoryBlobStore::new();
        let result = store.open_read(&BlobKey::new("nope")).await;
        assert!(matches!(result, Err(BlobStoreError::NotFound(_))));
    }
}

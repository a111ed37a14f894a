//! In-memory object store backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

use super::{BlobError, ObjectStore, TRANSFER_BUFFER_SIZE};

/// Object store keeping everything in process memory.
///
/// Counts reads and uploads so tests can assert how often the engine
/// actually touched storage.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    reads: AtomicU64,
    uploads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the upload path.
    pub async fn put(&self, key: &str, data: impl Into<Bytes>) {
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.into());
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Number of ranged reads served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of uploads accepted so far.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, BlobError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read().await;
        let data = objects.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;

        if offset >= data.len() as u64 {
            return Ok(Bytes::new());
        }
        let end = (offset + len).min(data.len() as u64);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn size(&self, key: &str) -> Result<u64, BlobError> {
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), BlobError> {
        let mut objects = self.objects.write().await;
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; TRANSFER_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
        }

        let written = data.len() as u64;
        self.objects
            .write()
            .await
            .insert(key.to_string(), Bytes::from(data));
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }
}

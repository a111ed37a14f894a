//! Retrying, deadline-bounded blob store client.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

use super::{BlobError, ObjectStore, TRANSFER_BUFFER_SIZE};

/// Deadline for ranged reads.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for metadata and delete operations.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff schedule for transient blob store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Factor applied per attempt.
    pub multiplier: u32,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Total attempts before the error surfaces.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            multiplier: 2,
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = (self.multiplier as u64)
            .saturating_pow(attempt)
            .min(u32::MAX as u64) as u32;
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Blob store client applying the operation policy to any backend.
///
/// Every read-side call carries a deadline; transient failures back off
/// per [`RetryPolicy`]. [`BlobError::NotFound`] is terminal and never
/// retried. Uploads are neither retried nor deadline-bounded: the reader
/// has been consumed by the time a failure surfaces, so the caller
/// restarts the upload itself.
#[derive(Clone)]
pub struct BlobClient {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    read_timeout: Duration,
    operation_timeout: Duration,
}

impl BlobClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            read_timeout: READ_TIMEOUT,
            operation_timeout: OPERATION_TIMEOUT,
        }
    }

    /// Replace the retry schedule.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the per-call deadlines.
    pub fn with_timeouts(mut self, read: Duration, operation: Duration) -> Self {
        self.read_timeout = read;
        self.operation_timeout = operation;
        self
    }

    /// Read up to `len` bytes of `key` starting at `offset`.
    pub async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, BlobError> {
        self.retrying(key, self.read_timeout, || {
            self.store.read_range(key, offset, len)
        })
        .await
    }

    /// Object size in bytes.
    pub async fn size(&self, key: &str) -> Result<u64, BlobError> {
        self.retrying(key, self.operation_timeout, || self.store.size(key))
            .await
    }

    /// Delete one object.
    pub async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.retrying(key, self.operation_timeout, || self.store.delete(key))
            .await
    }

    /// Delete every object under a prefix.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<(), BlobError> {
        self.retrying(prefix, self.operation_timeout, || {
            self.store.delete_prefix(prefix)
        })
        .await
    }

    /// Read a whole object.
    pub async fn read_all(&self, key: &str) -> Result<Bytes, BlobError> {
        let size = self.size(key).await?;
        if size == 0 {
            return Ok(Bytes::new());
        }
        self.read_range(key, 0, size).await
    }

    /// Stream an object into the store.
    pub async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let written = self.store.upload(key, reader).await?;
        debug!(key = %key, bytes = written, "Uploaded object");
        Ok(written)
    }

    /// Upload a local file.
    pub async fn upload_file(&self, key: &str, path: &Path) -> Result<u64, BlobError> {
        let mut file = tokio::fs::File::open(path).await?;
        self.upload(key, &mut file).await
    }

    /// Download an object into a local file through a bounded buffer.
    pub async fn download_to(&self, key: &str, path: &Path) -> Result<u64, BlobError> {
        let size = self.size(key).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut offset = 0u64;
        while offset < size {
            let len = (size - offset).min(TRANSFER_BUFFER_SIZE as u64);
            let chunk = self.read_range(key, offset, len).await?;
            if chunk.is_empty() {
                return Err(BlobError::Unavailable {
                    key: key.to_string(),
                    reason: "object shrank during download".to_string(),
                });
            }
            file.write_all(&chunk).await?;
            offset += chunk.len() as u64;
        }
        file.sync_all().await?;

        debug!(key = %key, bytes = offset, path = %path.display(), "Downloaded object");
        Ok(offset)
    }

    async fn retrying<T, F, Fut>(
        &self,
        key: &str,
        deadline: Duration,
        mut op: F,
    ) -> Result<T, BlobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BlobError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(BlobError::Timeout {
                    key: key.to_string(),
                    timeout: deadline,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying blob operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `failures` reads, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, failures: u32) -> Self {
            Self {
                inner,
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FlakyStore {
        async fn read_range(
            &self,
            key: &str,
            offset: u64,
            len: u64,
        ) -> Result<Bytes, BlobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(BlobError::Unavailable {
                    key: key.to_string(),
                    reason: "injected".to_string(),
                });
            }
            self.inner.read_range(key, offset, len).await
        }

        async fn size(&self, key: &str) -> Result<u64, BlobError> {
            self.inner.size(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<(), BlobError> {
            self.inner.delete_prefix(prefix).await
        }

        async fn upload(
            &self,
            key: &str,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<u64, BlobError> {
            self.inner.upload(key, reader).await
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2,
            max_delay: Duration::from_millis(10),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(9), Duration::from_millis(5120));
        // Capped at max_delay from attempt 10 onward
        assert_eq!(policy.delay(10), Duration::from_secs(10));
        assert_eq!(policy.delay(63), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let inner = MemoryStore::new();
        inner.put("k", &b"data"[..]).await;
        let store = Arc::new(FlakyStore::new(inner, 3));

        let client = BlobClient::new(store.clone()).with_retry(fast_retry(10));
        let chunk = client.read_range("k", 0, 4).await.unwrap();
        assert_eq!(&chunk[..], b"data");
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_attempt_cap_surfaces_error() {
        let inner = MemoryStore::new();
        inner.put("k", &b"data"[..]).await;
        let store = Arc::new(FlakyStore::new(inner, u32::MAX));

        let client = BlobClient::new(store.clone()).with_retry(fast_retry(3));
        let err = client.read_range("k", 0, 4).await.unwrap_err();
        assert!(matches!(err, BlobError::Unavailable { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_never_retried() {
        let inner = MemoryStore::new();
        let store = Arc::new(FlakyStore::new(inner, 0));

        let client = BlobClient::new(store.clone()).with_retry(fast_retry(10));
        let err = client.read_range("missing", 0, 4).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_bounded() {
        struct StallingStore;

        #[async_trait::async_trait]
        impl ObjectStore for StallingStore {
            async fn read_range(
                &self,
                _key: &str,
                _offset: u64,
                _len: u64,
            ) -> Result<Bytes, BlobError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Bytes::new())
            }

            async fn size(&self, _key: &str) -> Result<u64, BlobError> {
                Ok(0)
            }

            async fn delete(&self, _key: &str) -> Result<(), BlobError> {
                Ok(())
            }

            async fn delete_prefix(&self, _prefix: &str) -> Result<(), BlobError> {
                Ok(())
            }

            async fn upload(
                &self,
                _key: &str,
                _reader: &mut (dyn AsyncRead + Send + Unpin),
            ) -> Result<u64, BlobError> {
                Ok(0)
            }
        }

        let client = BlobClient::new(Arc::new(StallingStore))
            .with_retry(fast_retry(2))
            .with_timeouts(Duration::from_millis(10), Duration::from_millis(10));

        let err = client.read_range("k", 0, 1).await.unwrap_err();
        assert!(matches!(err, BlobError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_download_to_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("b1/bootdesc", &b"boot config"[..]).await;

        let client = BlobClient::new(store);
        let dest = dir.path().join("bootdesc");
        let n = client.download_to("b1/bootdesc", &dest).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"boot config");
    }
}

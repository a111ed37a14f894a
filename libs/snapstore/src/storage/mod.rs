//! Object store access for template artifacts.
//!
//! The engine consumes blob storage only through the [`ObjectStore`]
//! trait: ranged reads, sizes, deletes and streamed uploads. Real S3/GCS
//! backends implement the trait outside this crate; the in-tree
//! [`MemoryStore`] and [`FsStore`] cover tests and local deployments.
//! [`BlobClient`] layers the operation policy (deadlines, retries with
//! exponential backoff) on top of any backend.

mod client;
mod fs;
mod memory;

pub mod layout;

pub use client::{BlobClient, RetryPolicy};
pub use fs::FsStore;
pub use memory::MemoryStore;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Copy buffer size for streamed transfers.
pub const TRANSFER_BUFFER_SIZE: usize = 2 << 21; // 4 MiB

/// Blob store errors.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Object does not exist. Terminal; never retried.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Backend reachable but failing. Safe to retry.
    #[error("object store unavailable for {key}: {reason}")]
    Unavailable { key: String, reason: String },

    /// Operation exceeded its deadline.
    #[error("operation on {key} timed out after {}ms", timeout.as_millis())]
    Timeout { key: String, timeout: Duration },

    /// Local I/O failure while staging data.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BlobError {
    /// Whether retrying the operation could help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlobError::Unavailable { .. } | BlobError::Timeout { .. }
        )
    }
}

/// Minimal object store surface the engine consumes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only when the object ends inside the range;
    /// an offset at or past the end yields an empty buffer.
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, BlobError>;

    /// Object size in bytes.
    async fn size(&self, key: &str) -> Result<u64, BlobError>;

    /// Delete one object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Delete every object under a key prefix.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), BlobError>;

    /// Stream an object into the store, returning the byte count.
    ///
    /// Implementations copy through a bounded buffer so arbitrarily large
    /// uploads hold a fixed amount of memory.
    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError>;
}

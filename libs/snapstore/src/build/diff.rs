//! Diff artifacts produced by a build.
//!
//! A diff is a sparse image of its artifact: block `i`'s bytes sit at
//! offset `i * block_size`, so whichever source owns a block serves it at
//! the artifact offset. [`Diff::None`] records that an artifact did not
//! change in this build; it is a marker only and owns no data.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::storage::{BlobClient, BlobError};

/// Sparse diff file resident on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDiff {
    path: PathBuf,
}

impl LocalDiff {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Positioned read at an artifact offset, clamped at end of file.
    ///
    /// Opens the file per read; concurrent readers never share a cursor.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, BlobError> {
        let path = self.path.clone();
        let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            use std::os::unix::fs::FileExt;

            let file = std::fs::File::open(&path)?;
            let size = file.metadata()?.len();
            if offset >= size {
                return Ok(Vec::new());
            }
            let end = (offset + len).min(size);
            let mut buf = vec![0u8; (end - offset) as usize];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(|e| BlobError::Io(io::Error::other(e)))??;

        Ok(Bytes::from(data))
    }
}

/// Sparse diff object in the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDiff {
    key: String,
}

impl RemoteDiff {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn read_range(
        &self,
        blob: &BlobClient,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, BlobError> {
        blob.read_range(&self.key, offset, len).await
    }
}

/// One build artifact's change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// Artifact did not change; resolution delegates to the parent build.
    None,
    /// Diff file on this host.
    Local(LocalDiff),
    /// Diff object in the blob store.
    Remote(RemoteDiff),
}

impl Diff {
    pub fn is_none(&self) -> bool {
        matches!(self, Diff::None)
    }

    /// Read a range, addressed in artifact offsets, from the diff's data.
    ///
    /// [`Diff::None`] owns no data; reading it is a caller bug surfaced as
    /// an I/O error rather than silently empty bytes.
    pub async fn read_range(
        &self,
        blob: &BlobClient,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, BlobError> {
        match self {
            Diff::None => Err(BlobError::Io(io::Error::other(
                "read from a no-change diff",
            ))),
            Diff::Local(diff) => diff.read_range(offset, len).await,
            Diff::Remote(diff) => diff.read_range(blob, offset, len).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_local_diff_positioned_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("diff");
        std::fs::write(&path, b"0123456789").unwrap();

        let diff = LocalDiff::new(&path);
        let chunk = diff.read_range(4, 3).await.unwrap();
        assert_eq!(&chunk[..], b"456");

        // Clamped at end of file
        let chunk = diff.read_range(8, 10).await.unwrap();
        assert_eq!(&chunk[..], b"89");

        // Past the end
        let chunk = diff.read_range(20, 4).await.unwrap();
        assert!(chunk.is_empty());
    }

    #[tokio::test]
    async fn test_remote_diff_reads_through_client() {
        let store = Arc::new(MemoryStore::new());
        store.put("b1/memory", &b"abcdef"[..]).await;
        let blob = BlobClient::new(store);

        let diff = Diff::Remote(RemoteDiff::new("b1/memory"));
        let chunk = diff.read_range(&blob, 2, 3).await.unwrap();
        assert_eq!(&chunk[..], b"cde");
    }

    #[tokio::test]
    async fn test_none_diff_refuses_reads() {
        let blob = BlobClient::new(Arc::new(MemoryStore::new()));
        let err = Diff::None.read_range(&blob, 0, 1).await.unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
    }
}

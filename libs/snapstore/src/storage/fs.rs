//! Filesystem-backed object store.

use std::io::{self, SeekFrom};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{BlobError, ObjectStore, TRANSFER_BUFFER_SIZE};

/// Object store rooted at a local directory.
///
/// Keys map to paths under the root, so the key namespace mirrors the
/// remote layout. Used for local deployments and integration tests.
/// Prefixes are expected to name per-build directories.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn open_error(key: &str, err: io::Error) -> BlobError {
    if err.kind() == io::ErrorKind::NotFound {
        BlobError::NotFound {
            key: key.to_string(),
        }
    } else {
        BlobError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, BlobError> {
        let path = self.object_path(key);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| open_error(key, e))?;

        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = (offset + len).min(size);

        let mut buf = vec![0u8; (end - offset) as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, key: &str) -> Result<u64, BlobError> {
        let path = self.object_path(key);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| open_error(key, e))?;
        Ok(meta.len())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.object_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), BlobError> {
        let dir = self.root.join(prefix.trim_end_matches('/'));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn upload(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file, then rename into place so readers
        // never observe a partial object.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let tmp = path.with_file_name(format!("{}.tmp", file_name));

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut chunk = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            file.write_all(&chunk[..n]).await?;
            written += n as u64;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        let mut reader: &[u8] = b"template bytes";
        let written = store.upload("b1/memory", &mut reader).await.unwrap();
        assert_eq!(written, 14);

        assert_eq!(store.size("b1/memory").await.unwrap(), 14);
        let chunk = store.read_range("b1/memory", 9, 100).await.unwrap();
        assert_eq!(&chunk[..], b"bytes");
    }

    #[tokio::test]
    async fn test_missing_maps_to_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        assert!(matches!(
            store.read_range("b1/none", 0, 1).await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.size("b1/none").await,
            Err(BlobError::NotFound { .. })
        ));
        store.delete("b1/none").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_build_dir() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        let mut r1: &[u8] = b"m";
        store.upload("b1/memory", &mut r1).await.unwrap();
        let mut r2: &[u8] = b"h";
        store.upload("b1/memory.header", &mut r2).await.unwrap();

        store.delete_prefix("b1/").await.unwrap();
        assert!(matches!(
            store.size("b1/memory").await,
            Err(BlobError::NotFound { .. })
        ));

        // Missing prefix is fine
        store.delete_prefix("b9/").await.unwrap();
    }
}

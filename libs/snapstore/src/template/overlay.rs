//! Random-access reads across a header lineage.

use std::sync::Arc;

use bytes::Bytes;
use sandpool_blockmap::{BlockSource, Header};

use super::TemplateError;
use crate::build::{ArtifactKind, DiffStore, LocalDiff};
use crate::storage::{layout, BlobClient};

/// Reader over one artifact, resolved block by block through its header
/// lineage.
///
/// A local diff file is read at the artifact offset directly. A remote
/// diff goes through the pinned diff registry when the build is resident
/// and the blob store otherwise. A block no header claims is a
/// data-integrity fault, unless a fill byte is installed; mock templates
/// back their lineage root with one.
pub struct Overlay {
    kind: ArtifactKind,
    header: Arc<Header>,
    diffs: Arc<DiffStore>,
    blob: BlobClient,
    fill: Option<u8>,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("kind", &self.kind)
            .field("header", &self.header)
            .field("fill", &self.fill)
            .finish_non_exhaustive()
    }
}

impl Overlay {
    pub(crate) fn new(
        kind: ArtifactKind,
        header: Arc<Header>,
        diffs: Arc<DiffStore>,
        blob: BlobClient,
    ) -> Self {
        Self {
            kind,
            header,
            diffs,
            blob,
            fill: None,
        }
    }

    pub(crate) fn with_fill(
        kind: ArtifactKind,
        header: Arc<Header>,
        diffs: Arc<DiffStore>,
        blob: BlobClient,
        fill: u8,
    ) -> Self {
        Self {
            kind,
            header,
            diffs,
            blob,
            fill: Some(fill),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    /// Artifact size in bytes.
    pub fn size(&self) -> u64 {
        self.header.size()
    }

    /// Read up to `buf.len()` bytes at `offset`, returning the count.
    ///
    /// Reads past the end return short counts, like positional file reads.
    /// Adjacent blocks may resolve to different sources; each covered
    /// block is fetched from its own.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, TemplateError> {
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset);
        let block_size = self.header.block_size() as u64;

        let mut filled = 0u64;
        while filled < len {
            let abs = offset + filled;
            let index = abs / block_size;
            let block_end = (index + 1) * block_size;
            let piece = (block_end - abs).min(len - filled);

            let chunk = self.read_block_piece(index, abs, piece).await?;
            let start = filled as usize;
            buf[start..start + piece as usize].copy_from_slice(&chunk[..piece as usize]);
            filled += piece;
        }

        Ok(len as usize)
    }

    /// Read the whole artifact. Intended for small artifacts and tests.
    pub async fn read_all(&self) -> Result<Vec<u8>, TemplateError> {
        let mut data = vec![0u8; self.size() as usize];
        let n = self.read_at(&mut data, 0).await?;
        data.truncate(n);
        Ok(data)
    }

    async fn read_block_piece(
        &self,
        index: u64,
        abs_offset: u64,
        len: u64,
    ) -> Result<Bytes, TemplateError> {
        match self.header.resolve(index) {
            Some(BlockSource::Local(path)) => {
                let chunk = LocalDiff::new(path.as_str())
                    .read_range(abs_offset, len)
                    .await?;
                self.require_full(index, len, chunk)
            }
            Some(BlockSource::Remote(key)) => {
                // Prefer the pinned diff when the build is resident.
                if let Some((build_id, kind)) = layout::parse_diff_key(key) {
                    if let Some(diff) = self.diffs.get(build_id, kind) {
                        let chunk = diff.read_range(&self.blob, abs_offset, len).await?;
                        return self.require_full(index, len, chunk);
                    }
                }
                let chunk = self.blob.read_range(key, abs_offset, len).await?;
                self.require_full(index, len, chunk)
            }
            Some(BlockSource::Inherit) | None => match self.fill {
                Some(byte) => Ok(Bytes::from(vec![byte; len as usize])),
                None => Err(TemplateError::MissingBlock {
                    kind: self.kind,
                    index,
                }),
            },
        }
    }

    /// A mapped source serving fewer bytes than the block owns means the
    /// backing data is gone; report the block missing rather than padding.
    fn require_full(&self, index: u64, want: u64, chunk: Bytes) -> Result<Bytes, TemplateError> {
        if (chunk.len() as u64) < want {
            return Err(TemplateError::MissingBlock {
                kind: self.kind,
                index,
            });
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{Diff, RemoteDiff};
    use crate::storage::MemoryStore;
    use sandpool_blockmap::Metadata;
    use std::collections::BTreeMap;

    const BS: u32 = 16;

    async fn seeded_blob() -> (Arc<MemoryStore>, BlobClient) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), BlobClient::new(store))
    }

    fn full_header(key: &str, blocks: u64) -> Arc<Header> {
        let mut map = BTreeMap::new();
        for i in 0..blocks {
            map.insert(i, BlockSource::Remote(key.to_string()));
        }
        Arc::new(Header::new(Metadata::new(1, blocks * BS as u64, BS), map).unwrap())
    }

    #[tokio::test]
    async fn test_read_spanning_sources() {
        let (store, blob) = seeded_blob().await;
        // Base artifact: 4 blocks of 'a'; child diff overrides block 1 with 'b'.
        store.put("base/memory", vec![b'a'; 4 * BS as usize]).await;
        store.put("b1/memory", {
            let mut data = vec![0u8; 2 * BS as usize];
            data[BS as usize..].fill(b'b');
            data
        })
        .await;

        let base = full_header("base/memory", 4);
        let mut child_map = BTreeMap::new();
        child_map.insert(1, BlockSource::Remote("b1/memory".to_string()));
        let child = Arc::new(Header::for_snapshot(base, child_map).unwrap());

        let overlay = Overlay::new(
            ArtifactKind::Memory,
            child,
            Arc::new(DiffStore::new()),
            blob,
        );

        let data = overlay.read_all().await.unwrap();
        assert_eq!(&data[..BS as usize], &vec![b'a'; BS as usize][..]);
        assert_eq!(
            &data[BS as usize..2 * BS as usize],
            &vec![b'b'; BS as usize][..]
        );
        assert_eq!(&data[2 * BS as usize..], &vec![b'a'; 2 * BS as usize][..]);

        // A read crossing the block 0 / block 1 boundary touches both sources.
        let mut buf = vec![0u8; BS as usize];
        let half = BS as u64 / 2;
        let n = overlay.read_at(&mut buf, half).await.unwrap();
        assert_eq!(n, BS as usize);
        assert_eq!(&buf[..half as usize], &vec![b'a'; half as usize][..]);
        assert_eq!(&buf[half as usize..], &vec![b'b'; half as usize][..]);
    }

    #[tokio::test]
    async fn test_pinned_diff_preferred_over_object_read() {
        let (store, blob) = seeded_blob().await;
        store.put("b1/memory", vec![b'x'; BS as usize]).await;

        let header = full_header("b1/memory", 1);
        let diffs = Arc::new(DiffStore::new());
        diffs.add(
            "b1",
            ArtifactKind::Memory,
            Arc::new(Diff::Remote(RemoteDiff::new("b1/memory"))),
        );

        let overlay = Overlay::new(ArtifactKind::Memory, header, diffs, blob);
        let data = overlay.read_all().await.unwrap();
        assert_eq!(data, vec![b'x'; BS as usize]);
    }

    #[tokio::test]
    async fn test_unresolved_block_is_a_fault() {
        let (_store, blob) = seeded_blob().await;
        let header = Arc::new(
            Header::new(Metadata::new(1, 2 * BS as u64, BS), BTreeMap::new()).unwrap(),
        );
        let overlay = Overlay::new(
            ArtifactKind::Rootfs,
            header,
            Arc::new(DiffStore::new()),
            blob,
        );

        let mut buf = vec![0u8; BS as usize];
        let err = overlay.read_at(&mut buf, 0).await.unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingBlock {
                kind: ArtifactKind::Rootfs,
                index: 0
            }
        );
    }

    #[tokio::test]
    async fn test_fill_byte_serves_unmapped_blocks() {
        let (_store, blob) = seeded_blob().await;
        let header = Arc::new(
            Header::new(Metadata::new(1, 2 * BS as u64, BS), BTreeMap::new()).unwrap(),
        );
        let overlay = Overlay::with_fill(
            ArtifactKind::Memory,
            header,
            Arc::new(DiffStore::new()),
            blob,
            0xCC,
        );

        let data = overlay.read_all().await.unwrap();
        assert_eq!(data, vec![0xCC; 2 * BS as usize]);
    }

    #[tokio::test]
    async fn test_reads_past_end_are_short() {
        let (store, blob) = seeded_blob().await;
        store.put("b1/memory", vec![b'z'; BS as usize]).await;
        let overlay = Overlay::new(
            ArtifactKind::Memory,
            full_header("b1/memory", 1),
            Arc::new(DiffStore::new()),
            blob,
        );

        let mut buf = vec![0u8; 64];
        let n = overlay.read_at(&mut buf, 8).await.unwrap();
        assert_eq!(n, BS as usize - 8);

        let n = overlay.read_at(&mut buf, BS as u64 + 1).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_missing_backing_data_not_padded() {
        let (store, blob) = seeded_blob().await;
        // Object is one block short of what the header claims.
        store.put("b1/memory", vec![b'q'; BS as usize]).await;
        let overlay = Overlay::new(
            ArtifactKind::Memory,
            full_header("b1/memory", 2),
            Arc::new(DiffStore::new()),
            blob,
        );

        let err = overlay.read_all().await.unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingBlock {
                kind: ArtifactKind::Memory,
                index: 1
            }
        );
    }
}

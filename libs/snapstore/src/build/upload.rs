//! Publishing finished builds to the object store.

use std::path::Path;

use sandpool_blockmap::Header;
use tracing::{debug, info};

use super::{ArtifactKind, Diff};
use crate::storage::{layout, BlobClient, BlobError};

/// Publishes one finished build's artifacts to the object store.
///
/// Diff data streams through the chunked upload path. Headers are
/// flattened before serialization so the persisted form stands on its
/// own; the wire format carries no parent linkage.
pub struct BuildUpload {
    blob: BlobClient,
    build_id: String,
}

impl BuildUpload {
    pub fn new(blob: BlobClient, build_id: impl Into<String>) -> Self {
        Self {
            blob,
            build_id: build_id.into(),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Upload one artifact: its diff data, when the build changed the
    /// artifact, and its header.
    pub async fn put_artifact(
        &self,
        kind: ArtifactKind,
        diff: &Diff,
        header: &Header,
    ) -> Result<(), BlobError> {
        match diff {
            Diff::None => {
                debug!(build_id = %self.build_id, kind = %kind, "No diff data to upload");
            }
            Diff::Local(local) => {
                let key = layout::diff_key(&self.build_id, kind);
                let bytes = self.blob.upload_file(&key, local.path()).await?;
                info!(build_id = %self.build_id, kind = %kind, bytes, "Uploaded diff");
            }
            Diff::Remote(remote) => {
                debug!(
                    build_id = %self.build_id,
                    kind = %kind,
                    key = %remote.key(),
                    "Diff already remote"
                );
            }
        }

        let header_key = layout::header_key(&self.build_id, kind);
        let raw = header.flatten().serialize();
        let mut reader: &[u8] = raw.as_ref();
        self.blob.upload(&header_key, &mut reader).await?;
        Ok(())
    }

    /// Upload the boot descriptor file.
    pub async fn put_boot_descriptor(&self, path: &Path) -> Result<u64, BlobError> {
        self.blob
            .upload_file(&layout::boot_descriptor_key(&self.build_id), path)
            .await
    }
}

/// Delete every object a build owns.
pub async fn remove_build(blob: &BlobClient, build_id: &str) -> Result<(), BlobError> {
    info!(build_id = %build_id, "Removing build from object store");
    blob.delete_prefix(&layout::build_prefix(build_id)).await
}

//! In-memory template for tests and mock-sandbox mode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sandpool_blockmap::{Header, Metadata};
use std::collections::BTreeMap;

use super::{Overlay, Template, TemplateError, TemplateIdentity};
use crate::build::{ArtifactKind, DiffStore};
use crate::storage::{BlobClient, MemoryStore};

const MOCK_BLOCK_SIZE: u32 = 4096;
const MOCK_MEMORY_SIZE: u64 = 4 * 1024 * 1024;
const MOCK_ROOTFS_SIZE: u64 = 8 * 1024 * 1024;

/// Template that never touches the object store.
///
/// Both artifacts read as a deterministic fill byte derived from the
/// build id, served through the same [`Overlay`] path the storage-backed
/// variant uses. The boot descriptor is an empty file in the template's
/// cache directory. Hydration is immediate.
pub struct MockTemplate {
    identity: TemplateIdentity,
    cache_dir: PathBuf,
    memory: Arc<Overlay>,
    rootfs: Arc<Overlay>,
    boot_descriptor: PathBuf,
    closed: AtomicBool,
}

impl MockTemplate {
    pub fn new(identity: TemplateIdentity, cache_root: &Path) -> Result<Self, TemplateError> {
        let cache_dir = cache_root.join(identity.cache_key());
        std::fs::create_dir_all(&cache_dir).map_err(|e| TemplateError::Unavailable {
            reason: format!("cache dir: {}", e),
        })?;

        let boot_descriptor = cache_dir.join("bootdesc");
        std::fs::write(&boot_descriptor, []).map_err(|e| TemplateError::Unavailable {
            reason: format!("boot descriptor: {}", e),
        })?;

        let fill = Self::fill_byte(&identity);
        let diffs = Arc::new(DiffStore::new());
        let blob = BlobClient::new(Arc::new(MemoryStore::new()));

        let memory = Arc::new(Overlay::with_fill(
            ArtifactKind::Memory,
            Arc::new(mock_header(MOCK_MEMORY_SIZE)?),
            diffs.clone(),
            blob.clone(),
            fill,
        ));
        let rootfs = Arc::new(Overlay::with_fill(
            ArtifactKind::Rootfs,
            Arc::new(mock_header(MOCK_ROOTFS_SIZE)?),
            diffs,
            blob,
            fill,
        ));

        Ok(Self {
            identity,
            cache_dir,
            memory,
            rootfs,
            boot_descriptor,
            closed: AtomicBool::new(false),
        })
    }

    /// Fill byte every block of both artifacts reads as.
    ///
    /// Derived from the build id so different builds are tell-apart-able
    /// in tests while the same build always reads the same bytes.
    pub fn fill_byte(identity: &TemplateIdentity) -> u8 {
        identity
            .build_id
            .bytes()
            .fold(0u8, |acc, b| acc.wrapping_add(b))
    }

    fn guard(&self) -> Result<(), TemplateError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TemplateError::Evicted);
        }
        Ok(())
    }
}

/// Parentless header with an empty map; every block falls through to the
/// overlay's fill byte.
fn mock_header(size: u64) -> Result<Header, TemplateError> {
    Header::new(Metadata::new(1, size, MOCK_BLOCK_SIZE), BTreeMap::new()).map_err(|e| {
        TemplateError::Unavailable {
            reason: e.to_string(),
        }
    })
}

#[async_trait]
impl Template for MockTemplate {
    fn identity(&self) -> &TemplateIdentity {
        &self.identity
    }

    async fn memory(&self) -> Result<Arc<Overlay>, TemplateError> {
        self.guard()?;
        Ok(self.memory.clone())
    }

    async fn rootfs(&self) -> Result<Arc<Overlay>, TemplateError> {
        self.guard()?;
        Ok(self.rootfs.clone())
    }

    async fn boot_descriptor(&self) -> Result<PathBuf, TemplateError> {
        self.guard()?;
        Ok(self.boot_descriptor.clone())
    }

    async fn hydrated(&self) -> Result<(), TemplateError> {
        self.guard()
    }

    fn close(&self) -> Result<(), TemplateError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match std::fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TemplateError::Unavailable {
                reason: format!("cache dir cleanup: {}", err),
            }),
        }
    }
}

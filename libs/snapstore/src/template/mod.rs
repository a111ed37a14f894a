//! Templates: cached, lazily hydrated snapshot artifact sets.
//!
//! A template is one build variant of one sandbox template: block headers
//! for the memory and root filesystem artifacts, a boot descriptor, and
//! the diff data reachable through the headers' lineage. Templates are
//! created once per cache key, shared read-only between sandboxes, and
//! closed exactly once when evicted.

mod cache;
mod mock;
mod overlay;
mod storage;

pub use cache::TemplateCache;
pub use mock::MockTemplate;
pub use overlay::Overlay;
pub use storage::StorageTemplate;

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::build::ArtifactKind;
use crate::storage::BlobError;

/// Hydration tasks owned by the cache and shared with its templates.
///
/// Every fetch, including a retry after a transient failure, is spawned
/// through here, so draining at shutdown covers all of them. Spawning
/// reaps already-settled tasks first, keeping the set proportional to
/// in-flight hydrations rather than to templates ever created.
#[derive(Clone, Default)]
pub struct FetchTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl FetchTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.locked();
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Tasks not yet reaped; settled ones linger until the next spawn.
    pub(crate) fn active(&self) -> usize {
        self.locked().len()
    }

    /// Wait for every in-flight task to finish.
    pub(crate) async fn drain(&self) {
        let mut set = std::mem::take(&mut *self.locked());
        while set.join_next().await.is_some() {}
    }
}

/// Identity of one template build variant.
///
/// Every field participates in the cache key: builds of the same template
/// for different kernels or VMM versions are distinct cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateIdentity {
    pub template_id: String,
    pub build_id: String,
    pub kernel_version: String,
    pub firecracker_version: String,
    pub huge_pages: bool,
    pub snapshot: bool,
}

impl TemplateIdentity {
    /// Deterministic cache key over every identity field.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.template_id,
            self.build_id,
            self.kernel_version,
            self.firecracker_version,
            self.huge_pages,
            self.snapshot,
        )
    }
}

/// Template access errors.
///
/// Clonable so one hydration outcome can be served to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Hydration has not finished yet; retry shortly.
    #[error("template not ready")]
    NotReady,

    /// Template was closed; the caller holds a stale handle.
    #[error("template evicted")]
    Evicted,

    /// A required artifact object does not exist.
    #[error("artifact missing: {location}")]
    ArtifactMissing { location: String },

    /// Persisted header could not be parsed. Fatal for the template.
    #[error("corrupt {kind} header: {reason}")]
    CorruptHeader { kind: ArtifactKind, reason: String },

    /// Lineage exhausted without any header claiming the block.
    #[error("no source for {kind} block {index}")]
    MissingBlock { kind: ArtifactKind, index: u64 },

    /// Storage failing; safe to retry.
    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },
}

impl TemplateError {
    /// Whether the caller can retry and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TemplateError::NotReady | TemplateError::Unavailable { .. }
        )
    }
}

impl From<BlobError> for TemplateError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { key } => TemplateError::ArtifactMissing { location: key },
            other => TemplateError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Contract shared by the storage-backed and mock template variants.
#[async_trait]
pub trait Template: Send + Sync {
    /// Identity this template was created for.
    fn identity(&self) -> &TemplateIdentity;

    /// Random-access reader over the memory artifact.
    async fn memory(&self) -> Result<Arc<Overlay>, TemplateError>;

    /// Random-access reader over the root filesystem artifact.
    async fn rootfs(&self) -> Result<Arc<Overlay>, TemplateError>;

    /// Path of the locally materialized boot descriptor.
    async fn boot_descriptor(&self) -> Result<PathBuf, TemplateError>;

    /// Wait until hydration settles and return its outcome.
    async fn hydrated(&self) -> Result<(), TemplateError>;

    /// Release held resources.
    ///
    /// Idempotent and safe to call concurrently; cleanup runs exactly
    /// once. Later artifact calls fail with [`TemplateError::Evicted`].
    fn close(&self) -> Result<(), TemplateError>;
}

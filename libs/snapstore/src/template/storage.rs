//! Storage-backed template with asynchronous hydration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sandpool_blockmap::Header;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{FetchTasks, Overlay, Template, TemplateError, TemplateIdentity};
use crate::build::{ArtifactKind, DiffStore};
use crate::storage::{layout, BlobClient};

/// File name of the boot descriptor inside a template's cache directory.
const BOOT_DESCRIPTOR_FILE: &str = "bootdesc";

/// Hydration lifecycle of a storage-backed template.
///
/// `Pending` until the fetch task settles. A retryable `Failed` can move
/// back to `Pending` when an accessor re-arms hydration. `Closed` is
/// terminal; a fetch settling afterwards discards its result.
#[derive(Clone)]
enum FetchState {
    Pending,
    Ready(Arc<Hydrated>),
    Failed(TemplateError),
    Closed,
}

/// Artifacts available once hydration completed.
struct Hydrated {
    memory: Arc<Overlay>,
    rootfs: Arc<Overlay>,
    boot_descriptor: PathBuf,
}

/// Template whose artifacts hydrate from the object store.
///
/// Construction is cheap and never touches the network; the caller spawns
/// [`StorageTemplate::fetch`] once after inserting the template into the
/// cache. Until hydration settles, artifact accessors fail with
/// [`TemplateError::NotReady`].
pub struct StorageTemplate {
    identity: TemplateIdentity,
    blob: BlobClient,
    diffs: Arc<DiffStore>,
    cache_dir: PathBuf,
    state: Arc<watch::Sender<FetchState>>,
    tasks: FetchTasks,
    /// Whether this template registered its build's diffs in the diff
    /// store. Only the owner releases them on close; a template that
    /// merely looked the build up must not wipe another's pins.
    owns_diffs: bool,
}

impl StorageTemplate {
    /// Template that will hydrate from the object store.
    pub fn new(
        identity: TemplateIdentity,
        blob: BlobClient,
        diffs: Arc<DiffStore>,
        cache_root: &Path,
        tasks: FetchTasks,
    ) -> Self {
        let cache_dir = cache_root.join(identity.cache_key());
        let (state, _) = watch::channel(FetchState::Pending);
        Self {
            identity,
            blob,
            diffs,
            cache_dir,
            state: Arc::new(state),
            tasks,
            owns_diffs: false,
        }
    }

    /// Template whose artifacts are already in hand.
    ///
    /// Used for a snapshot produced on this host: headers and the boot
    /// descriptor exist locally, so the template starts out ready and no
    /// hydration round trip happens. The caller pins the build's diffs;
    /// this template owns those registrations and releases them on close.
    pub fn with_parts(
        identity: TemplateIdentity,
        blob: BlobClient,
        diffs: Arc<DiffStore>,
        cache_root: &Path,
        memory_header: Arc<Header>,
        rootfs_header: Arc<Header>,
        boot_descriptor: PathBuf,
        tasks: FetchTasks,
    ) -> Self {
        let cache_dir = cache_root.join(identity.cache_key());
        let hydrated = Hydrated {
            memory: Arc::new(Overlay::new(
                ArtifactKind::Memory,
                memory_header,
                diffs.clone(),
                blob.clone(),
            )),
            rootfs: Arc::new(Overlay::new(
                ArtifactKind::Rootfs,
                rootfs_header,
                diffs.clone(),
                blob.clone(),
            )),
            boot_descriptor,
        };
        let (state, _) = watch::channel(FetchState::Ready(Arc::new(hydrated)));
        Self {
            identity,
            blob,
            diffs,
            cache_dir,
            state: Arc::new(state),
            tasks,
            owns_diffs: true,
        }
    }

    /// Queue hydration on the shared task set.
    ///
    /// Called once after the template is inserted into the cache.
    pub fn spawn_fetch(&self) {
        self.tasks.spawn(self.fetch_job().run());
    }

    /// Hydrate this template from the object store.
    ///
    /// Run on a background task after cache insertion. Settles the state
    /// exactly once per run; if the template was closed meanwhile, the
    /// downloaded data is discarded and cleaned up instead of committed.
    pub async fn fetch(&self) {
        self.fetch_job().run().await
    }

    fn fetch_job(&self) -> FetchJob {
        FetchJob {
            identity: self.identity.clone(),
            blob: self.blob.clone(),
            diffs: self.diffs.clone(),
            cache_dir: self.cache_dir.clone(),
            state: self.state.clone(),
        }
    }

    fn current(&self) -> FetchState {
        self.state.borrow().clone()
    }

    fn artifacts(&self) -> Result<Arc<Hydrated>, TemplateError> {
        match self.current() {
            FetchState::Ready(hydrated) => Ok(hydrated),
            FetchState::Pending => Err(TemplateError::NotReady),
            FetchState::Closed => Err(TemplateError::Evicted),
            FetchState::Failed(err) => {
                self.maybe_respawn(&err);
                Err(err)
            }
        }
    }

    /// Re-arm hydration after a transient failure.
    ///
    /// Only one caller wins the `Failed` to `Pending` transition, so at
    /// most one retry task runs at a time.
    fn maybe_respawn(&self, err: &TemplateError) {
        if !err.is_retryable() {
            return;
        }
        let mut respawn = false;
        self.state.send_modify(|state| {
            if matches!(state, FetchState::Failed(e) if e.is_retryable()) {
                *state = FetchState::Pending;
                respawn = true;
            }
        });
        if respawn {
            debug!(template = %self.identity.cache_key(), "Retrying template hydration");
            self.tasks.spawn(self.fetch_job().run());
        }
    }

    async fn wait_hydrated(&self) -> Result<(), TemplateError> {
        // A transient failure observed here re-arms hydration before the
        // wait, so callers polling readiness make progress.
        if let FetchState::Failed(err) = self.current() {
            self.maybe_respawn(&err);
        }

        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, FetchState::Pending))
            .await
            .map_err(|_| TemplateError::Evicted)?;
        match &*settled {
            FetchState::Ready(_) => Ok(()),
            FetchState::Failed(err) => Err(err.clone()),
            FetchState::Closed => Err(TemplateError::Evicted),
            FetchState::Pending => Err(TemplateError::NotReady),
        }
    }
}

#[async_trait]
impl Template for StorageTemplate {
    fn identity(&self) -> &TemplateIdentity {
        &self.identity
    }

    async fn memory(&self) -> Result<Arc<Overlay>, TemplateError> {
        Ok(self.artifacts()?.memory.clone())
    }

    async fn rootfs(&self) -> Result<Arc<Overlay>, TemplateError> {
        Ok(self.artifacts()?.rootfs.clone())
    }

    async fn boot_descriptor(&self) -> Result<PathBuf, TemplateError> {
        Ok(self.artifacts()?.boot_descriptor.clone())
    }

    async fn hydrated(&self) -> Result<(), TemplateError> {
        self.wait_hydrated().await
    }

    fn close(&self) -> Result<(), TemplateError> {
        let mut first = false;
        self.state.send_modify(|state| {
            if !matches!(state, FetchState::Closed) {
                *state = FetchState::Closed;
                first = true;
            }
        });
        if !first {
            return Ok(());
        }

        debug!(template = %self.identity.cache_key(), "Closing template");
        if self.owns_diffs {
            self.diffs.release(&self.identity.build_id);
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

/// Owned hydration work, detachable onto a background task.
struct FetchJob {
    identity: TemplateIdentity,
    blob: BlobClient,
    diffs: Arc<DiffStore>,
    cache_dir: PathBuf,
    state: Arc<watch::Sender<FetchState>>,
}

impl FetchJob {
    async fn run(self) {
        let started = Instant::now();
        let key = self.identity.cache_key();
        debug!(
            template = %key,
            build_id = %self.identity.build_id,
            "Hydrating template"
        );

        match self.hydrate().await {
            Ok(hydrated) => {
                let mut committed = false;
                self.state.send_modify(|state| {
                    if matches!(state, FetchState::Pending) {
                        *state = FetchState::Ready(Arc::new(hydrated));
                        committed = true;
                    }
                });
                if committed {
                    info!(
                        template = %key,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Template hydrated"
                    );
                } else {
                    debug!(template = %key, "Template closed during hydration; discarding");
                    if let Err(err) = tokio::fs::remove_dir_all(&self.cache_dir).await {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!(template = %key, error = %err, "Failed to discard cache dir");
                        }
                    }
                }
            }
            Err(err) => {
                let mut committed = false;
                self.state.send_modify(|state| {
                    if matches!(state, FetchState::Pending) {
                        *state = FetchState::Failed(err.clone());
                        committed = true;
                    }
                });
                if committed {
                    warn!(template = %key, error = %err, "Template hydration failed");
                }
            }
        }
    }

    async fn hydrate(&self) -> Result<Hydrated, TemplateError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| TemplateError::Unavailable {
                reason: format!("cache dir: {}", e),
            })?;

        let memory = self.load_header(ArtifactKind::Memory).await?;
        let rootfs = self.load_header(ArtifactKind::Rootfs).await?;

        let boot_descriptor = self.cache_dir.join(BOOT_DESCRIPTOR_FILE);
        self.blob
            .download_to(
                &layout::boot_descriptor_key(&self.identity.build_id),
                &boot_descriptor,
            )
            .await?;

        Ok(Hydrated {
            memory: Arc::new(Overlay::new(
                ArtifactKind::Memory,
                Arc::new(memory),
                self.diffs.clone(),
                self.blob.clone(),
            )),
            rootfs: Arc::new(Overlay::new(
                ArtifactKind::Rootfs,
                Arc::new(rootfs),
                self.diffs.clone(),
                self.blob.clone(),
            )),
            boot_descriptor,
        })
    }

    async fn load_header(&self, kind: ArtifactKind) -> Result<Header, TemplateError> {
        let key = layout::header_key(&self.identity.build_id, kind);
        let raw = self.blob.read_all(&key).await?;
        Header::deserialize(&raw).map_err(|e| TemplateError::CorruptHeader {
            kind,
            reason: e.to_string(),
        })
    }
}

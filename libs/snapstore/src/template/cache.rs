//! TTL cache of templates with fetch deduplication.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use sandpool_blockmap::Header;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{FetchTasks, MockTemplate, StorageTemplate, Template, TemplateError, TemplateIdentity};
use crate::build::{ArtifactKind, Diff, DiffStore};
use crate::config::StoreConfig;
use crate::storage::{BlobClient, ObjectStore};

struct Entry {
    template: Arc<dyn Template>,
    deadline: Instant,
}

struct Shared {
    config: StoreConfig,
    blob: BlobClient,
    diffs: Arc<DiffStore>,
    entries: Mutex<HashMap<String, Entry>>,
    tasks: FetchTasks,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn locked(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove expired entries and close them outside the lock.
    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(String, Entry)> = {
            let mut entries = self.locked();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove_entry(&key))
                .collect()
        };

        for (key, entry) in expired {
            debug!(template = %key, "Evicting expired template");
            if let Err(err) = entry.template.close() {
                warn!(template = %key, error = %err, "Template close failed on eviction");
            }
        }
    }
}

/// Keyed store of templates shared by every sandbox on this host.
///
/// Lookups deduplicate: concurrent callers for one identity observe one
/// template instance and exactly one hydration runs for it. Entries live
/// for a fixed TTL refreshed on access; the TTL is configured longer than
/// the maximum sandbox lifetime, which is what stands in for reference
/// counting here. An eviction sweep runs on a background task and closes
/// what it removes; close failures are logged, never propagated.
///
/// Constructed once at process start and torn down with [`shutdown`]
/// rather than living as a global.
///
/// [`shutdown`]: TemplateCache::shutdown
pub struct TemplateCache {
    shared: Arc<Shared>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl TemplateCache {
    /// Cache over the given object store. Spawns the eviction sweep;
    /// requires a running runtime.
    pub fn new(config: StoreConfig, store: Arc<dyn ObjectStore>) -> Self {
        let blob = BlobClient::new(store).with_retry(config.retry.clone());
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            blob,
            diffs: Arc::new(DiffStore::new()),
            entries: Mutex::new(HashMap::new()),
            tasks: FetchTasks::new(),
            shutdown,
        });

        // Subscribe before spawning so a shutdown signalled immediately
        // after construction is still observed.
        let shutdown_rx = shared.shutdown.subscribe();
        let janitor = tokio::spawn(janitor_loop(shared.clone(), shutdown_rx));
        Self {
            shared,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    /// Registry of diffs pinned by resident builds.
    pub fn diff_store(&self) -> &Arc<DiffStore> {
        &self.shared.diffs
    }

    /// Blob client with this cache's retry policy applied.
    pub fn blob(&self) -> &BlobClient {
        &self.shared.blob
    }

    pub fn entry_count(&self) -> usize {
        self.shared.locked().len()
    }

    /// Fetch or create the template for an identity.
    ///
    /// A hit refreshes the entry's deadline and returns the shared
    /// instance. A miss constructs the template synchronously, which is
    /// cheap and touches no network, and schedules hydration on a
    /// background task; the caller gets the template back immediately and
    /// blocks only when it reads an artifact. The check-and-insert runs
    /// under one lock, so racing callers for the same identity observe
    /// exactly one instance and exactly one hydration is spawned.
    pub fn get_or_create(
        &self,
        identity: &TemplateIdentity,
    ) -> Result<Arc<dyn Template>, TemplateError> {
        let key = identity.cache_key();
        let shared = &self.shared;

        let mut entries = shared.locked();
        if let Some(entry) = entries.get_mut(&key) {
            entry.deadline = Instant::now() + shared.config.template_ttl;
            return Ok(entry.template.clone());
        }

        if shared.config.mock_templates {
            // Mock construction writes files, so it runs outside the
            // lock with a re-check afterwards.
            drop(entries);
            let fresh: Arc<dyn Template> = Arc::new(MockTemplate::new(
                identity.clone(),
                &shared.config.cache_root,
            )?);

            let mut entries = shared.locked();
            if let Some(entry) = entries.get_mut(&key) {
                // Another lookup won the race. Both constructions wrote
                // identical files into the same directory; the loser is
                // dropped without close so the winner's files stay.
                entry.deadline = Instant::now() + shared.config.template_ttl;
                return Ok(entry.template.clone());
            }
            entries.insert(
                key.clone(),
                Entry {
                    template: fresh.clone(),
                    deadline: Instant::now() + shared.config.template_ttl,
                },
            );
            info!(template = %key, "Created mock template");
            return Ok(fresh);
        }

        let template = Arc::new(StorageTemplate::new(
            identity.clone(),
            shared.blob.clone(),
            shared.diffs.clone(),
            &shared.config.cache_root,
            shared.tasks.clone(),
        ));
        entries.insert(
            key.clone(),
            Entry {
                template: template.clone(),
                deadline: Instant::now() + shared.config.template_ttl,
            },
        );
        drop(entries);

        info!(template = %key, build_id = %identity.build_id, "Created template, scheduling hydration");
        template.spawn_fetch();

        Ok(template)
    }

    /// Install a template for a build finished on this host.
    ///
    /// The headers, boot descriptor and diffs are already in hand, so the
    /// template starts out hydrated and no fetch runs. Non-no-change
    /// diffs are pinned in the diff store first so overlay reads hit the
    /// local data. Replaces any entry already cached under the identity's
    /// key; the replaced template is closed, errors logged.
    pub fn add_snapshot(
        &self,
        identity: &TemplateIdentity,
        memory_header: Arc<Header>,
        rootfs_header: Arc<Header>,
        boot_descriptor: PathBuf,
        memory_diff: Diff,
        rootfs_diff: Diff,
    ) -> Result<Arc<dyn Template>, TemplateError> {
        let shared = &self.shared;
        let key = identity.cache_key();

        // Close any entry already cached under this key before pinning
        // the new diffs: a replaced snapshot template owns this build
        // id's diff registrations and releases them on close, which
        // after the pins below would wipe them.
        if let Some(entry) = shared.locked().remove(&key) {
            debug!(template = %key, "Replacing cached template with fresh snapshot");
            if let Err(err) = entry.template.close() {
                warn!(template = %key, error = %err, "Replaced template close failed");
            }
        }

        for (kind, diff) in [
            (ArtifactKind::Memory, memory_diff),
            (ArtifactKind::Rootfs, rootfs_diff),
        ] {
            if !diff.is_none() {
                shared.diffs.add(&identity.build_id, kind, Arc::new(diff));
            }
        }

        let template: Arc<dyn Template> = Arc::new(StorageTemplate::with_parts(
            identity.clone(),
            shared.blob.clone(),
            shared.diffs.clone(),
            &shared.config.cache_root,
            memory_header,
            rootfs_header,
            boot_descriptor,
            shared.tasks.clone(),
        ));

        let raced = shared.locked().insert(
            key.clone(),
            Entry {
                template: template.clone(),
                deadline: Instant::now() + shared.config.template_ttl,
            },
        );
        if let Some(entry) = raced {
            // A lookup slipped in between the removal above and this
            // insert. Its template pinned nothing, so closing it leaves
            // the new registrations in place.
            if let Err(err) = entry.template.close() {
                warn!(template = %key, error = %err, "Raced template close failed");
            }
        }

        info!(template = %key, build_id = %identity.build_id, "Registered snapshot");
        Ok(template)
    }

    /// Evict and close every cached build of a template.
    ///
    /// Used after a rebuild or delete. Returns how many entries went.
    pub fn invalidate(&self, template_id: &str) -> usize {
        let shared = &self.shared;
        let victims: Vec<(String, Entry)> = {
            let mut entries = shared.locked();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.template.identity().template_id == template_id)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove_entry(&key))
                .collect()
        };

        let count = victims.len();
        for (key, entry) in victims {
            if let Err(err) = entry.template.close() {
                warn!(template = %key, error = %err, "Template close failed on invalidation");
            }
        }
        if count > 0 {
            info!(template_id = %template_id, count, "Invalidated cached templates");
        }
        count
    }

    /// Deterministic teardown: stop the sweep, close every entry, and
    /// wait out in-flight hydration tasks (closed templates make them
    /// discard their results).
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = janitor {
            let _ = handle.await;
        }

        let entries: Vec<(String, Entry)> = self.shared.locked().drain().collect();
        for (key, entry) in entries {
            if let Err(err) = entry.template.close() {
                warn!(template = %key, error = %err, "Template close failed on shutdown");
            }
        }

        self.shared.tasks.drain().await;
        info!("Template cache shut down");
    }
}

async fn janitor_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(shared.config.sweep_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => shared.sweep(),
            _ = shutdown.changed() => {
                debug!("Eviction sweep stopping");
                return;
            }
        }
    }
}

//! Registry of diffs pinned by live templates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::{ArtifactKind, Diff};

type DiffMap = HashMap<String, HashMap<ArtifactKind, Arc<Diff>>>;

/// Shared registry of build diffs, keyed by build id and artifact kind.
///
/// A hit means the diff data is pinned (a local file, or a remote object
/// whose location is already known) and overlay reads skip the generic
/// object path. A miss is normal; the block's own locator still resolves.
/// The lock guards only map mutation, never I/O.
#[derive(Default)]
pub struct DiffStore {
    diffs: Mutex<DiffMap>,
}

impl DiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one build artifact's diff.
    ///
    /// [`Diff::None`] carries no data and is never stored; registering one
    /// is a logged no-op.
    pub fn add(&self, build_id: &str, kind: ArtifactKind, diff: Arc<Diff>) {
        if diff.is_none() {
            warn!(build_id = %build_id, kind = %kind, "Ignoring no-change diff");
            return;
        }

        self.locked()
            .entry(build_id.to_string())
            .or_default()
            .insert(kind, diff);
        debug!(build_id = %build_id, kind = %kind, "Registered build diff");
    }

    /// Look up a pinned diff.
    pub fn get(&self, build_id: &str, kind: ArtifactKind) -> Option<Arc<Diff>> {
        self.locked()
            .get(build_id)
            .and_then(|kinds| kinds.get(&kind))
            .cloned()
    }

    /// Drop every diff pinned for a build.
    pub fn release(&self, build_id: &str) {
        if self.locked().remove(build_id).is_some() {
            debug!(build_id = %build_id, "Released build diffs");
        }
    }

    /// Number of builds with at least one pinned diff.
    pub fn build_count(&self) -> usize {
        self.locked().len()
    }

    fn locked(&self) -> MutexGuard<'_, DiffMap> {
        // Poisoning only means a panicked holder; the map itself stays usable.
        self.diffs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

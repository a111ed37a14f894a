//! Build artifacts: diffs and the per-build diff registry.
//!
//! A completed build produces, per artifact, a block diff (possibly the
//! no-change marker) and a block header describing where every block of
//! the artifact lives. This module holds the diff side; headers come from
//! the blockmap crate.

mod diff;
mod store;
mod upload;

pub use diff::{Diff, LocalDiff, RemoteDiff};
pub use store::DiffStore;
pub use upload::{remove_build, BuildUpload};

use std::fmt;

/// Artifact kinds a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Guest memory image.
    Memory,
    /// Root filesystem image.
    Rootfs,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Memory => "memory",
            ArtifactKind::Rootfs => "rootfs",
        }
    }

    /// Both kinds, in layout order.
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Memory, ArtifactKind::Rootfs];
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

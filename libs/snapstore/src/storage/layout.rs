//! Object key layout for build artifacts.
//!
//! Every object a build owns lives under its build id:
//!
//! ```text
//! {build_id}/memory           sparse memory diff
//! {build_id}/rootfs           sparse root filesystem diff
//! {build_id}/memory.header    serialized block header
//! {build_id}/rootfs.header    serialized block header
//! {build_id}/bootdesc         boot descriptor
//! ```

use crate::build::ArtifactKind;

/// Key of the sparse diff object for one artifact.
pub fn diff_key(build_id: &str, kind: ArtifactKind) -> String {
    format!("{}/{}", build_id, kind.as_str())
}

/// Key of the serialized block header for one artifact.
pub fn header_key(build_id: &str, kind: ArtifactKind) -> String {
    format!("{}/{}.header", build_id, kind.as_str())
}

/// Key of the boot descriptor object.
pub fn boot_descriptor_key(build_id: &str) -> String {
    format!("{}/bootdesc", build_id)
}

/// Prefix covering every object of a build.
pub fn build_prefix(build_id: &str) -> String {
    format!("{}/", build_id)
}

/// Split a diff object key back into build id and artifact kind.
pub fn parse_diff_key(key: &str) -> Option<(&str, ArtifactKind)> {
    let (build_id, rest) = key.split_once('/')?;
    let kind = match rest {
        "memory" => ArtifactKind::Memory,
        "rootfs" => ArtifactKind::Rootfs,
        _ => return None,
    };
    Some((build_id, kind))
}

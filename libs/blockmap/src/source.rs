/// Where the bytes of one mapped block live.
///
/// Locators are self-contained: a local path or remote object key carries
/// everything needed to read the block, so resolution never depends on
/// which header in a lineage contributed the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    /// Delegate to the parent header. Equivalent to the block being absent
    /// from the map.
    Inherit,

    /// Sparse diff file on the local filesystem.
    Local(String),

    /// Sparse diff object in the blob store.
    Remote(String),
}

pub(crate) const TAG_INHERIT: u8 = 0;
pub(crate) const TAG_LOCAL: u8 = 1;
pub(crate) const TAG_REMOTE: u8 = 2;

impl BlockSource {
    /// Wire tag for this source.
    pub fn tag(&self) -> u8 {
        match self {
            BlockSource::Inherit => TAG_INHERIT,
            BlockSource::Local(_) => TAG_LOCAL,
            BlockSource::Remote(_) => TAG_REMOTE,
        }
    }

    /// The path or object key, if this source carries one.
    pub fn locator(&self) -> Option<&str> {
        match self {
            BlockSource::Inherit => None,
            BlockSource::Local(path) => Some(path),
            BlockSource::Remote(key) => Some(key),
        }
    }
}

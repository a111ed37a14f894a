use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::HeaderError;
use crate::source::{BlockSource, TAG_INHERIT, TAG_LOCAL, TAG_REMOTE};
use crate::{MAX_LOCATOR_LENGTH, SUPPORTED_VERSION};

/// version + generation + size + block_size
const WIRE_FIXED_LEN: usize = 4 + 8 + 8 + 4;

/// block index + source tag
const WIRE_ENTRY_FIXED_LEN: usize = 8 + 1;

/// Fixed-size metadata at the front of every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Wire format version.
    pub version: u32,
    /// Build generation; strictly increases along a lineage.
    pub generation: u64,
    /// Artifact size in bytes.
    pub size: u64,
    /// Block size in bytes; uniform across a lineage.
    pub block_size: u32,
}

impl Metadata {
    /// Metadata for the current format version.
    pub fn new(generation: u64, size: u64, block_size: u32) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            generation,
            size,
            block_size,
        }
    }

    /// Number of blocks covering `size` bytes.
    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.size.div_ceil(self.block_size as u64)
    }
}

/// Block header for one artifact of one build.
///
/// Owns the sparse block map and, in memory, an optional link to the parent
/// build's header. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    metadata: Metadata,
    map: BTreeMap<u64, BlockSource>,
    parent: Option<Arc<Header>>,
}

impl Header {
    /// Build a parentless header, validating the map against the metadata.
    pub fn new(metadata: Metadata, map: BTreeMap<u64, BlockSource>) -> Result<Self, HeaderError> {
        if metadata.version != SUPPORTED_VERSION {
            return Err(HeaderError::UnsupportedVersion {
                version: metadata.version,
            });
        }
        if metadata.block_size == 0 {
            return Err(HeaderError::ZeroBlockSize);
        }

        let blocks = metadata.block_count();
        for (index, source) in &map {
            if *index >= blocks {
                return Err(HeaderError::IndexOutOfRange {
                    index: *index,
                    blocks,
                });
            }
            if let Some(locator) = source.locator() {
                if locator.len() > MAX_LOCATOR_LENGTH {
                    return Err(HeaderError::InvalidLocator {
                        index: *index,
                        reason: format!("locator exceeds {} bytes", MAX_LOCATOR_LENGTH),
                    });
                }
            }
        }

        Ok(Self {
            metadata,
            map,
            parent: None,
        })
    }

    /// Attach the parent header this one delegates unmapped blocks to.
    ///
    /// The child generation must advance past the parent's, and both must
    /// agree on block size, otherwise offset math across the lineage would
    /// not line up.
    pub fn with_parent(mut self, parent: Arc<Header>) -> Result<Self, HeaderError> {
        if self.metadata.generation <= parent.metadata.generation {
            return Err(HeaderError::StaleGeneration {
                child: self.metadata.generation,
                parent: parent.metadata.generation,
            });
        }
        if self.metadata.block_size != parent.metadata.block_size {
            return Err(HeaderError::BlockSizeMismatch {
                child: self.metadata.block_size,
                parent: parent.metadata.block_size,
            });
        }
        self.parent = Some(parent);
        Ok(self)
    }

    /// Header for the next build in a lineage.
    ///
    /// `entries` maps only the blocks the new build touched; everything
    /// else inherits from `parent`. Size and block size carry over, the
    /// generation advances by one.
    pub fn for_snapshot(
        parent: Arc<Header>,
        entries: BTreeMap<u64, BlockSource>,
    ) -> Result<Self, HeaderError> {
        let metadata = Metadata::new(
            parent.metadata.generation + 1,
            parent.metadata.size,
            parent.metadata.block_size,
        );
        Self::new(metadata, entries)?.with_parent(parent)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn generation(&self) -> u64 {
        self.metadata.generation
    }

    /// Artifact size in bytes.
    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    pub fn block_size(&self) -> u32 {
        self.metadata.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.metadata.block_count()
    }

    /// This header's own map, without lineage applied.
    pub fn entries(&self) -> &BTreeMap<u64, BlockSource> {
        &self.map
    }

    pub fn parent(&self) -> Option<&Arc<Header>> {
        self.parent.as_ref()
    }

    /// Resolve a block through the lineage.
    ///
    /// Probes this header's map first; an absent or [`BlockSource::Inherit`]
    /// entry falls through to the parent. Returns `None` when the lineage is
    /// exhausted without any header claiming the block, which at the root of
    /// a storage-backed lineage is a data-integrity fault for the caller to
    /// surface. Never returns `Inherit`.
    pub fn resolve(&self, index: u64) -> Option<&BlockSource> {
        let mut current = self;
        loop {
            match current.map.get(&index) {
                Some(BlockSource::Inherit) | None => match &current.parent {
                    Some(parent) => current = parent,
                    None => return None,
                },
                Some(source) => return Some(source),
            }
        }
    }

    /// Collapse the lineage into a parentless header with the effective map.
    ///
    /// Keeps this header's metadata; every block still unresolved after
    /// walking the whole chain stays absent from the result. Used when
    /// persisting, since the wire format carries no parent linkage.
    pub fn flatten(&self) -> Header {
        let mut chain = Vec::new();
        let mut current = self;
        loop {
            chain.push(current);
            match &current.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }

        let blocks = self.metadata.block_count();
        let mut map = BTreeMap::new();
        for header in chain.iter().rev() {
            for (index, source) in &header.map {
                if *index >= blocks {
                    continue;
                }
                if !matches!(source, BlockSource::Inherit) {
                    map.insert(*index, source.clone());
                }
            }
        }

        Header {
            metadata: self.metadata,
            map,
            parent: None,
        }
    }

    /// Serialize this header's own map to the wire format.
    ///
    /// Parent linkage is not written; serialize [`Header::flatten`] output
    /// when the lineage must survive on its own.
    pub fn serialize(&self) -> Bytes {
        let mut cap = WIRE_FIXED_LEN;
        for source in self.map.values() {
            cap += WIRE_ENTRY_FIXED_LEN;
            if let Some(locator) = source.locator() {
                cap += 2 + locator.len();
            }
        }

        let mut buf = BytesMut::with_capacity(cap);
        buf.put_u32_le(self.metadata.version);
        buf.put_u64_le(self.metadata.generation);
        buf.put_u64_le(self.metadata.size);
        buf.put_u32_le(self.metadata.block_size);

        for (index, source) in &self.map {
            buf.put_u64_le(*index);
            buf.put_u8(source.tag());
            if let Some(locator) = source.locator() {
                buf.put_u16_le(locator.len() as u16);
                buf.put_slice(locator.as_bytes());
            }
        }

        buf.freeze()
    }

    /// Parse a header from its wire representation.
    ///
    /// The version is checked before anything else so an incompatible
    /// writer is reported as such rather than as garbage. The result is
    /// all-or-nothing; no partially populated header escapes an error.
    pub fn deserialize(data: &[u8]) -> Result<Self, HeaderError> {
        let mut buf = data;

        need(&buf, 4, "version")?;
        let version = buf.get_u32_le();
        if version != SUPPORTED_VERSION {
            return Err(HeaderError::UnsupportedVersion { version });
        }

        need(&buf, 8, "generation")?;
        let generation = buf.get_u64_le();
        need(&buf, 8, "size")?;
        let size = buf.get_u64_le();
        need(&buf, 4, "block size")?;
        let block_size = buf.get_u32_le();
        if block_size == 0 {
            return Err(HeaderError::ZeroBlockSize);
        }

        let metadata = Metadata {
            version,
            generation,
            size,
            block_size,
        };
        let blocks = metadata.block_count();

        let mut map = BTreeMap::new();
        let mut last_index = None;
        while buf.has_remaining() {
            need(&buf, 8, "block index")?;
            let index = buf.get_u64_le();
            if index >= blocks {
                return Err(HeaderError::IndexOutOfRange { index, blocks });
            }
            if last_index.is_some_and(|last| index <= last) {
                return Err(HeaderError::OutOfOrder { index });
            }
            last_index = Some(index);

            need(&buf, 1, "source tag")?;
            let source = match buf.get_u8() {
                TAG_INHERIT => BlockSource::Inherit,
                tag @ (TAG_LOCAL | TAG_REMOTE) => {
                    need(&buf, 2, "locator length")?;
                    let len = buf.get_u16_le() as usize;
                    need(&buf, len, "locator")?;
                    let mut raw = vec![0u8; len];
                    buf.copy_to_slice(&mut raw);
                    let locator =
                        String::from_utf8(raw).map_err(|e| HeaderError::InvalidLocator {
                            index,
                            reason: e.to_string(),
                        })?;
                    if tag == TAG_LOCAL {
                        BlockSource::Local(locator)
                    } else {
                        BlockSource::Remote(locator)
                    }
                }
                tag => return Err(HeaderError::UnknownSourceTag { tag }),
            };
            map.insert(index, source);
        }

        Ok(Self {
            metadata,
            map,
            parent: None,
        })
    }
}

fn need(buf: &impl Buf, len: usize, context: &'static str) -> Result<(), HeaderError> {
    if buf.remaining() < len {
        return Err(HeaderError::Truncated { context });
    }
    Ok(())
}

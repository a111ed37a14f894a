//! Block header format library.
//!
//! A header describes one artifact (memory image or root filesystem) of a
//! template build: fixed metadata followed by a sparse block map telling,
//! for each mapped block, where its bytes live. A block absent from the map
//! inherits from the parent build's header; resolution walks the lineage
//! until some header claims the block.
//!
//! # Wire format (v1, little-endian)
//!
//! ```text
//! u32 version | u64 generation | u64 size | u32 block_size
//! repeated { u64 block_index | u8 tag | (tag 1, 2) u16 len + locator }
//! ```
//!
//! Entries are sorted strictly ascending by block index. Tag 0 inherits
//! from the parent, tag 1 names a local diff file, tag 2 names a remote
//! diff object. Parent linkage is an in-memory association only and is
//! never serialized; persist [`Header::flatten`] output when a lineage
//! must survive on its own.
//!
//! Headers are immutable after construction. A new build produces a new
//! header with a strictly larger generation.

mod error;
mod header;
mod source;

pub use error::HeaderError;
pub use header::{Header, Metadata};
pub use source::BlockSource;

/// The only header version this library reads and writes.
pub const SUPPORTED_VERSION: u32 = 1;

/// Maximum locator length in bytes (bounded by the u16 length prefix).
pub const MAX_LOCATOR_LENGTH: usize = u16::MAX as usize;

use thiserror::Error;

/// Block header parse and construction errors.
///
/// Any variant produced while deserializing means the input is corrupt or
/// from an incompatible writer; callers must treat the header as unusable
/// rather than working with a partial map.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Header version this library does not understand.
    #[error("unsupported header version {version}")]
    UnsupportedVersion { version: u32 },

    /// Input ended before the field being read was complete.
    #[error("truncated header while reading {context}")]
    Truncated { context: &'static str },

    /// Block source tag outside the known set.
    #[error("unknown block source tag {tag}")]
    UnknownSourceTag { tag: u8 },

    /// Block index at or past the block count implied by size and block size.
    #[error("block index {index} out of range for {blocks} blocks")]
    IndexOutOfRange { index: u64, blocks: u64 },

    /// Entry indices not strictly ascending.
    #[error("block index {index} out of order")]
    OutOfOrder { index: u64 },

    /// Locator not valid UTF-8 or too long.
    #[error("invalid locator for block {index}: {reason}")]
    InvalidLocator { index: u64, reason: String },

    /// Metadata declared a zero block size.
    #[error("block size must be non-zero")]
    ZeroBlockSize,

    /// Child generation does not advance past the parent's.
    #[error("stale generation {child} over parent generation {parent}")]
    StaleGeneration { child: u64, parent: u64 },

    /// Child and parent disagree on block size.
    #[error("block size {child} does not match parent block size {parent}")]
    BlockSizeMismatch { child: u32, parent: u32 },
}

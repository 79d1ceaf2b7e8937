//! Error types for E57 compressed vector reading

use thiserror::Error;

/// Result type for compressed vector operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while opening or draining a compressed vector section
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A physical page failed its CRC check
    #[error("checksum mismatch in page {page}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { page: u64, expected: u32, actual: u32 },

    /// A read ran past the end of the logical stream
    #[error("short read: wanted {wanted} bytes at logical offset {offset}")]
    ShortRead { offset: u64, wanted: usize },

    /// Caller handed the API something unusable
    #[error("bad API argument: {context}")]
    BadApiArgument { context: String },

    /// Buffers supplied to a later read differ from the set the reader was opened with
    #[error("buffers not compatible: {context}")]
    BuffersNotCompatible { context: String },

    /// A packet or section header does not obey the binary format
    #[error("bad packet: {context}")]
    BadPacket { context: String },

    /// No transfer is possible between the element type and the bound buffer
    #[error("no buffer transfer possible for element: {context}")]
    NoBufferForElement { context: String },

    /// A transfer needs a representation conversion the buffer did not opt into
    #[error("conversion required but not requested: {context}")]
    ConversionRequired { context: String },

    /// A decoded value does not fit the bound buffer's representation
    #[error("value out of range: {context}")]
    ValueOutOfRange { context: String },

    /// Operation on a reader that is already closed
    #[error("reader not open: {context}")]
    ReaderNotOpen { context: String },

    /// Operation through an image file that is already closed
    #[error("image file not open: {context}")]
    ImageFileNotOpen { context: String },

    /// Operation the format defines but this reader does not support
    #[error("not implemented: {context}")]
    NotImplemented { context: String },

    /// Invariant violation; `detail` carries the offending index or offset
    #[error("internal error: {context} (detail={detail})")]
    Internal { context: String, detail: u64 },
}

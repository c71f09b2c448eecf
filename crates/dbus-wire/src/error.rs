//! Error types for the wire codec

use thiserror::Error;

/// Maximum size of a complete message (128 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Maximum encoded size of the header field array (64 KiB)
pub const MAX_HEADER_FIELDS_SIZE: usize = 1 << 16;

/// Maximum encoded size of any single array (64 MiB)
pub const MAX_ARRAY_SIZE: usize = 1 << 26;

/// Codec and validation errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Malformed type signature
    #[error("invalid signature {0:?}: {1}")]
    InvalidSignature(String, &'static str),

    /// Buffer ended in the middle of an element
    #[error("truncated data: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// A string element was not valid UTF-8
    #[error("string is not valid UTF-8")]
    BadUtf8,

    /// A string, path or signature element contained a NUL byte
    #[error("embedded NUL byte in string data")]
    EmbeddedNul,

    /// Malformed object path
    #[error("invalid object path: {0:?}")]
    BadObjectPath(String),

    /// A boolean was encoded as something other than 0 or 1
    #[error("invalid boolean value: {0}")]
    BadBoolean(u32),

    /// An array exceeded the 64 MiB wire limit
    #[error("array of {len} bytes exceeds maximum of {max}")]
    ArrayTooLong { len: usize, max: usize },

    /// An `h` element referenced a descriptor that was never received
    #[error("no file descriptor at index {0}")]
    MissingFd(u32),

    /// A value did not match the signature it was marshalled under
    #[error("type mismatch: expected {expected:?}, got {found:?}")]
    TypeMismatch { expected: String, found: String },

    /// Structurally invalid message header
    #[error("invalid message header: {0}")]
    InvalidHeader(String),

    /// Fewer bytes available than the declared message size
    #[error("incomplete message: need {needed} bytes, have {have}")]
    Incomplete { needed: usize, have: usize },

    /// Message exceeds the 128 MiB limit
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Malformed bus name
    #[error("invalid bus name: {0:?}")]
    InvalidBusName(String),

    /// Malformed interface or error name
    #[error("invalid interface name: {0:?}")]
    InvalidInterfaceName(String),

    /// Malformed member name
    #[error("invalid member name: {0:?}")]
    InvalidMemberName(String),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, WireError>;

//! Network-layer errors and wire error codes.

use thiserror::Error;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Wire error codes carried in reply `ret_code` fields.
///
/// A non-zero low byte marks a real error; a zero low byte is a benign
/// status the client may treat as success metadata.
pub mod codes {
    /// Success
    pub const OK: u32 = 0x0000;
    /// Write addressed to a replica
    pub const NOT_MASTER: u32 = 0x0102;
    /// Malformed request body
    pub const ILLEGAL_PARAMS: u32 = 0x0202;
    /// Node is read-only (no WAL writer available)
    pub const READONLY: u32 = 0x0401;
    /// Allocation or quota failure
    pub const MEMORY_ISSUE: u32 = 0x0701;
    /// Duplicate key in a unique index
    pub const DUPLICATE: u32 = 0x2002;
    /// Unknown opcode
    pub const UNKNOWN_OPCODE: u32 = 0x2702;
    /// No tuple matches the key
    pub const NOT_FOUND: u32 = 0x3102;
    /// Mutation would violate an index constraint
    pub const INDEX_VIOLATION: u32 = 0x3802;

    /// True for codes whose low byte marks an error.
    pub fn is_error(code: u32) -> bool {
        code & 0xff != 0
    }
}

/// Errors raised by connection plumbing and framing.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed or connection torn down
    #[error("connection closed")]
    Closed,

    /// Frame larger than the configured limit
    #[error("frame of {got} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Claimed frame size
        got: usize,
        /// Configured cap
        limit: usize,
    },

    /// Reply carried an error code
    #[error("remote error {code:#06x}: {message}")]
    Remote {
        /// Wire error code
        code: u32,
        /// UTF-8 message from the peer
        message: String,
    },
}

//! Error types shared across the engine core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced while encoding or decoding core records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Not enough bytes to hold the claimed structure.
    #[error("truncated record: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the header or length prefix
        need: usize,
        /// Bytes actually available
        have: usize,
    },

    /// Row header checksum failed.
    #[error("row header crc mismatch: stored {stored:08x}, computed {computed:08x}")]
    HeaderCrcMismatch {
        /// Checksum carried by the row
        stored: u32,
        /// Checksum computed over the buffer
        computed: u32,
    },

    /// Row payload checksum failed while the header was valid.
    #[error("row data crc mismatch at lsn {lsn}: stored {stored:08x}, computed {computed:08x}")]
    DataCrcMismatch {
        /// LSN of the damaged row
        lsn: i64,
        /// Checksum carried by the row
        stored: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// A tag value outside the known classes.
    #[error("invalid row tag {0:#06x}")]
    InvalidTag(u16),

    /// Tuple bytes do not describe a well-formed field tail.
    #[error("malformed tuple: {0}")]
    MalformedTuple(String),

    /// Field ordinal past the tuple cardinality.
    #[error("tuple field {ordinal} out of range (cardinality {cardinality})")]
    FieldOutOfRange {
        /// Requested field ordinal
        ordinal: u32,
        /// Tuple cardinality
        cardinality: u32,
    },
}

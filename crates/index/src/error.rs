//! Index-layer errors.

use thiserror::Error;
use tidelog_core::CoreError;

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors raised by index lookups and mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// A unique index already holds a different tuple under this key.
    #[error("duplicate key in unique index {index}")]
    Violation {
        /// Ordinal of the violated index within its table
        index: usize,
    },

    /// A search pattern could not be decoded.
    #[error("bad key pattern: {0}")]
    BadPattern(String),

    /// Pattern carries more fields than the key definition.
    #[error("pattern cardinality {got} exceeds key cardinality {max}")]
    PatternCardinality {
        /// Fields supplied by the pattern
        got: u32,
        /// Fields in the key definition
        max: u32,
    },

    /// Tuple could not be projected through the key definition.
    #[error(transparent)]
    Core(#[from] CoreError),
}

//! Node-level errors.

use thiserror::Error;

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfacing from node startup and lifecycle.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Disk, recovery or WAL failure
    #[error(transparent)]
    Durability(#[from] tidelog_durability::DurabilityError),

    /// Listener or socket failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Network plumbing failure
    #[error(transparent)]
    Net(#[from] tidelog_net::NetError),

    /// Bad node configuration
    #[error("configuration error: {0}")]
    Config(String),
}

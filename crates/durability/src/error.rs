//! Durability-layer errors.

use thiserror::Error;
use tidelog_core::{CoreError, Lsn};

/// Result type alias for durability operations.
pub type Result<T> = std::result::Result<T, DurabilityError>;

/// Errors raised by log files, the WAL writer and recovery.
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// File or socket failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Row or tuple encoding failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Replication transport failure
    #[error(transparent)]
    Net(#[from] tidelog_net::NetError),

    /// Log file header could not be parsed
    #[error("bad log header in {path}: {reason}")]
    BadFileHeader {
        /// Offending file
        path: String,
        /// What was wrong
        reason: String,
    },

    /// Recovery found a hole in the LSN sequence
    #[error("lsn gap: expected {expected}, found {got}")]
    LsnGap {
        /// Next LSN recovery was waiting for
        expected: Lsn,
        /// LSN actually read
        got: Lsn,
    },

    /// The WAL writer child is gone; the row was not committed
    #[error("wal writer unavailable")]
    WriterDead,

    /// The WAL child rejected or mangled a request
    #[error("wal protocol error: {0}")]
    WalProtocol(String),

    /// Replication handshake failed
    #[error("replication handshake failed: {0}")]
    Handshake(String),

    /// A shard executor failed to apply a row
    #[error("apply failed at lsn {lsn}: {reason}")]
    Apply {
        /// Row that failed
        lsn: Lsn,
        /// Executor diagnostic
        reason: String,
    },

    /// Another process holds the data directory
    #[error("data directory {0} is locked by another process")]
    DirLocked(String),
}

//! Durability: log files, the WAL writer child, recovery and replication.
//!
//! Everything that makes state survive a crash lives here. The on-disk
//! vocabulary is the [`format`] module (file preambles, row markers);
//! [`dir`] scans and locks the snapshot/WAL directories; [`reader`] pulls
//! rows back out with torn-tail tolerance; [`writer`]/[`child`] are the
//! two halves of the group-committing WAL writer process; [`snapshot`]
//! dumps full state behind a fork; [`recovery`] replays snapshot plus WAL
//! into the in-memory indexes; and [`puller`] streams rows from a feeder
//! for follower nodes.

pub mod child;
pub mod dir;
pub mod error;
pub mod format;
pub mod puller;
pub mod reader;
pub mod recovery;
pub mod snapshot;
pub mod writer;

pub use dir::LogDir;
pub use error::{DurabilityError, Result};
pub use format::{FileHeader, FileType, INPROGRESS_SUFFIX, VERSION_11, VERSION_12};
pub use puller::{Backoff, FeederFilter, FeederParam, Puller, REPLICATION_VERSION};
pub use reader::{FollowReader, LogReader};
pub use recovery::{Recovery, RecoveryState, RowConsumer, RunCrcStatus};
pub use snapshot::{fork_and_run, write_snapshot};
pub use writer::{Commit, DummyWriter, WalConfig, WalWriter, WAL_PACK_MAX};

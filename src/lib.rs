//! # tidelog
//!
//! An in-memory, log-structured key-value engine with asynchronous
//! replication. All mutations land in an append-only write-ahead log
//! through a group-committing child process; startup rebuilds state from
//! the newest snapshot plus the WAL tail; a single-threaded cooperative
//! event loop serves a binary request protocol; followers stream the
//! primary's rows and apply them to identical in-memory indexes.
//!
//! The engine crates underneath:
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `tidelog-core` | sequence numbers, row tags, the durable row, tuples |
//! | `tidelog-index` | order-statistic tree, hash/tree indexes, replace protocol |
//! | `tidelog-durability` | log format, WAL writer child, recovery, replication puller |
//! | `tidelog-net` | byte cursor, output queue, connections, framing, dispatch |
//!
//! This crate wires them into a node: shards and their tuple spaces, the
//! insert/select/delete opcodes, the replication feeder and the node
//! lifecycle.

pub mod error;
pub mod feeder;
pub mod node;
pub mod ops;
pub mod shard;
pub mod space;

pub use error::{NodeError, Result};
pub use node::{Node, NodeConfig, NodeState};
pub use ops::{OP_DELETE, OP_INSERT, OP_SELECT};
pub use shard::{Shard, ShardRole, Shards};
pub use space::Space;

pub use tidelog_core::{Lsn, Row, Scn, ShardId, Tag, TagKind, Tuple, TupleRef};
pub use tidelog_durability::FeederParam;
pub use tidelog_index::KeyDef;

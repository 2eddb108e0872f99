//! Core types for the tidelog engine.
//!
//! This crate defines the vocabulary shared by every layer: sequence
//! numbers, row tags, the durable [`Row`] record, and the reference-counted
//! [`Tuple`] payload. It has no I/O of its own; the durability and network
//! crates build their file and wire formats on top of these types.

pub mod error;
pub mod row;
pub mod tag;
pub mod tuple;
pub mod types;

pub use error::{CoreError, Result};
pub use row::{Row, ROW_HEADER_SIZE};
pub use tag::{Tag, TagClass, TagKind};
pub use tuple::{Tuple, TupleRef};
pub use types::{Lsn, Scn, ShardId, RemoteScn, SHARD_ID_NONE};

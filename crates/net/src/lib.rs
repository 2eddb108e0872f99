//! Cooperative network core.
//!
//! Single-threaded I/O plumbing for the request/response protocol: the
//! buffered byte cursor, the tuple-retaining output segment queue,
//! connection objects with cooperative reader/flusher tasks, request
//! framing, and the opcode dispatch service. Everything here runs on a
//! current-thread runtime; tasks yield only at socket readiness, queue
//! wakeups and the close signal, so handlers touch shared state without
//! locks.

pub mod conn;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod netmsg;
pub mod service;

pub use conn::{ConnRef, ConnState, Connection};
pub use cursor::ByteCursor;
pub use error::{codes, NetError, Result};
pub use frame::{Reply, Request, FRAME_HEADER_SIZE, MSG_PING, MSG_REPLICA};
pub use netmsg::{Mark, MsgQueue, IOV_MAX, NETMSG_IOV_SIZE};
pub use service::{Client, Handler, ReplyError, Service};

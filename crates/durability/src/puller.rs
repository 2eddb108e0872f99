//! Replication puller.
//!
//! A follower dials its feeder, sends a `replica` request whose body is
//! the handshake — protocol version, the SCN to resume from, and a named
//! filter — and, once the feeder acknowledges, reads an unframed stream
//! of v12 rows (each self-delimiting through its header). Row LSNs are
//! meaningless across nodes; the follower allocates its own and records
//! the upstream SCN in `remote_scn`.
//!
//! Reconnection is the caller's loop; [`Backoff`] provides the
//! exponential delay, capped and reset on the first successful row.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use tidelog_core::row::{RowHeader, ROW_HEADER_SIZE};
use tidelog_core::{Row, Scn};
use tidelog_net::{codes, ByteCursor, Client, NetError, MSG_REPLICA};

use crate::error::{DurabilityError, Result};

/// Replication protocol version spoken by this node.
pub const REPLICATION_VERSION: u32 = 2;

/// Fixed width of the filter name field in the handshake.
pub const REPLICATION_FILTER_NAME_LEN: usize = 32;

/// Pass-through filter understood by every feeder.
pub const FILTER_ID: &str = "id";

/// Row filter requested from the feeder.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FeederFilter {
    /// Registered filter name
    pub name: String,
    /// Filter dialect tag
    #[serde(default)]
    pub ty: u32,
    /// Opaque filter argument
    #[serde(default)]
    pub arg: Vec<u8>,
}

impl Default for FeederFilter {
    fn default() -> FeederFilter {
        FeederFilter {
            name: FILTER_ID.to_string(),
            ty: 0,
            arg: Vec::new(),
        }
    }
}

/// Where and how to pull rows from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct FeederParam {
    /// Feeder address, `host:port`
    pub addr: String,
    /// Row filter
    #[serde(default)]
    pub filter: FeederFilter,
}

impl FeederParam {
    /// Feeder at an address with the pass-through filter.
    pub fn new(addr: impl Into<String>) -> FeederParam {
        FeederParam {
            addr: addr.into(),
            filter: FeederFilter::default(),
        }
    }
}

/// A decoded handshake, as the feeder sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Requested protocol version
    pub version: u32,
    /// Resume the stream at the first row past this SCN
    pub scn: Scn,
    /// Requested filter
    pub filter: FeederFilter,
}

/// Encode the replica handshake body.
pub fn encode_handshake(scn: Scn, filter: &FeederFilter) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 8 + REPLICATION_FILTER_NAME_LEN + 8 + filter.arg.len());
    buf.extend_from_slice(&REPLICATION_VERSION.to_le_bytes());
    buf.extend_from_slice(&scn.0.to_le_bytes());
    let mut name = [0u8; REPLICATION_FILTER_NAME_LEN];
    let n = filter.name.len().min(REPLICATION_FILTER_NAME_LEN - 1);
    name[..n].copy_from_slice(&filter.name.as_bytes()[..n]);
    buf.extend_from_slice(&name);
    buf.extend_from_slice(&filter.ty.to_le_bytes());
    buf.extend_from_slice(&(filter.arg.len() as u32).to_le_bytes());
    buf.extend_from_slice(&filter.arg);
    buf
}

/// Decode a replica handshake body. The filter type and argument are
/// optional for peers speaking the older handshake.
pub fn decode_handshake(buf: &[u8]) -> Result<Handshake> {
    let base = 4 + 8 + REPLICATION_FILTER_NAME_LEN;
    if buf.len() < base {
        return Err(DurabilityError::Handshake(format!(
            "handshake of {} bytes is too short",
            buf.len()
        )));
    }
    let version = LittleEndian::read_u32(&buf[0..4]);
    if version != 1 && version != REPLICATION_VERSION {
        return Err(DurabilityError::Handshake(format!(
            "unsupported replication version {}",
            version
        )));
    }
    let scn = Scn(LittleEndian::read_i64(&buf[4..12]));
    let name_bytes = &buf[12..12 + REPLICATION_FILTER_NAME_LEN];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    let name = if name.is_empty() {
        FILTER_ID.to_string()
    } else {
        name
    };

    let (ty, arg) = if buf.len() >= base + 8 {
        let ty = LittleEndian::read_u32(&buf[base..base + 4]);
        let arglen = LittleEndian::read_u32(&buf[base + 4..base + 8]) as usize;
        if buf.len() < base + 8 + arglen {
            return Err(DurabilityError::Handshake("truncated filter argument".into()));
        }
        (ty, buf[base + 8..base + 8 + arglen].to_vec())
    } else {
        (0, Vec::new())
    };

    Ok(Handshake {
        version,
        scn,
        filter: FeederFilter { name, ty, arg },
    })
}

/// An established replication stream.
pub struct Puller {
    stream: tokio::net::TcpStream,
    rbuf: ByteCursor,
}

impl Puller {
    /// Dial the feeder and handshake at `scn`.
    pub async fn connect(param: &FeederParam, scn: Scn) -> Result<Puller> {
        let mut client = Client::connect(&param.addr).await.map_err(NetError::from)?;
        let reply = client
            .call(MSG_REPLICA, &encode_handshake(scn, &param.filter))
            .await?;
        if codes::is_error(reply.ret_code) {
            return Err(DurabilityError::Handshake(format!(
                "feeder refused: {:#06x} {}",
                reply.ret_code,
                String::from_utf8_lossy(&reply.data)
            )));
        }
        info!(feeder = %param.addr, scn = scn.0, "replication stream established");
        let (stream, rbuf) = client.into_parts();
        Ok(Puller { stream, rbuf })
    }

    /// Read the next row off the stream.
    pub async fn recv_row(&mut self) -> Result<Row> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let s = self.rbuf.as_slice();
            if s.len() >= ROW_HEADER_SIZE {
                let header = RowHeader::decode(&s[..ROW_HEADER_SIZE])?;
                let total = ROW_HEADER_SIZE + header.len as usize;
                if s.len() >= total {
                    let row = Row::from_parts(header, s[ROW_HEADER_SIZE..total].to_vec())?;
                    self.rbuf.ltrim(total);
                    return Ok(row);
                }
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(NetError::Closed.into());
            }
            self.rbuf.append(&buf[..n]);
        }
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `base`, never exceed `cap`.
    pub fn new(base: Duration, cap: Duration) -> Backoff {
        Backoff {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to sleep before the next attempt; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        debug!(delay_ms = delay.as_millis() as u64, "replication backoff");
        delay
    }

    /// Reset after a healthy stretch.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

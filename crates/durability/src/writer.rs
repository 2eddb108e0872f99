//! WAL writer, parent side.
//!
//! Durability runs in a child process behind a socketpair so a writer
//! crash cannot corrupt the serving process. The parent batches submitted
//! rows into packs of up to [`WAL_PACK_MAX`], ships each pack as one
//! length-prefixed request, and suspends the submitting task until the
//! child's reply carries the assigned LSNs. Packs are FIFO: rows of one
//! shard commit in submission order because they ride the same queue and
//! the child assigns LSNs consecutively.
//!
//! Every request carries the parent's `epoch` (bumped on writer respawn)
//! and a monotonic `seq`; a reply that does not match the epoch is
//! discarded. When the child dies, every waiter fails with
//! [`DurabilityError::WriterDead`] and nothing is retried automatically —
//! the caller decides what a lost row means.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, warn};

use tidelog_core::{Lsn, Row, Scn};

use crate::error::{DurabilityError, Result};

/// Most rows in one request to the child.
pub const WAL_PACK_MAX: usize = 1024;

/// Request magic, a cheap sanity check on the socketpair stream.
pub const WAL_MAGIC: u32 = 0x77a1_10b5;

/// One batched request to the WAL child.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRequest {
    /// Monotonic request number
    pub seq: i64,
    /// Parent epoch, bumped on writer respawn
    pub epoch: i64,
    /// Rows to append; LSNs are assigned by the child
    pub rows: Vec<Row>,
}

impl WalRequest {
    /// Encode as a length-prefixed packet.
    pub fn encode(&self) -> Vec<u8> {
        let rows_len: usize = self.rows.iter().map(|r| r.encoded_len()).sum();
        let body_len = 4 + 4 + 8 + 8 + rows_len;
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());
        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        for row in &self.rows {
            buf.extend_from_slice(&row.encode());
        }
        buf
    }

    /// Decode a packet body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<WalRequest> {
        if body.len() < 24 {
            return Err(DurabilityError::WalProtocol("request too short".into()));
        }
        let row_count = LittleEndian::read_u32(&body[0..4]) as usize;
        let magic = LittleEndian::read_u32(&body[4..8]);
        if magic != WAL_MAGIC {
            return Err(DurabilityError::WalProtocol(format!(
                "bad request magic {:#010x}",
                magic
            )));
        }
        let seq = LittleEndian::read_i64(&body[8..16]);
        let epoch = LittleEndian::read_i64(&body[16..24]);
        let mut rows = Vec::with_capacity(row_count);
        let mut pos = 24;
        for _ in 0..row_count {
            let (row, consumed) = Row::decode(&body[pos..])?;
            rows.push(row);
            pos += consumed;
        }
        Ok(WalRequest { seq, epoch, rows })
    }
}

/// The child's answer to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct WalReply {
    /// Echoed request number
    pub seq: i64,
    /// Echoed epoch
    pub epoch: i64,
    /// Rows appended
    pub row_count: u32,
    /// Last assigned LSN
    pub lsn: Lsn,
    /// SCN of the last row, echoed for the submitter
    pub scn: Scn,
    /// Rolling-checksum checkpoints, newest last
    pub crc_hist: Vec<(Lsn, u32)>,
}

impl WalReply {
    /// Encode as a length-prefixed packet.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 4 + 4 + 8 + 8 + 8 + 8 + self.crc_hist.len() * 12;
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.row_count.to_le_bytes());
        buf.extend_from_slice(&(self.crc_hist.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.lsn.0.to_le_bytes());
        buf.extend_from_slice(&self.scn.0.to_le_bytes());
        for (lsn, crc) in &self.crc_hist {
            buf.extend_from_slice(&lsn.0.to_le_bytes());
            buf.extend_from_slice(&crc.to_le_bytes());
        }
        buf
    }

    /// Decode a packet body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<WalReply> {
        if body.len() < 40 {
            return Err(DurabilityError::WalProtocol("reply too short".into()));
        }
        let row_count = LittleEndian::read_u32(&body[0..4]);
        let crc_count = LittleEndian::read_u32(&body[4..8]) as usize;
        let seq = LittleEndian::read_i64(&body[8..16]);
        let epoch = LittleEndian::read_i64(&body[16..24]);
        let lsn = Lsn(LittleEndian::read_i64(&body[24..32]));
        let scn = Scn(LittleEndian::read_i64(&body[32..40]));
        if body.len() < 40 + crc_count * 12 {
            return Err(DurabilityError::WalProtocol("truncated crc history".into()));
        }
        let mut crc_hist = Vec::with_capacity(crc_count);
        for i in 0..crc_count {
            let at = 40 + i * 12;
            crc_hist.push((
                Lsn(LittleEndian::read_i64(&body[at..at + 8])),
                LittleEndian::read_u32(&body[at + 8..at + 12]),
            ));
        }
        Ok(WalReply {
            seq,
            epoch,
            row_count,
            lsn,
            scn,
            crc_hist,
        })
    }
}

/// WAL writer tuning.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WalConfig {
    /// WAL directory
    pub dir: std::path::PathBuf,
    /// Rows per xlog file before rotation
    pub rows_per_file: u64,
    /// Outstanding-row cap; submits past it wait
    pub inflight_limit: usize,
}

impl WalConfig {
    /// Defaults for a data directory.
    pub fn new(dir: impl Into<std::path::PathBuf>) -> WalConfig {
        WalConfig {
            dir: dir.into(),
            rows_per_file: 65_536,
            inflight_limit: 4 * WAL_PACK_MAX,
        }
    }

    /// Small limits for tests.
    pub fn for_testing(dir: impl Into<std::path::PathBuf>) -> WalConfig {
        WalConfig {
            dir: dir.into(),
            rows_per_file: 16,
            inflight_limit: 64,
        }
    }

    /// Override the rotation threshold.
    pub fn with_rows_per_file(mut self, rows: u64) -> WalConfig {
        self.rows_per_file = rows;
        self
    }
}

/// Result of one committed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    /// LSN of the first row in the submission
    pub first_lsn: Lsn,
    /// LSN of the last row
    pub last_lsn: Lsn,
    /// Rolling checksum after this submission
    pub run_crc: u32,
}

struct Pack {
    rows: Vec<Row>,
    done: oneshot::Sender<Result<Commit>>,
}

struct Waiter {
    row_count: usize,
    done: oneshot::Sender<Result<Commit>>,
}

struct Inflight {
    seq: i64,
    epoch: i64,
    waiters: Vec<Waiter>,
}

struct Shared {
    epoch: Cell<i64>,
    seq: Cell<i64>,
    lsn: Cell<Lsn>,
    alive: Cell<bool>,
    inflight: RefCell<VecDeque<Inflight>>,
    permits: Arc<Semaphore>,
    permit_cap: u32,
}

impl Shared {
    fn fail_inflight(&self) {
        for pack in self.inflight.borrow_mut().drain(..) {
            for waiter in pack.waiters {
                let _ = waiter.done.send(Err(DurabilityError::WriterDead));
            }
        }
    }
}

/// Handle to a live WAL writer child.
pub struct WalWriter {
    shared: Rc<Shared>,
    tx: RefCell<Option<mpsc::UnboundedSender<Pack>>>,
    child_pid: Cell<Option<nix::unistd::Pid>>,
}

impl WalWriter {
    /// Wrap an established transport to a writer child and spawn the pump
    /// and reply tasks. `last_lsn` seeds the committed-LSN watermark.
    pub fn connect(
        stream: tokio::net::UnixStream,
        epoch: i64,
        last_lsn: Lsn,
        config: &WalConfig,
    ) -> WalWriter {
        let shared = Rc::new(Shared {
            epoch: Cell::new(epoch),
            seq: Cell::new(0),
            lsn: Cell::new(last_lsn),
            alive: Cell::new(true),
            inflight: RefCell::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(config.inflight_limit)),
            permit_cap: config.inflight_limit as u32,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = stream.into_split();
        tokio::task::spawn_local(pump(shared.clone(), rx, write_half));
        tokio::task::spawn_local(reaper(shared.clone(), read_half));
        WalWriter {
            shared,
            tx: RefCell::new(Some(tx)),
            child_pid: Cell::new(None),
        }
    }

    /// Fork the writer child over a socketpair and connect to it.
    ///
    /// The child inherits nothing but its socket end and the config; it
    /// appends, fsyncs and replies until the socket closes, then exits.
    /// `last_run_crc` continues the rolling-checksum chain across writer
    /// restarts.
    pub fn spawn_child(
        config: &WalConfig,
        epoch: i64,
        last_lsn: Lsn,
        last_run_crc: u32,
    ) -> Result<WalWriter> {
        use nix::unistd::ForkResult;

        let (parent_sock, child_sock) = std::os::unix::net::UnixStream::pair()?;
        match unsafe { nix::unistd::fork() }.map_err(std::io::Error::from)? {
            ForkResult::Child => {
                drop(parent_sock);
                let code = match crate::child::serve(child_sock, last_lsn, last_run_crc, config) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(error = %e, "wal child failed");
                        1
                    }
                };
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(child_sock);
                parent_sock.set_nonblocking(true)?;
                let stream = tokio::net::UnixStream::from_std(parent_sock)?;
                let writer = WalWriter::connect(stream, epoch, last_lsn, config);
                writer.child_pid.set(Some(child));
                debug!(pid = child.as_raw(), epoch, "wal child spawned");
                Ok(writer)
            }
        }
    }

    /// True while the child is believed healthy.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.get()
    }

    /// Current epoch.
    pub fn epoch(&self) -> i64 {
        self.shared.epoch.get()
    }

    /// Last LSN confirmed durable.
    pub fn lsn(&self) -> Lsn {
        self.shared.lsn.get()
    }

    /// Submit rows for durable append; suspends until the child's fsync
    /// confirms them and their LSNs are known.
    ///
    /// On [`DurabilityError::WriterDead`] the rows were not (or not
    /// provably) committed and are not retried here.
    pub async fn submit(&self, rows: Vec<Row>) -> Result<Commit> {
        if rows.is_empty() || rows.len() > WAL_PACK_MAX {
            return Err(DurabilityError::WalProtocol(format!(
                "submission of {} rows (1..={} allowed)",
                rows.len(),
                WAL_PACK_MAX
            )));
        }
        if !self.shared.alive.get() {
            return Err(DurabilityError::WriterDead);
        }

        // back-pressure: hold permits for the rows until commit; a
        // submission larger than the whole window takes the window
        let wanted = (rows.len() as u32).min(self.shared.permit_cap);
        let permits = self
            .shared
            .permits
            .clone()
            .acquire_many_owned(wanted)
            .await
            .expect("semaphore never closed");

        let (done, rx) = oneshot::channel();
        self.tx
            .borrow()
            .as_ref()
            .ok_or(DurabilityError::WriterDead)?
            .send(Pack { rows, done })
            .map_err(|_| DurabilityError::WriterDead)?;
        let result = rx.await.map_err(|_| DurabilityError::WriterDead)?;
        drop(permits);
        result
    }

    /// Submit a single row, returning its LSN.
    pub async fn submit_row(&self, row: Row) -> Result<Lsn> {
        Ok(self.submit(vec![row]).await?.last_lsn)
    }

    /// Stop accepting submissions and let the pump close its half of the
    /// socketpair; the child drains, writes its eof marker and exits.
    pub fn close(&self) {
        self.tx.borrow_mut().take();
    }

    /// Reap the child process after its exit was observed.
    pub fn reap(&self) {
        if let Some(pid) = self.child_pid.take() {
            let _ = nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG));
        }
    }

    /// Wait for a closed writer's child to flush and exit, then reap it.
    /// Yields so the pump and reply tasks can run down first.
    pub async fn wait_exit(&self) {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let Some(pid) = self.child_pid.take() else {
            return;
        };
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                _ => return,
            }
        }
    }
}

/// Collect packs from submitters, group them, write requests.
async fn pump(
    shared: Rc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Pack>,
    mut wr: tokio::net::unix::OwnedWriteHalf,
) {
    let mut carry: Option<Pack> = None;
    loop {
        let first = match carry.take() {
            Some(pack) => pack,
            None => match rx.recv().await {
                Some(pack) => pack,
                None => return,
            },
        };
        if !shared.alive.get() {
            let _ = first.done.send(Err(DurabilityError::WriterDead));
            continue;
        }

        // group commit: everything already queued rides this request
        let mut rows = first.rows;
        let mut waiters = vec![Waiter {
            row_count: rows.len(),
            done: first.done,
        }];
        while rows.len() < WAL_PACK_MAX {
            match rx.try_recv() {
                Ok(pack) if rows.len() + pack.rows.len() <= WAL_PACK_MAX => {
                    waiters.push(Waiter {
                        row_count: pack.rows.len(),
                        done: pack.done,
                    });
                    rows.extend(pack.rows);
                }
                Ok(pack) => {
                    // does not fit; it opens the next request instead
                    carry = Some(pack);
                    break;
                }
                Err(_) => break,
            }
        }

        let seq = next_seq(&shared);
        let request = WalRequest {
            seq,
            epoch: shared.epoch.get(),
            rows,
        };
        enqueue_inflight(&shared, seq, waiters);
        if let Err(e) = wr.write_all(&request.encode()).await {
            writer_lost(&shared, &e);
            return;
        }
    }
}

fn next_seq(shared: &Rc<Shared>) -> i64 {
    let seq = shared.seq.get() + 1;
    shared.seq.set(seq);
    seq
}

fn enqueue_inflight(shared: &Rc<Shared>, seq: i64, waiters: Vec<Waiter>) {
    shared.inflight.borrow_mut().push_back(Inflight {
        seq,
        epoch: shared.epoch.get(),
        waiters,
    });
}

fn writer_lost(shared: &Rc<Shared>, e: &dyn std::fmt::Display) {
    if shared.alive.get() {
        warn!(error = %e, "wal writer lost");
        shared.alive.set(false);
        shared.fail_inflight();
    }
}

/// Read replies, match them to inflight packs, wake submitters.
async fn reaper(shared: Rc<Shared>, mut rd: tokio::net::unix::OwnedReadHalf) {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = rd.read_exact(&mut len_buf).await {
            writer_lost(&shared, &e);
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if let Err(e) = rd.read_exact(&mut body).await {
            writer_lost(&shared, &e);
            return;
        }
        let reply = match WalReply::decode(&body) {
            Ok(reply) => reply,
            Err(e) => {
                writer_lost(&shared, &e);
                return;
            }
        };

        if reply.epoch != shared.epoch.get() {
            warn!(
                reply_epoch = reply.epoch,
                epoch = shared.epoch.get(),
                "discarding reply from stale epoch"
            );
            continue;
        }

        let Some(pack) = shared.inflight.borrow_mut().pop_front() else {
            writer_lost(
                &shared,
                &DurabilityError::WalProtocol("reply with no inflight pack".into()),
            );
            return;
        };
        if pack.seq != reply.seq || pack.epoch != reply.epoch {
            writer_lost(
                &shared,
                &DurabilityError::WalProtocol(format!(
                    "reply seq {} does not match inflight seq {}",
                    reply.seq, pack.seq
                )),
            );
            return;
        }

        let run_crc = reply.crc_hist.last().map(|(_, crc)| *crc).unwrap_or(0);
        shared.lsn.set(reply.lsn);
        let mut next_lsn = Lsn(reply.lsn.0 - reply.row_count as i64 + 1);
        for waiter in pack.waiters {
            let first_lsn = next_lsn;
            let last_lsn = Lsn(first_lsn.0 + waiter.row_count as i64 - 1);
            next_lsn = last_lsn.next();
            let _ = waiter.done.send(Ok(Commit {
                first_lsn,
                last_lsn,
                run_crc,
            }));
        }
    }
}

/// LSN allocator for nodes without a WAL child: replicas assign local
/// LSNs to rows that are already durable upstream.
#[derive(Debug)]
pub struct DummyWriter {
    lsn: Cell<Lsn>,
}

impl DummyWriter {
    /// Start allocating after `last_lsn`.
    pub fn new(last_lsn: Lsn) -> DummyWriter {
        DummyWriter {
            lsn: Cell::new(last_lsn),
        }
    }

    /// Last allocated LSN.
    pub fn lsn(&self) -> Lsn {
        self.lsn.get()
    }

    /// Allocate the next LSN.
    pub fn assign(&self) -> Lsn {
        let next = self.lsn.get().next();
        self.lsn.set(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidelog_core::{ShardId, Tag, TagKind};

    fn row(payload: &[u8]) -> Row {
        Row::new(Tag::wal(TagKind::WalData), ShardId(0), payload.to_vec())
    }

    #[test]
    fn request_roundtrip() {
        let request = WalRequest {
            seq: 7,
            epoch: 2,
            rows: vec![row(b"alpha"), row(b""), row(b"gamma")],
        };
        let bytes = request.encode();
        let body_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, bytes.len() - 4);
        let decoded = WalRequest::decode(&bytes[4..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn reply_roundtrip() {
        let reply = WalReply {
            seq: 7,
            epoch: 2,
            row_count: 3,
            lsn: Lsn(103),
            scn: Scn(55),
            crc_hist: vec![(Lsn(103), 0xdeadbeef)],
        };
        let bytes = reply.encode();
        let decoded = WalReply::decode(&bytes[4..]).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn request_rejects_bad_magic() {
        let request = WalRequest {
            seq: 1,
            epoch: 1,
            rows: vec![],
        };
        let mut bytes = request.encode();
        bytes[8] ^= 0xff; // magic lives after len + row_count
        assert!(WalRequest::decode(&bytes[4..]).is_err());
    }

    #[test]
    fn dummy_writer_is_sequential() {
        let w = DummyWriter::new(Lsn(10));
        assert_eq!(w.assign(), Lsn(11));
        assert_eq!(w.assign(), Lsn(12));
        assert_eq!(w.lsn(), Lsn(12));
    }
}

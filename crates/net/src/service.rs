//! Request dispatch service.
//!
//! A service owns an opcode dispatch table, a pool of cooperative worker
//! tasks and a processing queue of connections holding complete requests.
//! The reader task queues a connection when a full frame is buffered;
//! a worker pops it, parses exactly one request, runs the handler and
//! wakes the flusher. A connection with further buffered requests is
//! immediately requeued, so one slow peer cannot monopolize a worker.
//!
//! The dispatch table is open-addressed: slots hold `{code, handler}`
//! with `-1` marking empty, probed at `pos = code & mask` and stepped by
//! `delta = (code % mask) | 1` until a hit or an empty slot falls back to
//! the default (unknown-opcode) handler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::conn::{flusher_task, reader_task, ConnRef, Connection};
use crate::error::codes;
use crate::frame::{self, Request, MSG_PING};

/// Boxed local future, the shape of every handler body.
pub type LocalFut<T> = Pin<Box<dyn Future<Output = T>>>;

/// A handler-raised error, encoded into the reply at the frame boundary.
#[derive(Debug, Clone)]
pub struct ReplyError {
    /// Wire error code
    pub code: u32,
    /// Human-readable message for the reply body
    pub message: String,
}

impl ReplyError {
    /// Build an error reply.
    pub fn new(code: u32, message: impl Into<String>) -> ReplyError {
        ReplyError {
            code,
            message: message.into(),
        }
    }
}

/// Stream handlers write their reply into the output queue themselves.
pub type StreamFn = Rc<dyn Fn(Request, ConnRef) -> LocalFut<Result<(), ReplyError>>>;

/// Block handlers return body bytes for the framework to wrap.
pub type BlockFn = Rc<dyn Fn(Request, ConnRef) -> LocalFut<Result<Vec<u8>, ReplyError>>>;

/// A registered opcode handler.
#[derive(Clone)]
pub enum Handler {
    /// Writes replies directly
    Stream(StreamFn),
    /// Returns bytes, framework frames them
    Block(BlockFn),
}

/// Dispatch table capacity; must be a power of two.
const SERVICE_CAPA: usize = 0x100;

struct Slot {
    code: i64,
    handler: Option<Handler>,
}

struct DispatchTable {
    slots: Vec<Slot>,
    mask: u32,
    default: Handler,
}

impl DispatchTable {
    fn new(default: Handler) -> DispatchTable {
        let mut slots = Vec::with_capacity(SERVICE_CAPA);
        for _ in 0..SERVICE_CAPA {
            slots.push(Slot {
                code: -1,
                handler: None,
            });
        }
        DispatchTable {
            slots,
            mask: (SERVICE_CAPA - 1) as u32,
            default,
        }
    }

    fn register(&mut self, code: u32, handler: Handler) {
        let mut pos = (code & self.mask) as usize;
        let delta = ((code % self.mask) | 1) as usize;
        for _ in 0..self.slots.len() {
            let slot = &mut self.slots[pos];
            if slot.code == -1 || slot.code == code as i64 {
                slot.code = code as i64;
                slot.handler = Some(handler);
                return;
            }
            pos = (pos + delta) & self.mask as usize;
        }
        panic!("dispatch table full");
    }

    fn find(&self, code: u32) -> Handler {
        let mut pos = (code & self.mask) as usize;
        if self.slots[pos].code == code as i64 {
            return self.slots[pos].handler.clone().expect("occupied slot");
        }
        if self.slots[pos].code == -1 {
            return self.default.clone();
        }
        let delta = ((code % self.mask) | 1) as usize;
        loop {
            pos = (pos + delta) & self.mask as usize;
            if self.slots[pos].code == code as i64 {
                return self.slots[pos].handler.clone().expect("occupied slot");
            }
            if self.slots[pos].code == -1 {
                return self.default.clone();
            }
        }
    }
}

/// A request/response service bound to one listener.
pub struct Service {
    name: String,
    workers: usize,
    table: RefCell<DispatchTable>,
    processing: RefCell<VecDeque<ConnRef>>,
    work_wake: Notify,
    active: Cell<usize>,
    shutdown_tx: watch::Sender<bool>,
    conns: RefCell<Vec<ConnRef>>,
}

impl Service {
    /// Create a service with a worker pool of the given size.
    ///
    /// The reserved `ping` opcode is pre-registered.
    pub fn new(name: impl Into<String>, workers: usize) -> Rc<Service> {
        let default: Handler = Handler::Block(Rc::new(|req, _conn| {
            Box::pin(async move {
                Err(ReplyError::new(
                    codes::UNKNOWN_OPCODE,
                    format!("unknown opcode {:#06x}", req.opcode),
                ))
            })
        }));
        let (shutdown_tx, _) = watch::channel(false);
        let svc = Rc::new(Service {
            name: name.into(),
            workers: workers.max(1),
            table: RefCell::new(DispatchTable::new(default)),
            processing: RefCell::new(VecDeque::new()),
            work_wake: Notify::new(),
            active: Cell::new(0),
            shutdown_tx,
            conns: RefCell::new(Vec::new()),
        });
        svc.register_block(MSG_PING, |_req, _conn| Box::pin(async { Ok(Vec::new()) }));
        svc
    }

    /// Register a stream handler for an opcode.
    pub fn register_stream<F>(&self, code: u32, f: F)
    where
        F: Fn(Request, ConnRef) -> LocalFut<Result<(), ReplyError>> + 'static,
    {
        self.table
            .borrow_mut()
            .register(code, Handler::Stream(Rc::new(f)));
    }

    /// Register a block handler for an opcode.
    pub fn register_block<F>(&self, code: u32, f: F)
    where
        F: Fn(Request, ConnRef) -> LocalFut<Result<Vec<u8>, ReplyError>> + 'static,
    {
        self.table
            .borrow_mut()
            .register(code, Handler::Block(Rc::new(f)));
    }

    /// Queue a connection holding at least one complete request.
    pub fn enqueue(&self, conn: &ConnRef) {
        if conn.queued.get() || conn.is_closed() {
            return;
        }
        conn.queued.set(true);
        self.processing.borrow_mut().push_back(conn.clone());
        self.work_wake.notify_one();
    }

    /// Attach an accepted socket: spawn its reader and flusher tasks.
    pub fn attach(self: &Rc<Self>, stream: tokio::net::TcpStream, peer: String) {
        let _ = stream.set_nodelay(true);
        let conn = Connection::new(peer);
        conn.set_connected();
        let (rd, wr) = stream.into_split();

        let svc = self.clone();
        let reader_conn = conn.clone();
        tokio::task::spawn_local(async move {
            let enqueue_svc = svc.clone();
            reader_task(reader_conn, rd, move |c| enqueue_svc.enqueue(c)).await;
        });
        tokio::task::spawn_local(flusher_task(conn.clone(), wr));
        self.conns.borrow_mut().push(conn);
    }

    /// Accept connections until shutdown; drains in-flight handlers with a
    /// bounded wait before returning.
    pub async fn serve(self: Rc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(service = %self.name, addr = ?listener.local_addr().ok(), "serving");
        for _ in 0..self.workers {
            let svc = self.clone();
            tokio::task::spawn_local(worker(svc));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                r = listener.accept() => {
                    let (stream, peer) = r?;
                    self.attach(stream, peer.to_string());
                }
            }
        }

        // bounded drain of in-flight requests, then tear down
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while self.active.get() > 0 || !self.processing.borrow().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(service = %self.name, "shutdown drain timed out");
        }
        for conn in self.conns.borrow().iter() {
            conn.close();
        }
        info!(service = %self.name, "stopped");
        Ok(())
    }

    /// Signal the acceptor and workers to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.work_wake.notify_waiters();
    }

    /// Number of attached connections that are still open.
    pub fn open_conns(&self) -> usize {
        self.conns.borrow().iter().filter(|c| !c.is_closed()).count()
    }
}

async fn worker(svc: Rc<Service>) {
    let mut shutdown_rx = svc.shutdown_tx.subscribe();
    loop {
        let conn = svc.processing.borrow_mut().pop_front();
        let Some(conn) = conn else {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = svc.work_wake.notified() => {}
            }
            continue;
        };

        conn.queued.set(false);
        if conn.is_closed() {
            continue;
        }

        let parsed = {
            let mut rbuf = conn.rbuf.borrow_mut();
            frame::parse(&mut rbuf)
        };
        let request = match parsed {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                debug!(peer = %conn.peer(), error = %e, "bad frame");
                conn.close();
                continue;
            }
        };

        // requeue before dispatch so pipelined requests stay in order
        // behind this one without waiting for it
        if frame::has_complete_frame(&conn.rbuf.borrow()) {
            svc.enqueue(&conn);
        }

        svc.active.set(svc.active.get() + 1);
        dispatch(&svc, request, conn.clone()).await;
        svc.active.set(svc.active.get() - 1);
        conn.wake_flusher();
    }
}

async fn dispatch(svc: &Rc<Service>, request: Request, conn: ConnRef) {
    let handler = svc.table.borrow().find(request.opcode);
    match handler {
        Handler::Block(f) => {
            let result = f(request.clone(), conn.clone()).await;
            if conn.is_closed() {
                return;
            }
            let mut out = conn.out.borrow_mut();
            match result {
                Ok(body) => frame::reply(&mut out, &request, codes::OK, &body),
                Err(e) => frame::reply(&mut out, &request, e.code, e.message.as_bytes()),
            }
        }
        Handler::Stream(f) => {
            let mark = conn.out.borrow().mark();
            let result = f(request.clone(), conn.clone()).await;
            if conn.is_closed() {
                return;
            }
            if let Err(e) = result {
                let mut out = conn.out.borrow_mut();
                out.rewind(mark);
                frame::reply(&mut out, &request, e.code, e.message.as_bytes());
            }
        }
    }
}

/// Minimal protocol client for peers and tests: sequential request/reply
/// with sync matching.
pub struct Client {
    stream: tokio::net::TcpStream,
    rbuf: crate::cursor::ByteCursor,
    next_sync: u32,
}

impl Client {
    /// Connect to a service.
    pub async fn connect(addr: &str) -> std::io::Result<Client> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Client {
            stream,
            rbuf: crate::cursor::ByteCursor::new(),
            next_sync: 1,
        })
    }

    /// Issue one request and await its reply.
    pub async fn call(&mut self, opcode: u32, data: &[u8]) -> crate::error::Result<frame::Reply> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let sync = self.next_sync;
        self.next_sync = self.next_sync.wrapping_add(1);
        self.stream
            .write_all(&frame::encode_request(opcode, sync, data))
            .await?;

        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(reply) = frame::parse_reply(&mut self.rbuf)? {
                if reply.sync == sync {
                    return Ok(reply);
                }
                continue;
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(crate::error::NetError::Closed);
            }
            self.rbuf.append(&buf[..n]);
        }
    }

    /// Surrender the transport, e.g. to switch to a streamed protocol
    /// after a handshake reply. Unconsumed buffered bytes come along.
    pub fn into_parts(self) -> (tokio::net::TcpStream, crate::cursor::ByteCursor) {
        (self.stream, self.rbuf)
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> crate::error::Result<()> {
        let reply = self.call(MSG_PING, &[]).await?;
        if codes::is_error(reply.ret_code) {
            return Err(crate::error::NetError::Remote {
                code: reply.ret_code,
                message: String::from_utf8_lossy(&reply.data).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn echo_service() -> Rc<Service> {
        let svc = Service::new("echo-test", 2);
        svc.register_block(0x20, |req, _conn| {
            Box::pin(async move { Ok(req.data.clone()) })
        });
        svc.register_stream(0x21, |req, conn| {
            Box::pin(async move {
                let mut out = conn.out.borrow_mut();
                let handle = frame::reply_start(&mut out, &req, codes::OK);
                out.add_owned(req.data.clone());
                out.add_owned(req.data);
                frame::reply_fixup(&mut out, handle);
                Ok(())
            })
        });
        svc.register_block(0x22, |_req, _conn| {
            Box::pin(async move { Err(ReplyError::new(codes::NOT_FOUND, "nope")) })
        });
        svc
    }

    async fn serve_echo() -> (Rc<Service>, String) {
        let svc = echo_service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::task::spawn_local(svc.clone().serve(listener));
        (svc, addr)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn block_handler_roundtrip() {
        LocalSet::new()
            .run_until(async {
                let (svc, addr) = serve_echo().await;
                let mut client = Client::connect(&addr).await.unwrap();
                let reply = client.call(0x20, b"payload").await.unwrap();
                assert_eq!(reply.ret_code, codes::OK);
                assert_eq!(reply.data, b"payload");
                svc.shutdown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stream_handler_doubles_payload() {
        LocalSet::new()
            .run_until(async {
                let (svc, addr) = serve_echo().await;
                let mut client = Client::connect(&addr).await.unwrap();
                let reply = client.call(0x21, b"ab").await.unwrap();
                assert_eq!(reply.data, b"abab");
                svc.shutdown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_error_becomes_error_reply() {
        LocalSet::new()
            .run_until(async {
                let (svc, addr) = serve_echo().await;
                let mut client = Client::connect(&addr).await.unwrap();
                let reply = client.call(0x22, &[]).await.unwrap();
                assert_eq!(reply.ret_code, codes::NOT_FOUND);
                assert_eq!(reply.data, b"nope");
                svc.shutdown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_opcode_hits_default_handler() {
        LocalSet::new()
            .run_until(async {
                let (svc, addr) = serve_echo().await;
                let mut client = Client::connect(&addr).await.unwrap();
                let reply = client.call(0xabcd, &[]).await.unwrap();
                assert_eq!(reply.ret_code, codes::UNKNOWN_OPCODE);
                svc.shutdown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ping_is_preregistered() {
        LocalSet::new()
            .run_until(async {
                let (svc, addr) = serve_echo().await;
                let mut client = Client::connect(&addr).await.unwrap();
                client.ping().await.unwrap();
                svc.shutdown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pipelined_requests_reply_in_order() {
        LocalSet::new()
            .run_until(async {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let (svc, addr) = serve_echo().await;
                let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();

                let mut batch = Vec::new();
                for sync in 0..10u32 {
                    batch.extend_from_slice(&frame::encode_request(
                        0x20,
                        sync,
                        &sync.to_le_bytes(),
                    ));
                }
                stream.write_all(&batch).await.unwrap();

                let mut cursor = crate::cursor::ByteCursor::new();
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                while seen.len() < 10 {
                    if let Some(reply) = frame::parse_reply(&mut cursor).unwrap() {
                        seen.push(reply.sync);
                        continue;
                    }
                    let n = stream.read(&mut buf).await.unwrap();
                    assert_ne!(n, 0);
                    cursor.append(&buf[..n]);
                }
                assert_eq!(seen, (0..10).collect::<Vec<_>>());
                svc.shutdown();
            })
            .await;
    }
}

//! Connection objects and their I/O tasks.
//!
//! Each connection owns a read cursor, an output queue and two
//! cooperative tasks: a reader that appends socket bytes and queues the
//! connection for dispatch when a complete frame is buffered, and a
//! flusher that drains the output queue with vectored writes. All tasks
//! run on the single-threaded runtime; the only suspension points are
//! socket readiness, the flush wakeup and the close signal.
//!
//! Closing is cooperative: [`Connection::close`] flips the state, wakes
//! both tasks and releases the output queue; the memory itself lives
//! until the last `Rc` drops, so an in-flight worker observes a closed
//! connection rather than a dangling one.

use std::cell::{Cell, RefCell};
use std::future::poll_fn;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::cursor::ByteCursor;
use crate::netmsg::MsgQueue;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Torn down; tasks unwind and the queue is released
    Closed,
    /// Socket accepted or dialing, tasks not yet attached
    InConnect,
    /// Serving traffic
    Connected,
}

/// Shared handle to a connection.
pub type ConnRef = Rc<Connection>;

/// One client connection.
pub struct Connection {
    peer: String,
    state: Cell<ConnState>,
    /// Buffered inbound bytes awaiting frame parse
    pub rbuf: RefCell<ByteCursor>,
    /// Staged outbound bytes awaiting flush
    pub out: RefCell<MsgQueue>,
    flush_wake: Notify,
    close_tx: watch::Sender<bool>,
    /// True while sitting in the service processing queue
    pub(crate) queued: Cell<bool>,
}

impl Connection {
    /// Create a connection handle for an accepted or dialing socket.
    pub fn new(peer: String) -> ConnRef {
        let (close_tx, _) = watch::channel(false);
        Rc::new(Connection {
            peer,
            state: Cell::new(ConnState::InConnect),
            rbuf: RefCell::new(ByteCursor::new()),
            out: RefCell::new(MsgQueue::new()),
            flush_wake: Notify::new(),
            close_tx,
            queued: Cell::new(false),
        })
    }

    /// Peer address, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    /// Mark the connection serving.
    pub fn set_connected(&self) {
        self.state.set(ConnState::Connected);
    }

    /// True once [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.get() == ConnState::Closed
    }

    /// Tear the connection down: flip the state, wake the reader and
    /// flusher, release the staged output.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!(peer = %self.peer, "closing connection");
        self.state.set(ConnState::Closed);
        *self.out.borrow_mut() = MsgQueue::new();
        let _ = self.close_tx.send(true);
        self.flush_wake.notify_one();
    }

    /// Wake the flusher after staging reply bytes.
    pub fn wake_flusher(&self) {
        self.flush_wake.notify_one();
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Read socket bytes into the connection's cursor until close or EOF.
///
/// `on_frames` runs after every append that leaves at least one complete
/// frame buffered; the service uses it to queue the connection for
/// dispatch.
pub async fn reader_task<R, F>(conn: ConnRef, mut rd: R, on_frames: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&ConnRef),
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = tokio::select! {
            biased;
            _ = conn.closed() => break,
            r = read_some(&mut rd, &mut buf) => match r {
                Ok(0) => {
                    trace!(peer = %conn.peer(), "peer closed");
                    conn.close();
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %conn.peer(), error = %e, "read failed");
                    conn.close();
                    break;
                }
            },
        };

        conn.rbuf.borrow_mut().append(&buf[..n]);
        if crate::frame::has_complete_frame(&conn.rbuf.borrow()) {
            on_frames(&conn);
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(rd: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut *rd).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Drain the output queue with vectored writes until the connection
/// closes. Partial writes consume what was sent and retry; an idle queue
/// suspends until [`Connection::wake_flusher`].
pub async fn flusher_task<W>(conn: ConnRef, mut wr: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        if conn.is_closed() {
            break;
        }

        // borrow the queue only inside the poll so a worker staging bytes
        // while this task is suspended never trips the RefCell
        let wrote = poll_fn(|cx| {
            let out = conn.out.borrow();
            if out.is_empty() {
                return Poll::Ready(Ok(None));
            }
            let slices = out.slices();
            match Pin::new(&mut wr).poll_write_vectored(cx, &slices) {
                Poll::Ready(Ok(n)) => Poll::Ready(Ok(Some(n))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await;

        match wrote {
            Ok(Some(0)) | Err(_) => {
                conn.close();
                break;
            }
            Ok(Some(n)) => {
                conn.out.borrow_mut().consume(n);
            }
            Ok(None) => {
                tokio::select! {
                    biased;
                    _ = conn.closed() => break,
                    _ = conn.flush_wake.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn state_machine() {
        let conn = Connection::new("test".into());
        assert_eq!(conn.state(), ConnState::InConnect);
        conn.set_connected();
        assert_eq!(conn.state(), ConnState::Connected);
        conn.close();
        assert!(conn.is_closed());
        // idempotent
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn close_releases_staged_output() {
        let conn = Connection::new("test".into());
        conn.out.borrow_mut().add_owned(b"staged".to_vec());
        conn.close();
        assert!(conn.out.borrow().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn flusher_writes_staged_bytes() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client, server) = tokio::io::duplex(1024);
                let conn = Connection::new("test".into());
                conn.set_connected();
                conn.out.borrow_mut().add_owned(b"hello".to_vec());
                conn.wake_flusher();

                let flush_conn = conn.clone();
                tokio::task::spawn_local(flusher_task(flush_conn, server));

                let mut buf = [0u8; 5];
                let mut client = client;
                tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf)
                    .await
                    .unwrap();
                assert_eq!(&buf, b"hello");
                conn.close();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reader_signals_complete_frames() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (mut client, server) = tokio::io::duplex(1024);
                let conn = Connection::new("test".into());
                conn.set_connected();

                let seen = Rc::new(Cell::new(0u32));
                let seen2 = seen.clone();
                let reader_conn = conn.clone();
                tokio::task::spawn_local(reader_task(reader_conn, server, move |_c| {
                    seen2.set(seen2.get() + 1);
                }));

                let frame = crate::frame::encode_request(1, 7, b"abc");
                // dribble the frame in two writes; only the completing
                // write should signal
                client.write_all(&frame[..6]).await.unwrap();
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;
                assert_eq!(seen.get(), 0);
                client.write_all(&frame[6..]).await.unwrap();
                for _ in 0..8 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(seen.get(), 1);
                conn.close();
            })
            .await;
    }
}

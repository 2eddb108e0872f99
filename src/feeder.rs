//! Replication feeder: the server side of the `replica` opcode.
//!
//! A follower's handshake names the SCN it already holds; the feeder
//! acknowledges, then turns the connection into a one-way row stream —
//! every scn-changing row past that point, read from the local WAL
//! directory in follow mode so live commits flow out as they land. The
//! connection's output queue and flusher do the pacing; the stream task
//! simply stops when the peer goes away.

use std::rc::Rc;

use tracing::{debug, info, warn};

use tidelog_core::Scn;
use tidelog_durability::puller::{decode_handshake, FILTER_ID};
use tidelog_durability::FollowReader;
use tidelog_net::conn::ConnRef;
use tidelog_net::frame;
use tidelog_net::{codes, ReplyError, Service, MSG_REPLICA};

use crate::node::NodeState;

/// Register the feeder handler on a service.
pub fn register(service: &Service, state: Rc<NodeState>) {
    service.register_stream(MSG_REPLICA, move |req, conn| {
        let state = state.clone();
        Box::pin(async move {
            let handshake = decode_handshake(&req.data)
                .map_err(|e| ReplyError::new(codes::ILLEGAL_PARAMS, e.to_string()))?;
            if handshake.filter.name != FILTER_ID {
                // named filters are accepted and recorded; only the
                // pass-through filter changes nothing
                warn!(
                    filter = %handshake.filter.name,
                    "unknown replication filter, streaming unfiltered"
                );
            }
            info!(
                peer = %conn.peer(),
                scn = handshake.scn.0,
                "replica attached"
            );

            // acknowledge, then hand the connection to the stream task
            {
                let mut out = conn.out.borrow_mut();
                frame::reply(&mut out, &req, codes::OK, &[]);
            }
            conn.wake_flusher();

            tokio::task::spawn_local(stream_rows(state, conn, handshake.scn));
            Ok(())
        })
    });
}

/// Stream every scn-changing row past `after` to the peer, following the
/// live WAL until the connection closes.
async fn stream_rows(state: Rc<NodeState>, conn: ConnRef, after: Scn) {
    // the WAL directory may be empty on a fresh primary; wait for the
    // first file rather than failing the replica
    let mut follow = loop {
        if conn.is_closed() {
            return;
        }
        match FollowReader::open(state.wal_dir(), tidelog_core::Lsn::ZERO) {
            Ok(follow) => break follow,
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    };

    loop {
        let row = tokio::select! {
            biased;
            _ = conn.closed() => break,
            r = follow.next_row() => r,
        };
        match row {
            Ok(row) => {
                if !row.tag.changes_scn() || row.scn <= after {
                    continue;
                }
                {
                    let mut out = conn.out.borrow_mut();
                    out.add_owned(row.encode());
                }
                conn.wake_flusher();
            }
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "feeder stream failed");
                conn.close();
                break;
            }
        }
    }
    debug!(peer = %conn.peer(), "replica detached");
}

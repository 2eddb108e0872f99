//! Request/response framing.
//!
//! Requests are `{opcode:u32, data_len:u32, sync:u32}` little-endian
//! headers followed by `data_len` body bytes; replies carry the same
//! header plus a `ret_code:u32` ahead of the body. `sync` is an opaque
//! client token echoed unchanged.
//!
//! Replies are built in place on the output queue: [`reply_start`] emits a
//! header that claims only the retcode, the handler appends body bytes,
//! and [`reply_fixup`] patches `data_len` to cover them. [`reply_error`]
//! rewinds whatever the handler managed to stage and emits the error
//! header with a UTF-8 message.

use byteorder::{ByteOrder, LittleEndian};

use crate::cursor::ByteCursor;
use crate::error::{codes, NetError};
use crate::netmsg::{Mark, MsgQueue, PatchPoint};

/// Reserved opcode: liveness probe.
pub const MSG_PING: u32 = 0xff00;

/// Reserved opcode: replication handshake.
pub const MSG_REPLICA: u32 = 0xff01;

/// Request header size on the wire.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Reply header size on the wire (header plus retcode).
pub const REPLY_HEADER_SIZE: usize = 16;

/// Largest body accepted from a peer.
pub const FRAME_MAX_BODY: usize = 16 * 1024 * 1024;

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Dispatch code
    pub opcode: u32,
    /// Client token, echoed in the reply
    pub sync: u32,
    /// Request body
    pub data: Vec<u8>,
}

/// Parse one request from the cursor, consuming its bytes.
///
/// Returns `Ok(None)` until a complete frame is buffered.
pub fn parse(cursor: &mut ByteCursor) -> Result<Option<Request>, NetError> {
    let Some(opcode) = cursor.peek_u32(0) else {
        return Ok(None);
    };
    let data_len = cursor.peek_u32(4).unwrap_or(0) as usize;
    if cursor.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    if data_len > FRAME_MAX_BODY {
        return Err(NetError::FrameTooLarge {
            got: data_len,
            limit: FRAME_MAX_BODY,
        });
    }
    if cursor.len() < FRAME_HEADER_SIZE + data_len {
        return Ok(None);
    }

    let sync = cursor.peek_u32(8).expect("header is buffered");
    let data = cursor.as_slice()[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + data_len].to_vec();
    cursor.ltrim(FRAME_HEADER_SIZE + data_len);
    Ok(Some(Request { opcode, sync, data }))
}

/// True when more complete frames are buffered.
pub fn has_complete_frame(cursor: &ByteCursor) -> bool {
    match cursor.peek_u32(4) {
        Some(data_len) => cursor.len() >= FRAME_HEADER_SIZE + data_len as usize,
        None => false,
    }
}

/// Encode a request for the client side of the protocol.
pub fn encode_request(opcode: u32, sync: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; FRAME_HEADER_SIZE + data.len()];
    LittleEndian::write_u32(&mut buf[0..4], opcode);
    LittleEndian::write_u32(&mut buf[4..8], data.len() as u32);
    LittleEndian::write_u32(&mut buf[8..12], sync);
    buf[FRAME_HEADER_SIZE..].copy_from_slice(data);
    buf
}

/// Handle to an open reply whose length is patched on completion.
#[derive(Debug, Clone, Copy)]
pub struct ReplyHandle {
    mark: Mark,
    len_patch: PatchPoint,
}

/// Begin a reply: emit a header claiming only the retcode and return the
/// handle used to account for body bytes.
pub fn reply_start(out: &mut MsgQueue, request: &Request, ret_code: u32) -> ReplyHandle {
    let mark = out.mark();
    let mut header = vec![0u8; REPLY_HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], request.opcode);
    LittleEndian::write_u32(&mut header[4..8], 4);
    LittleEndian::write_u32(&mut header[8..12], request.sync);
    LittleEndian::write_u32(&mut header[12..16], ret_code);
    let len_patch = out.add_patchable(header, 4);
    ReplyHandle { mark, len_patch }
}

/// Close a reply: patch `data_len` to cover the retcode and everything
/// appended since [`reply_start`].
pub fn reply_fixup(out: &mut MsgQueue, handle: ReplyHandle) {
    let body = out.bytes_since(handle.mark) - REPLY_HEADER_SIZE;
    out.patch_u32(handle.len_patch, (4 + body) as u32);
}

/// Emit a one-shot reply with a complete body.
pub fn reply(out: &mut MsgQueue, request: &Request, ret_code: u32, body: &[u8]) {
    let handle = reply_start(out, request, ret_code);
    out.add_owned(body.to_vec());
    reply_fixup(out, handle);
}

/// Discard a partially built reply and emit an error with a UTF-8
/// message instead.
pub fn reply_error(out: &mut MsgQueue, handle: ReplyHandle, request: &Request, code: u32, msg: &str) {
    debug_assert!(codes::is_error(code));
    out.rewind(handle.mark);
    reply(out, request, code, msg.as_bytes());
}

/// A parsed reply, for protocol clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Opcode echoed from the request
    pub opcode: u32,
    /// Client token echoed from the request
    pub sync: u32,
    /// Status code
    pub ret_code: u32,
    /// Reply body
    pub data: Vec<u8>,
}

/// Parse one reply from the cursor, consuming its bytes.
pub fn parse_reply(cursor: &mut ByteCursor) -> Result<Option<Reply>, NetError> {
    let Some(opcode) = cursor.peek_u32(0) else {
        return Ok(None);
    };
    let Some(data_len) = cursor.peek_u32(4) else {
        return Ok(None);
    };
    let data_len = data_len as usize;
    if data_len < 4 {
        return Err(NetError::Remote {
            code: codes::ILLEGAL_PARAMS,
            message: "reply shorter than its retcode".into(),
        });
    }
    if cursor.len() < FRAME_HEADER_SIZE + data_len {
        return Ok(None);
    }
    let sync = cursor.peek_u32(8).expect("header is buffered");
    let ret_code = cursor.peek_u32(12).expect("retcode is buffered");
    let data = cursor.as_slice()[REPLY_HEADER_SIZE..FRAME_HEADER_SIZE + data_len].to_vec();
    cursor.ltrim(FRAME_HEADER_SIZE + data_len);
    Ok(Some(Reply {
        opcode,
        sync,
        ret_code,
        data,
    }))
}

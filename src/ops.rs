//! Application opcodes: insert, select, delete.
//!
//! Handlers follow the transaction discipline of the engine: prepare
//! (decode and conflict-check, no mutation), suspend on the WAL submit,
//! apply to the indexes in LSN order, reply. Prepare and apply each run
//! without yielding, so only the WAL wait interleaves with other tasks.

use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use tidelog_core::{Row, ShardId, Tag, TagKind, Tuple, TupleRef};
use tidelog_index::IndexError;
use tidelog_net::frame;
use tidelog_net::{codes, ReplyError, Service};

use crate::node::NodeState;
use crate::space::{encode_delete, encode_insert};

/// Insert-or-replace a tuple.
pub const OP_INSERT: u32 = 13;
/// Look up tuples by key pattern.
pub const OP_SELECT: u32 = 17;
/// Delete by primary key.
pub const OP_DELETE: u32 = 21;

/// Echo the stored tuple in the write reply.
pub const FLAG_RETURN_TUPLE: u32 = 0x01;
/// Fail with `duplicate` when the primary key already exists.
pub const FLAG_ADD: u32 = 0x02;
/// Fail with `not found` when the primary key does not exist.
pub const FLAG_REPLACE: u32 = 0x04;

struct WriteHeader {
    shard_id: ShardId,
    flags: u32,
}

fn parse_write_header(data: &[u8]) -> Result<(WriteHeader, &[u8]), ReplyError> {
    if data.len() < 8 {
        return Err(ReplyError::new(
            codes::ILLEGAL_PARAMS,
            "request body shorter than its header",
        ));
    }
    let shard = LittleEndian::read_u32(&data[0..4]);
    if shard > u16::MAX as u32 {
        return Err(ReplyError::new(codes::ILLEGAL_PARAMS, "shard id out of range"));
    }
    Ok((
        WriteHeader {
            shard_id: ShardId(shard as u16),
            flags: LittleEndian::read_u32(&data[4..8]),
        },
        &data[8..],
    ))
}

fn violation_to_reply(err: IndexError) -> ReplyError {
    match err {
        IndexError::Violation { index } => ReplyError::new(
            codes::INDEX_VIOLATION,
            format!("duplicate key in unique index {}", index),
        ),
        other => ReplyError::new(codes::ILLEGAL_PARAMS, other.to_string()),
    }
}

/// Encode the write-reply body: affected count plus, on request, the
/// stored tuple.
fn write_reply(count: u32, tuple: Option<&TupleRef>) -> Vec<u8> {
    let mut body = count.to_le_bytes().to_vec();
    if let Some(tuple) = tuple {
        body.extend_from_slice(tuple.as_bytes());
    }
    body
}

async fn do_insert(state: Rc<NodeState>, data: Vec<u8>) -> Result<Vec<u8>, ReplyError> {
    let (header, body) = parse_write_header(&data)?;
    state.check_writable(header.shard_id)?;

    let (tuple, _) = Tuple::decode(body)
        .map_err(|e| ReplyError::new(codes::ILLEGAL_PARAMS, e.to_string()))?;
    let tuple: TupleRef = Rc::new(tuple);

    // prepare: conflict-check against every unique index, no mutation
    let scn = {
        let mut shards = state.shards.borrow_mut();
        let shard = shards
            .get_mut(header.shard_id)
            .ok_or_else(|| ReplyError::new(codes::ILLEGAL_PARAMS, "no such shard"))?;
        let displaced = shard
            .space()
            .prepare_replace(&tuple)
            .map_err(violation_to_reply)?;
        if header.flags & FLAG_ADD != 0 && displaced.is_some() {
            return Err(ReplyError::new(codes::DUPLICATE, "tuple already exists"));
        }
        if header.flags & FLAG_REPLACE != 0 && displaced.is_none() {
            return Err(ReplyError::new(codes::NOT_FOUND, "no tuple to replace"));
        }
        shard.reserve_scn()
    };

    let mut row = Row::new(Tag::wal(TagKind::WalData), header.shard_id, encode_insert(&tuple));
    row.scn = scn;

    // the only suspension point of a write: wait for group commit
    let (row, run_crc) = state.wal_commit(row, header.shard_id).await?;
    state.apply_committed(&row, run_crc).await?;

    let echo = (header.flags & FLAG_RETURN_TUPLE != 0).then_some(&tuple);
    Ok(write_reply(1, echo))
}

async fn do_delete(state: Rc<NodeState>, data: Vec<u8>) -> Result<Vec<u8>, ReplyError> {
    let (header, pattern) = parse_write_header(&data)?;
    state.check_writable(header.shard_id)?;

    let (scn, victim) = {
        let mut shards = state.shards.borrow_mut();
        let shard = shards
            .get_mut(header.shard_id)
            .ok_or_else(|| ReplyError::new(codes::ILLEGAL_PARAMS, "no such shard"))?;
        let victim = shard
            .space()
            .find(tidelog_index::PRIMARY, pattern)
            .map_err(|e| ReplyError::new(codes::ILLEGAL_PARAMS, e.to_string()))?;
        match victim {
            Some(victim) => (shard.reserve_scn(), victim),
            // deleting nothing writes nothing
            None => return Ok(write_reply(0, None)),
        }
    };

    let mut row = Row::new(
        Tag::wal(TagKind::WalData),
        header.shard_id,
        encode_delete(pattern),
    );
    row.scn = scn;

    let (row, run_crc) = state.wal_commit(row, header.shard_id).await?;
    state.apply_committed(&row, run_crc).await?;

    debug!(shard = header.shard_id.0, "tuple deleted");
    let echo = (header.flags & FLAG_RETURN_TUPLE != 0).then_some(&victim);
    Ok(write_reply(1, echo))
}

/// Register the application opcodes on a service.
pub fn register(service: &Service, state: Rc<NodeState>) {
    let insert_state = state.clone();
    service.register_block(OP_INSERT, move |req, _conn| {
        let state = insert_state.clone();
        Box::pin(do_insert(state, req.data))
    });

    let delete_state = state.clone();
    service.register_block(OP_DELETE, move |req, _conn| {
        let state = delete_state.clone();
        Box::pin(do_delete(state, req.data))
    });

    // select streams tuples straight out of the indexes: the reply
    // segments hold tuple references, not copies, released once flushed
    let select_state = state;
    service.register_stream(OP_SELECT, move |req, conn| {
        let state = select_state.clone();
        Box::pin(async move {
            let data = &req.data;
            if data.len() < 16 {
                return Err(ReplyError::new(codes::ILLEGAL_PARAMS, "short select body"));
            }
            let shard = LittleEndian::read_u32(&data[0..4]);
            let index = LittleEndian::read_u32(&data[4..8]) as usize;
            let offset = LittleEndian::read_u32(&data[8..12]) as usize;
            let limit = LittleEndian::read_u32(&data[12..16]) as usize;
            let pattern = &data[16..];
            if shard > u16::MAX as u32 {
                return Err(ReplyError::new(codes::ILLEGAL_PARAMS, "shard id out of range"));
            }

            let shards = state.shards.borrow();
            let shard = shards
                .get(ShardId(shard as u16))
                .ok_or_else(|| ReplyError::new(codes::ILLEGAL_PARAMS, "no such shard"))?;
            let tuples = shard
                .space()
                .find_all(index, pattern)
                .map_err(|e| ReplyError::new(codes::ILLEGAL_PARAMS, e.to_string()))?;

            let limit = if limit == 0 { usize::MAX } else { limit };
            let selected: Vec<TupleRef> = tuples.into_iter().skip(offset).take(limit).collect();
            if selected.is_empty() {
                return Err(ReplyError::new(codes::NOT_FOUND, "no tuples match"));
            }

            let mut out = conn.out.borrow_mut();
            let handle = frame::reply_start(&mut out, &req, codes::OK);
            out.add_owned((selected.len() as u32).to_le_bytes().to_vec());
            for tuple in &selected {
                out.add_tuple(tuple, 0, tuple.encoded_len());
            }
            frame::reply_fixup(&mut out, handle);
            Ok(())
        })
    });
}

/// Encode an insert request body.
pub fn encode_insert_req(shard: u32, flags: u32, tuple: &Tuple) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + tuple.encoded_len());
    buf.extend_from_slice(&shard.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(tuple.as_bytes());
    buf
}

/// Encode a select request body.
pub fn encode_select_req(shard: u32, index: u32, offset: u32, limit: u32, pattern: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + pattern.len());
    buf.extend_from_slice(&shard.to_le_bytes());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&limit.to_le_bytes());
    buf.extend_from_slice(pattern);
    buf
}

/// Encode a delete request body.
pub fn encode_delete_req(shard: u32, flags: u32, pattern: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + pattern.len());
    buf.extend_from_slice(&shard.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(pattern);
    buf
}

//! End-to-end service scenarios against a live node on a loopback socket.

use tempfile::tempdir;
use tidelog::ops::{
    encode_delete_req, encode_insert_req, encode_select_req, FLAG_ADD, FLAG_RETURN_TUPLE,
};
use tidelog::space::encode_pattern;
use tidelog::{KeyDef, Node, NodeConfig, Tuple, OP_DELETE, OP_INSERT, OP_SELECT};
use tidelog_net::{codes, Client};
use tokio::task::LocalSet;

fn two_index_config(dir: &std::path::Path) -> NodeConfig {
    NodeConfig::new(dir).with_space(vec![KeyDef::u32(0), KeyDef::bytes(1)])
}

fn user_tuple(id: u32, name: &str) -> Tuple {
    Tuple::from_fields(0, [id.to_le_bytes().as_slice(), name.as_bytes()])
}

fn id_pattern(id: u32) -> Vec<u8> {
    encode_pattern(&[&id.to_le_bytes()])
}

fn decode_tuples(body: &[u8]) -> Vec<Tuple> {
    let count = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
    let mut tuples = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let (tuple, consumed) = Tuple::decode(&body[pos..]).unwrap();
        tuples.push(tuple);
        pos += consumed;
    }
    assert_eq!(pos, body.len());
    tuples
}

#[tokio::test(flavor = "current_thread")]
async fn insert_read_delete_cycle() {
    let dir = tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let node = Node::start(two_index_config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();

            // insert {id=1, name="a"}
            let reply = client
                .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(1, "a")))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            assert_eq!(&reply.data[0..4], &1u32.to_le_bytes());

            // read it back
            let reply = client
                .call(OP_SELECT, &encode_select_req(0, 0, 0, 0, &id_pattern(1)))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            let tuples = decode_tuples(&reply.data);
            assert_eq!(tuples.len(), 1);
            assert_eq!(tuples[0].field_u32(0).unwrap(), 1);
            assert_eq!(tuples[0].field(1).unwrap(), b"a");

            // delete and read again: not found
            let reply = client
                .call(OP_DELETE, &encode_delete_req(0, 0, &id_pattern(1)))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            assert_eq!(&reply.data[0..4], &1u32.to_le_bytes());

            let reply = client
                .call(OP_SELECT, &encode_select_req(0, 0, 0, 0, &id_pattern(1)))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::NOT_FOUND);

            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn unique_secondary_violation() {
    let dir = tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let node = Node::start(two_index_config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();

            let reply = client
                .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(1, "a")))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);

            // same name under a different id: the unique secondary
            // refuses before any index is touched
            let reply = client
                .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(2, "a")))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::INDEX_VIOLATION);

            // both indexes still hold exactly one tuple
            let state = node.state();
            let shards = state.shards.borrow();
            let space = shards.get(tidelog::ShardId(0)).unwrap().space();
            assert_eq!(space.indexes().primary().size(), 1);
            assert_eq!(space.indexes().index(1).unwrap().size(), 1);
            assert!(space.indexes().check_consistent());
            drop(shards);

            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn strict_add_reports_duplicate() {
    let dir = tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let node = Node::start(two_index_config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();

            client
                .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(1, "a")))
                .await
                .unwrap();
            let reply = client
                .call(
                    OP_INSERT,
                    &encode_insert_req(0, FLAG_ADD, &user_tuple(1, "b")),
                )
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::DUPLICATE);

            // plain insert-or-replace still succeeds and echoes on request
            let reply = client
                .call(
                    OP_INSERT,
                    &encode_insert_req(0, FLAG_RETURN_TUPLE, &user_tuple(1, "b")),
                )
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            let stored = decode_tuples(&reply.data);
            assert_eq!(stored[0].field(1).unwrap(), b"b");

            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn frame_split_across_tcp_segments() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let node = Node::start(two_index_config(dir.path())).await.unwrap();
            let mut stream = tokio::net::TcpStream::connect(node.addr()).await.unwrap();
            stream.set_nodelay(true).unwrap();

            let body = encode_insert_req(0, 0, &user_tuple(7, "split"));
            let frame = tidelog_net::frame::encode_request(OP_INSERT, 0xfeed, &body);

            // header, half the body, then the rest
            let (header, rest) = frame.split_at(12);
            let (first_half, second_half) = rest.split_at(rest.len() / 2);
            for chunk in [header, first_half, second_half] {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }

            // exactly one reply, with the sync echoed
            let mut cursor = tidelog_net::ByteCursor::new();
            let mut buf = [0u8; 4096];
            let reply = loop {
                if let Some(reply) = tidelog_net::frame::parse_reply(&mut cursor).unwrap() {
                    break reply;
                }
                let n = stream.read(&mut buf).await.unwrap();
                assert_ne!(n, 0);
                cursor.append(&buf[..n]);
            };
            assert_eq!(reply.sync, 0xfeed);
            assert_eq!(reply.ret_code, codes::OK);
            assert!(cursor.is_empty(), "exactly one reply expected");

            // the handler ran exactly once
            assert_eq!(node.lsn(), tidelog::Lsn(1));

            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn ping_and_unknown_opcode() {
    let dir = tempdir().unwrap();
    LocalSet::new()
        .run_until(async {
            let node = Node::start(two_index_config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();

            client.ping().await.unwrap();

            let reply = client.call(0x5151, &[]).await.unwrap();
            assert!(codes::is_error(reply.ret_code));

            // the connection survives the unknown opcode
            client.ping().await.unwrap();

            node.shutdown().await.unwrap();
        })
        .await;
}

//! Crash-recovery scenarios: WAL-only restart, then snapshot plus tail.

use tempfile::tempdir;
use tidelog::ops::{encode_insert_req, encode_select_req};
use tidelog::space::encode_pattern;
use tidelog::{KeyDef, Lsn, Node, NodeConfig, ShardId, Tuple, OP_INSERT, OP_SELECT};
use tidelog_net::{codes, Client};
use tokio::task::LocalSet;

const ROWS: u32 = 1000;

fn config(dir: &std::path::Path) -> NodeConfig {
    NodeConfig::new(dir)
        .with_space(vec![KeyDef::u32(0)])
        .with_rows_per_file(64)
}

fn user_tuple(id: u32) -> Tuple {
    let value = format!("value-{}", id);
    Tuple::from_fields(0, [id.to_le_bytes().as_slice(), value.as_bytes()])
}

async fn insert_range(client: &mut Client, from: u32, to: u32) {
    for id in from..=to {
        let reply = client
            .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(id)))
            .await
            .unwrap();
        assert_eq!(reply.ret_code, codes::OK, "insert {} failed", id);
    }
}

async fn read_value(client: &mut Client, id: u32) -> Option<Vec<u8>> {
    let pattern = encode_pattern(&[&id.to_le_bytes()]);
    let reply = client
        .call(OP_SELECT, &encode_select_req(0, 0, 0, 0, &pattern))
        .await
        .unwrap();
    if reply.ret_code == codes::NOT_FOUND {
        return None;
    }
    assert_eq!(reply.ret_code, codes::OK);
    let (tuple, _) = Tuple::decode(&reply.data[4..]).unwrap();
    Some(tuple.field(1).unwrap().to_vec())
}

#[tokio::test(flavor = "current_thread")]
async fn restart_replays_full_wal() {
    let dir = tempdir().unwrap();

    // first life: insert ROWS tuples, no snapshot ever taken
    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();
            insert_range(&mut client, 1, ROWS).await;
            assert_eq!(node.lsn(), Lsn(ROWS as i64));
            node.shutdown().await.unwrap();
        })
        .await;

    // second life: recovery reads zero snapshots and the full WAL
    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            assert_eq!(node.lsn(), Lsn(ROWS as i64));
            assert_eq!(node.state().scn(ShardId(0)), Some(tidelog::Scn(ROWS as i64)));

            let mut client = Client::connect(node.addr()).await.unwrap();
            for id in [1, 2, ROWS / 2, ROWS - 1, ROWS] {
                let value = read_value(&mut client, id).await.unwrap();
                assert_eq!(value, format!("value-{}", id).into_bytes());
            }
            let size = {
                let shards = node.state().shards.borrow();
                shards.get(ShardId(0)).unwrap().space().size()
            };
            assert_eq!(size, ROWS);
            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn snapshot_plus_tail_wal() {
    let dir = tempdir().unwrap();

    // build ROWS tuples, then snapshot, then five more writes
    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();
            insert_range(&mut client, 1, ROWS).await;

            let snap = node.state().snapshot_inline().unwrap();
            assert!(snap.exists());

            insert_range(&mut client, ROWS + 1, ROWS + 5).await;
            assert_eq!(node.lsn(), Lsn(ROWS as i64 + 5));
            node.shutdown().await.unwrap();
        })
        .await;

    // recovery loads the snapshot and replays only the five-row tail
    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            assert_eq!(node.lsn(), Lsn(ROWS as i64 + 5));

            let mut client = Client::connect(node.addr()).await.unwrap();
            for id in [1, ROWS, ROWS + 1, ROWS + 5] {
                let value = read_value(&mut client, id).await.unwrap();
                assert_eq!(value, format!("value-{}", id).into_bytes());
            }
            let size = {
                let shards = node.state().shards.borrow();
                shards.get(ShardId(0)).unwrap().space().size()
            };
            assert_eq!(size, ROWS + 5);

            // and the node keeps writing where it left off
            let reply = client
                .call(
                    OP_INSERT,
                    &encode_insert_req(0, 0, &user_tuple(ROWS + 6)),
                )
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            assert_eq!(node.lsn(), Lsn(ROWS as i64 + 6));
            node.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn fold_writes_snapshot_and_exits() {
    let dir = tempdir().unwrap();

    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            let mut client = Client::connect(node.addr()).await.unwrap();
            insert_range(&mut client, 1, 20).await;
            node.shutdown().await.unwrap();
        })
        .await;

    let snap = Node::fold(config(dir.path())).unwrap();
    assert!(snap.exists());

    // the folded snapshot alone is enough to restart from
    LocalSet::new()
        .run_until(async {
            let node = Node::start(config(dir.path())).await.unwrap();
            assert_eq!(node.lsn(), Lsn(20));
            let mut client = Client::connect(node.addr()).await.unwrap();
            assert!(read_value(&mut client, 20).await.is_some());
            node.shutdown().await.unwrap();
        })
        .await;
}

//! Primary → follower catch-up and live streaming.

use std::time::{Duration, Instant};

use tempfile::tempdir;
use tidelog::ops::{encode_insert_req, encode_select_req};
use tidelog::space::encode_pattern;
use tidelog::{
    FeederParam, KeyDef, Node, NodeConfig, Scn, ShardId, Tuple, OP_INSERT, OP_SELECT,
};
use tidelog_net::{codes, Client};
use tokio::task::LocalSet;

fn primary_config(dir: &std::path::Path) -> NodeConfig {
    NodeConfig::new(dir).with_space(vec![KeyDef::u32(0), KeyDef::bytes(1)])
}

fn follower_config(dir: &std::path::Path, feeder: &str) -> NodeConfig {
    primary_config(dir).with_feeder(FeederParam::new(feeder))
}

fn user_tuple(id: u32) -> Tuple {
    let name = format!("name-{}", id);
    Tuple::from_fields(0, [id.to_le_bytes().as_slice(), name.as_bytes()])
}

async fn insert(client: &mut Client, id: u32) {
    let reply = client
        .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(id)))
        .await
        .unwrap();
    assert_eq!(reply.ret_code, codes::OK, "insert {} failed", id);
}

async fn wait_for_scn(node: &Node, want: Scn, deadline: Duration) {
    let start = Instant::now();
    loop {
        if node.state().scn(ShardId(0)) == Some(want) {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "follower stuck at {:?}, want {:?}",
            node.state().scn(ShardId(0)),
            want
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "current_thread")]
async fn follower_catches_up_and_streams() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();

    LocalSet::new()
        .run_until(async {
            // primary with 100 committed rows
            let a = Node::start(primary_config(a_dir.path())).await.unwrap();
            let mut a_client = Client::connect(a.addr()).await.unwrap();
            for id in 1..=100 {
                insert(&mut a_client, id).await;
            }
            let a_scn = a.state().scn(ShardId(0)).unwrap();
            assert_eq!(a_scn, Scn(100));

            // follower starts empty and pulls everything
            let b = Node::start(follower_config(b_dir.path(), a.addr()))
                .await
                .unwrap();
            wait_for_scn(&b, a_scn, Duration::from_secs(10)).await;

            // follower state matches the primary
            {
                let a_shards = a.state().shards.borrow();
                let b_shards = b.state().shards.borrow();
                let a_space = a_shards.get(ShardId(0)).unwrap().space();
                let b_space = b_shards.get(ShardId(0)).unwrap().space();
                assert_eq!(a_space.size(), b_space.size());
                assert!(b_space.indexes().check_consistent());
            }

            // a fresh write reaches the follower within bounded time
            insert(&mut a_client, 101).await;
            wait_for_scn(&b, Scn(101), Duration::from_secs(10)).await;
            assert_eq!(
                b.state().scn(ShardId(0)),
                a.state().scn(ShardId(0)),
                "follower scn equals primary scn"
            );

            // reads work on the follower; the replicated tuple is there
            let mut b_client = Client::connect(b.addr()).await.unwrap();
            let pattern = encode_pattern(&[&101u32.to_le_bytes()]);
            let reply = b_client
                .call(OP_SELECT, &encode_select_req(0, 0, 0, 0, &pattern))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::OK);
            let (tuple, _) = Tuple::decode(&reply.data[4..]).unwrap();
            assert_eq!(tuple.field(1).unwrap(), b"name-101");

            // and the follower tracks the upstream position for lag
            {
                let b_shards = b.state().shards.borrow();
                assert_eq!(b_shards.get(ShardId(0)).unwrap().remote_scn(), Scn(101));
            }

            b.shutdown().await.unwrap();
            a.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn follower_refuses_writes() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();

    LocalSet::new()
        .run_until(async {
            let a = Node::start(primary_config(a_dir.path())).await.unwrap();
            let mut a_client = Client::connect(a.addr()).await.unwrap();
            insert(&mut a_client, 1).await;

            let b = Node::start(follower_config(b_dir.path(), a.addr()))
                .await
                .unwrap();
            wait_for_scn(&b, Scn(1), Duration::from_secs(10)).await;

            let mut b_client = Client::connect(b.addr()).await.unwrap();
            let reply = b_client
                .call(OP_INSERT, &encode_insert_req(0, 0, &user_tuple(2)))
                .await
                .unwrap();
            assert_eq!(reply.ret_code, codes::NOT_MASTER);

            b.shutdown().await.unwrap();
            a.shutdown().await.unwrap();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn follower_reconnects_after_restart_at_current_scn() {
    let a_dir = tempdir().unwrap();
    let b_dir = tempdir().unwrap();

    LocalSet::new()
        .run_until(async {
            let a = Node::start(primary_config(a_dir.path())).await.unwrap();
            let mut a_client = Client::connect(a.addr()).await.unwrap();
            for id in 1..=10 {
                insert(&mut a_client, id).await;
            }

            // follower syncs, then goes away
            let b = Node::start(follower_config(b_dir.path(), a.addr()))
                .await
                .unwrap();
            wait_for_scn(&b, Scn(10), Duration::from_secs(10)).await;
            b.shutdown().await.unwrap();

            // primary keeps writing while the follower is down
            for id in 11..=15 {
                insert(&mut a_client, id).await;
            }

            // the restarted follower re-handshakes at its recovered scn
            // (zero without a local log) and reapplies the stream; rows
            // at or below its position are dropped idempotently
            let b = Node::start(follower_config(b_dir.path(), a.addr()))
                .await
                .unwrap();
            wait_for_scn(&b, Scn(15), Duration::from_secs(10)).await;
            let size = {
                let shards = b.state().shards.borrow();
                shards.get(ShardId(0)).unwrap().space().size()
            };
            assert_eq!(size, 15);

            b.shutdown().await.unwrap();
            a.shutdown().await.unwrap();
        })
        .await;
}

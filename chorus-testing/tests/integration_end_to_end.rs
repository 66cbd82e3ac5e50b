//! Full-stack tests: a real coordinator and real replica drivers talking
//! over in-process streams.

use chorus_core::storage::SnapshotStore;
use chorus_core::{Epoch, Zxid};
use chorus_kvstore::KvOp;
use chorus_testing::{init_tracing, TestCoordinator, TestReplica, INIT_LIMIT, TICK};

#[tokio::test]
async fn a_three_node_ensemble_replicates_and_watches() {
    init_tracing();
    let cluster = TestCoordinator::new(3);
    let replica_one = TestReplica::new(1);
    let replica_two = TestReplica::new(2);

    let (stream_one, _handler_one) = cluster.accept();
    let (stream_two, _handler_two) = cluster.accept();
    let _run_one = replica_one.run(stream_one);
    let _run_two = replica_two.run(stream_two);

    let epoch = cluster.establish().await.unwrap().unwrap();
    assert_eq!(epoch, Epoch::new(1));
    replica_one.wait_ready().await.unwrap();
    replica_two.wait_ready().await.unwrap();

    let watch_one = {
        let store = replica_one.store.lock().await;
        let (_, rx) = store.watch("color");
        rx
    };
    let watch_two = {
        let store = replica_two.store.lock().await;
        let (_, rx) = store.watch("color");
        rx
    };

    let payload = KvOp::set("color", "red").encode().unwrap();
    let zxid = cluster.coordinator.propose(payload).await.unwrap();
    assert_eq!(zxid, Zxid::new(Epoch::new(1), 1));

    let deadline = TICK * INIT_LIMIT;
    let event_one = tokio::time::timeout(deadline, watch_one).await.unwrap().unwrap();
    let event_two = tokio::time::timeout(deadline, watch_two).await.unwrap().unwrap();
    assert_eq!(event_one.zxid(), zxid);
    assert_eq!(event_two.zxid(), zxid);

    assert_eq!(
        cluster.store.lock().await.get("color").as_deref(),
        Some("red")
    );
    assert_eq!(
        replica_one.store.lock().await.get("color").as_deref(),
        Some("red")
    );
    assert_eq!(
        replica_two.store.lock().await.get("color").as_deref(),
        Some("red")
    );
    assert_eq!(cluster.coordinator.connected_replicas(), 2);
}

#[tokio::test]
async fn a_late_replica_is_brought_up_to_date() {
    init_tracing();
    let cluster = TestCoordinator::new(3);
    let replica_one = TestReplica::new(1);

    let (stream_one, _handler_one) = cluster.accept();
    let _run_one = replica_one.run(stream_one);
    cluster.establish().await.unwrap().unwrap();
    replica_one.wait_ready().await.unwrap();

    for (key, value) in [("a", "1"), ("b", "2")] {
        let payload = KvOp::set(key, value).encode().unwrap();
        let zxid = cluster.coordinator.propose(payload).await.unwrap();
        // Wait out the commit so the late joiner needs real history.
        let deadline = tokio::time::Instant::now() + TICK * INIT_LIMIT;
        while cluster.coordinator.last_committed().await < zxid {
            assert!(tokio::time::Instant::now() < deadline, "commit stalled");
            tokio::time::sleep(TICK).await;
        }
    }

    let replica_two = TestReplica::new(2);
    let (stream_two, _handler_two) = cluster.accept();
    let _run_two = replica_two.run(stream_two);
    replica_two.wait_ready().await.unwrap();

    let store = replica_two.store.lock().await;
    assert_eq!(store.get("a").as_deref(), Some("1"));
    assert_eq!(store.get("b").as_deref(), Some("2"));
    drop(store);

    // History started after the replica's position, so it was caught up by
    // state transfer rather than log replay.
    assert!(replica_two.snapshots.load().await.unwrap().is_some());

    // And it participates in the stream from here on.
    let payload = KvOp::set("c", "3").encode().unwrap();
    let zxid = cluster.coordinator.propose(payload).await.unwrap();
    let deadline = tokio::time::Instant::now() + TICK * INIT_LIMIT;
    loop {
        if replica_two.store.lock().await.get("c").as_deref() == Some("3") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "late replica missed {}", zxid);
        tokio::time::sleep(TICK).await;
    }
}

#[tokio::test]
async fn deletes_replicate_like_writes() {
    init_tracing();
    let cluster = TestCoordinator::new(3);
    let replica = TestReplica::new(1);
    let (stream, _handler) = cluster.accept();
    let _run = replica.run(stream);
    cluster.establish().await.unwrap().unwrap();
    replica.wait_ready().await.unwrap();

    cluster
        .coordinator
        .propose(KvOp::set("doomed", "soon").encode().unwrap())
        .await
        .unwrap();

    let watch = {
        let store = replica.store.lock().await;
        let (_, rx) = store.watch("doomed");
        rx
    };
    // The watch may fire on the set or the delete depending on arrival
    // order; arm it before the delete to pin it to one of the two.
    let zxid = cluster
        .coordinator
        .propose(KvOp::delete("doomed").encode().unwrap())
        .await
        .unwrap();

    let event = tokio::time::timeout(TICK * INIT_LIMIT, watch)
        .await
        .unwrap()
        .unwrap();
    assert!(event.zxid() <= zxid);

    let deadline = tokio::time::Instant::now() + TICK * INIT_LIMIT;
    while replica.store.lock().await.contains_key("doomed") {
        assert!(tokio::time::Instant::now() < deadline, "delete never applied");
        tokio::time::sleep(TICK).await;
    }
}

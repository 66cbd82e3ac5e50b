//! Replica-side tests driving a real driver with a scripted coordinator.

use chorus_core::messages::{SnapshotPayload, PROTOCOL_VERSION};
use chorus_core::storage::{EpochStore, SnapshotStore, StateMachine, TransactionLog};
use chorus_core::{
    ChorusError, Epoch, NodeId, Packet, PacketKind, ReplicaInfo, Transaction, Zxid,
};
use chorus_kvstore::{KvOp, KvStore};
use chorus_testing::{init_tracing, ScriptedPeer, TestReplica};
use tokio::io::duplex;

fn kv_txn(epoch: u32, counter: u32, op: &KvOp) -> Transaction {
    Transaction::new(Zxid::new(Epoch::new(epoch), counter), op.encode().unwrap())
}

async fn connect(replica: &TestReplica) -> (ScriptedPeer, tokio::task::JoinHandle<chorus_core::Result<()>>) {
    let (ours, theirs) = duplex(64 * 1024);
    let task = replica.run(theirs);
    (ScriptedPeer::over(ours), task)
}

/// Walk a fresh replica through establishment up to the up-to-date marker.
async fn establish(peer: &mut ScriptedPeer, epoch: Epoch) {
    let info = peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    let announced: ReplicaInfo = info.decode_payload().unwrap();
    assert_eq!(announced.protocol_version, PROTOCOL_VERSION);

    peer.send(&Packet::epoch_info(epoch).unwrap()).await.unwrap();
    peer.expect(PacketKind::EpochAck).await.unwrap();
    peer.send(&Packet::new_leader(epoch)).await.unwrap();
    let ack = peer.expect(PacketKind::Ack).await.unwrap();
    assert_eq!(ack.zxid, Zxid::new(epoch, 0));
    peer.send(&Packet::up_to_date()).await.unwrap();
}

#[tokio::test]
async fn a_replica_negotiates_synchronizes_and_applies() {
    init_tracing();
    let replica = TestReplica::new(1);
    let (mut peer, _task) = connect(&replica).await;

    let info = peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    assert_eq!(info.zxid.epoch(), Epoch::new(0));

    peer.send(&Packet::epoch_info(Epoch::new(1)).unwrap())
        .await
        .unwrap();
    let ack = peer.expect(PacketKind::EpochAck).await.unwrap();
    let prior: Epoch = ack.decode_payload().unwrap();
    assert_eq!(prior, Epoch::new(0));
    assert_eq!(ack.zxid, Zxid::default());
    // The acknowledgment implies the accepted epoch is already on disk.
    assert_eq!(
        replica.epochs.accepted_epoch().await.unwrap(),
        Epoch::new(1)
    );

    // Committed history from the previous epoch, applied during sync.
    let old = kv_txn(0, 1, &KvOp::set("inherited", "yes"));
    peer.send(&Packet::proposal(&old)).await.unwrap();

    peer.send(&Packet::new_leader(Epoch::new(1))).await.unwrap();
    let leader_ack = peer.expect(PacketKind::Ack).await.unwrap();
    assert_eq!(leader_ack.zxid, Zxid::new(Epoch::new(1), 0));
    // The new-leader acknowledgment implies the current epoch is persisted.
    assert_eq!(
        replica.epochs.current_epoch().await.unwrap(),
        Epoch::new(1)
    );
    peer.send(&Packet::up_to_date()).await.unwrap();
    replica.wait_ready().await.unwrap();

    assert_eq!(
        replica.store.lock().await.get("inherited").as_deref(),
        Some("yes")
    );

    // Broadcast: logged and acknowledged on proposal, applied on commit.
    let watch_rx = {
        let store = replica.store.lock().await;
        let (_, rx) = store.watch("color");
        rx
    };
    let txn = kv_txn(1, 1, &KvOp::set("color", "green"));
    peer.send(&Packet::proposal(&txn)).await.unwrap();
    let proposal_ack = peer.expect(PacketKind::Ack).await.unwrap();
    assert_eq!(proposal_ack.zxid, txn.zxid);
    assert!(replica.store.lock().await.get("color").is_none());

    peer.send(&Packet::commit(txn.zxid)).await.unwrap();
    let event = watch_rx.await.unwrap();
    assert_eq!(event.zxid(), txn.zxid);
    assert_eq!(
        replica.store.lock().await.get("color").as_deref(),
        Some("green")
    );
    assert_eq!(replica.log.last_logged().await.unwrap(), Some(txn.zxid));
}

#[tokio::test]
async fn an_epoch_offer_below_the_accepted_epoch_is_rejected() {
    init_tracing();
    let replica = TestReplica::with_accepted_epoch(1, Epoch::new(5));
    let (mut peer, task) = connect(&replica).await;

    let info = peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    assert_eq!(info.zxid.epoch(), Epoch::new(5));

    peer.send(&Packet::epoch_info(Epoch::new(4)).unwrap())
        .await
        .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ChorusError::ProtocolViolation { .. }));
    assert_eq!(
        replica.epochs.accepted_epoch().await.unwrap(),
        Epoch::new(5)
    );
}

#[tokio::test]
async fn an_offer_equal_to_the_accepted_epoch_is_a_reconnect() {
    init_tracing();
    let replica = TestReplica::with_accepted_epoch(1, Epoch::new(3));
    let (mut peer, _task) = connect(&replica).await;

    peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    peer.send(&Packet::epoch_info(Epoch::new(3)).unwrap())
        .await
        .unwrap();
    peer.expect(PacketKind::EpochAck).await.unwrap();
    assert_eq!(
        replica.epochs.accepted_epoch().await.unwrap(),
        Epoch::new(3)
    );
}

#[tokio::test]
async fn a_snapshot_replaces_the_replicas_state() {
    init_tracing();
    let replica = TestReplica::new(1);
    let (mut peer, _task) = connect(&replica).await;

    peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    peer.send(&Packet::epoch_info(Epoch::new(2)).unwrap())
        .await
        .unwrap();
    peer.expect(PacketKind::EpochAck).await.unwrap();

    let mut source = KvStore::new();
    source
        .apply(&kv_txn(1, 4, &KvOp::set("a", "1")))
        .await
        .unwrap();
    source
        .apply(&kv_txn(1, 5, &KvOp::set("b", "2")))
        .await
        .unwrap();
    let snapshot = source.create_snapshot().await.unwrap();
    peer.send(&Packet::snapshot(snapshot.clone()).unwrap())
        .await
        .unwrap();

    peer.send(&Packet::new_leader(Epoch::new(2))).await.unwrap();
    peer.expect(PacketKind::Ack).await.unwrap();
    peer.send(&Packet::up_to_date()).await.unwrap();
    replica.wait_ready().await.unwrap();

    let store = replica.store.lock().await;
    assert_eq!(store.get("a").as_deref(), Some("1"));
    assert_eq!(store.get("b").as_deref(), Some("2"));
    assert_eq!(store.last_applied(), Zxid::new(Epoch::new(1), 5));
    drop(store);
    assert!(replica.snapshots.load().await.unwrap().is_some());
}

#[tokio::test]
async fn a_snapshot_with_a_bad_signature_is_rejected() {
    init_tracing();
    let replica = TestReplica::new(1);
    let (mut peer, task) = connect(&replica).await;

    peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    peer.send(&Packet::epoch_info(Epoch::new(1)).unwrap())
        .await
        .unwrap();
    peer.expect(PacketKind::EpochAck).await.unwrap();

    let mut source = KvStore::new();
    source
        .apply(&kv_txn(0, 1, &KvOp::set("a", "1")))
        .await
        .unwrap();
    let snapshot = source.create_snapshot().await.unwrap();
    let payload = SnapshotPayload {
        snapshot,
        signature: "SomebodyElseWasHere".to_string(),
    };
    let forged = Packet::new(
        PacketKind::Snapshot,
        payload.snapshot.last_zxid,
        bincode::serialize(&payload).unwrap(),
    );
    peer.send(&forged).await.unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ChorusError::ProtocolViolation { .. }));
    assert!(replica.store.lock().await.is_empty());
}

#[tokio::test]
async fn a_commit_must_match_the_oldest_pending_proposal() {
    init_tracing();
    let replica = TestReplica::new(1);
    let (mut peer, task) = connect(&replica).await;
    establish(&mut peer, Epoch::new(1)).await;

    let first = kv_txn(1, 1, &KvOp::set("a", "1"));
    let second = kv_txn(1, 2, &KvOp::set("b", "2"));
    peer.send(&Packet::proposal(&first)).await.unwrap();
    peer.expect(PacketKind::Ack).await.unwrap();
    peer.send(&Packet::proposal(&second)).await.unwrap();
    peer.expect(PacketKind::Ack).await.unwrap();

    // Committing the second proposal while the first is still pending breaks
    // the ordering guarantee.
    peer.send(&Packet::commit(second.zxid)).await.unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ChorusError::ProtocolViolation { .. }));
    assert!(replica.store.lock().await.get("b").is_none());
}

#[tokio::test]
async fn a_silent_coordinator_is_abandoned_after_the_sync_limit() {
    init_tracing();
    let replica = TestReplica::new(1);
    let (mut peer, task) = connect(&replica).await;
    establish(&mut peer, Epoch::new(1)).await;
    replica.wait_ready().await.unwrap();

    // Stop sending entirely; the connection stays open but carries no pings.
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ChorusError::Network { .. }));
    drop(peer);
}

#[tokio::test]
async fn ids_flow_through_discovery() {
    init_tracing();
    let replica = TestReplica::new(42);
    let (mut peer, _task) = connect(&replica).await;

    let info = peer.expect(PacketKind::ReplicaInfo).await.unwrap();
    let announced: ReplicaInfo = info.decode_payload().unwrap();
    assert_eq!(announced.replica_id, NodeId::new(42));
}

//! Shared coordinator state: the establishment barriers and the broadcast
//! pipeline.
//!
//! One `Coordinator` is shared by every replica handler. Establishment runs
//! through three quorum barriers (epoch proposal, epoch acknowledgment,
//! new-leader acknowledgment); broadcast runs through a single ordered
//! proposal table that commits strictly in sequence order.

use crate::barrier::QuorumBarrier;
use crate::config::ProtocolConfig;
use bytes::Bytes;
use chorus_core::quorum::{EnsembleConfig, MajorityQuorum, QuorumVerifier};
use chorus_core::storage::{EpochStore, Snapshot, StateMachine, TransactionLog};
use chorus_core::{
    ChorusError, Epoch, NodeId, Packet, Result, StateSummary, Transaction, Zxid,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// How a connecting replica gets caught up to the coordinator's history.
#[derive(Debug)]
pub enum SyncPlan {
    /// The replica already holds our full history.
    UpToDate,
    /// Replay this committed suffix; the replica applies it immediately.
    Diff(Vec<Transaction>),
    /// The replica is too far behind the log; transfer the full store.
    Snapshot(Snapshot),
}

struct PendingProposal {
    txn: Transaction,
    acks: HashSet<NodeId>,
}

struct BroadcastState {
    /// `Some` once establishment completed and new proposals are accepted.
    epoch: Option<Epoch>,
    next_counter: u32,
    outstanding: BTreeMap<Zxid, PendingProposal>,
    last_committed: Zxid,
}

pub struct Coordinator {
    ensemble: EnsembleConfig,
    verifier: MajorityQuorum,
    config: ProtocolConfig,
    epoch_store: Arc<dyn EpochStore>,
    log: Arc<dyn TransactionLog>,
    state_machine: Arc<AsyncMutex<dyn StateMachine>>,
    /// Highest accepted epoch seen during discovery; the decided epoch is one
    /// past this.
    connect_max: Mutex<Epoch>,
    epoch_barrier: QuorumBarrier<Epoch>,
    ack_barrier: QuorumBarrier<()>,
    new_leader_barrier: QuorumBarrier<()>,
    broadcast: AsyncMutex<BroadcastState>,
    replicas: DashMap<NodeId, mpsc::UnboundedSender<Packet>>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        ensemble: EnsembleConfig,
        config: ProtocolConfig,
        epoch_store: Arc<dyn EpochStore>,
        log: Arc<dyn TransactionLog>,
        state_machine: Arc<AsyncMutex<dyn StateMachine>>,
    ) -> Self {
        let verifier = ensemble.verifier();
        let (shutdown, _) = watch::channel(false);
        Self {
            ensemble,
            verifier,
            config,
            epoch_store,
            log,
            state_machine,
            connect_max: Mutex::new(Epoch::default()),
            epoch_barrier: QuorumBarrier::new(),
            ack_barrier: QuorumBarrier::new(),
            new_leader_barrier: QuorumBarrier::new(),
            broadcast: AsyncMutex::new(BroadcastState {
                epoch: None,
                next_counter: 1,
                outstanding: BTreeMap::new(),
                last_committed: Zxid::default(),
            }),
            replicas: DashMap::new(),
            shutdown,
        }
    }

    pub fn id(&self) -> NodeId {
        self.ensemble.node_id
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Run the coordinator's own side of establishment: negotiate the new
    /// epoch with a quorum, persist it, and open the broadcast phase.
    ///
    /// Returns once a quorum of replicas (the coordinator included) has
    /// acknowledged the new leader. The current epoch on disk only advances
    /// after the epoch-ack quorum, so an establishment abandoned before that
    /// point leaves it untouched.
    pub async fn establish(&self) -> Result<Epoch> {
        let accepted = self.epoch_store.accepted_epoch().await?;
        let epoch = self.propose_epoch(self.id(), accepted).await?;
        self.epoch_store.set_accepted_epoch(epoch).await?;
        info!(node = %self.id(), epoch = %epoch, "epoch negotiated");

        let summary = self.state_summary().await?;
        self.ack_epoch(self.id(), summary).await?;
        self.epoch_store.set_current_epoch(epoch).await?;

        {
            let mut broadcast = self.broadcast.lock().await;
            broadcast.epoch = Some(epoch);
            broadcast.next_counter = 1;
            broadcast.last_committed = Zxid::new(epoch, 0);
        }

        self.ack_new_leader(self.id()).await?;
        info!(node = %self.id(), epoch = %epoch, "broadcast phase active");
        Ok(epoch)
    }

    /// Register a replica's accepted epoch and wait for the new epoch to be
    /// decided.
    ///
    /// The decision fires once the registered set contains the coordinator
    /// itself plus a quorum; the new epoch is one past the highest accepted
    /// epoch any registrant reported. Registrations outlive their callers, so
    /// a replica that reports an epoch and then disconnects still raises the
    /// floor for the eventual decision.
    pub async fn propose_epoch(&self, replica: NodeId, accepted: Epoch) -> Result<Epoch> {
        {
            let mut max = self.connect_max.lock();
            if accepted > *max {
                *max = accepted;
            }
        }
        self.epoch_barrier.register(replica);
        self.epoch_barrier
            .try_decide(self.id(), &self.verifier, |_| self.connect_max.lock().next());
        self.epoch_barrier
            .wait(self.config.init_timeout(), "epoch proposal")
            .await
    }

    /// Record a replica's acceptance of the new epoch and wait for a quorum
    /// of acceptances.
    ///
    /// Fails with [`ChorusError::StaleCoordinator`] if the replica's state is
    /// more recent than ours: a coordinator may never lead replicas whose
    /// history it does not contain.
    pub async fn ack_epoch(&self, replica: NodeId, summary: StateSummary) -> Result<()> {
        if replica != self.id() {
            let ours = self.state_summary().await?;
            if summary.is_more_recent_than(&ours) {
                warn!(%replica, theirs = %summary, %ours, "replica is ahead of us, abandoning");
                return Err(ChorusError::StaleCoordinator {
                    replica,
                    summary,
                    ours,
                });
            }
        }
        self.ack_barrier.register(replica);
        self.ack_barrier.try_decide(self.id(), &self.verifier, |_| ());
        self.ack_barrier
            .wait(self.config.init_timeout(), "epoch acknowledgment")
            .await
    }

    /// Record a replica's new-leader acknowledgment and wait for the quorum
    /// that opens the broadcast phase.
    pub async fn ack_new_leader(&self, replica: NodeId) -> Result<()> {
        self.new_leader_barrier.register(replica);
        self.new_leader_barrier
            .try_decide(self.id(), &self.verifier, |_| ());
        self.new_leader_barrier
            .wait(self.config.init_timeout(), "new leader acknowledgment")
            .await
    }

    /// Our current epoch plus the last sequence number in the log.
    pub async fn state_summary(&self) -> Result<StateSummary> {
        let current = self.epoch_store.current_epoch().await?;
        let last = self.log.last_logged().await?.unwrap_or_default();
        Ok(StateSummary::new(current, last))
    }

    /// Decide how to catch a replica up and register its outbound channel in
    /// one step, so no proposal falls between the synchronized history and the
    /// live stream.
    pub async fn sync_and_register(
        &self,
        replica: NodeId,
        peer_last: Zxid,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Result<SyncPlan> {
        let broadcast = self.broadcast.lock().await;
        let ours = self.log.last_logged().await?.unwrap_or_default();

        // During establishment the whole log is committed history; once
        // broadcast is active, only the prefix up to last_committed is.
        let committed_bound = if broadcast.epoch.is_some() {
            broadcast.last_committed
        } else {
            ours
        };

        let plan = if peer_last >= committed_bound {
            SyncPlan::UpToDate
        } else {
            let covers = match self.log.first_logged().await? {
                Some(first) => first <= peer_last.next(),
                None => false,
            };
            if covers {
                let diff = self
                    .log
                    .read_from(peer_last.next())
                    .await?
                    .into_iter()
                    .filter(|txn| txn.zxid <= committed_bound)
                    .collect();
                SyncPlan::Diff(diff)
            } else {
                let snapshot = self.state_machine.lock().await.create_snapshot().await?;
                SyncPlan::Snapshot(snapshot)
            }
        };

        // Uncommitted tail goes through the live channel; the replica logs
        // and acknowledges it like any broadcast proposal.
        for pending in broadcast.outstanding.values() {
            if pending.txn.zxid > peer_last {
                let _ = sender.send(Packet::proposal(&pending.txn));
            }
        }
        self.replicas.insert(replica, sender);
        debug!(%replica, %peer_last, last_ours = %ours, "replica synchronized");
        Ok(plan)
    }

    pub fn unregister_replica(&self, replica: NodeId) {
        self.replicas.remove(&replica);
    }

    /// Number of replicas currently in the broadcast stream.
    pub fn connected_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Propose a new transaction: assign it the next sequence number, log it,
    /// and stream it to every connected replica. The coordinator's own log
    /// append counts as the first acknowledgment.
    pub async fn propose(&self, payload: impl Into<Bytes>) -> Result<Zxid> {
        let mut broadcast = self.broadcast.lock().await;
        let epoch = broadcast
            .epoch
            .ok_or_else(|| ChorusError::internal("broadcast phase not active"))?;
        let zxid = Zxid::new(epoch, broadcast.next_counter);
        broadcast.next_counter += 1;

        let txn = Transaction::new(zxid, payload);
        self.log.append(&txn).await?;

        let mut acks = HashSet::new();
        acks.insert(self.id());
        let packet = Packet::proposal(&txn);
        broadcast.outstanding.insert(zxid, PendingProposal { txn, acks });
        self.fan_out(&packet);
        debug!(%zxid, "proposal broadcast");

        // A single-node ensemble commits on its own acknowledgment.
        self.advance_commits(&mut broadcast).await?;
        Ok(zxid)
    }

    /// Record a replica's acknowledgment of a proposal and commit every
    /// proposal at the head of the table that now holds a quorum.
    pub async fn process_ack(&self, replica: NodeId, zxid: Zxid) -> Result<()> {
        let mut broadcast = self.broadcast.lock().await;
        match broadcast.outstanding.get_mut(&zxid) {
            Some(pending) => {
                pending.acks.insert(replica);
            }
            // Acknowledgment for an already-committed proposal; harmless.
            None => return Ok(()),
        }
        self.advance_commits(&mut broadcast).await
    }

    /// Commit in strict sequence order: a proposal with a quorum stays
    /// outstanding until every earlier proposal has committed.
    async fn advance_commits(&self, broadcast: &mut BroadcastState) -> Result<()> {
        loop {
            let head_ready = match broadcast.outstanding.first_key_value() {
                Some((_, pending)) => self.verifier.contains_quorum(&pending.acks),
                None => false,
            };
            if !head_ready {
                return Ok(());
            }
            let (zxid, pending) = broadcast
                .outstanding
                .pop_first()
                .ok_or_else(|| ChorusError::internal("outstanding head vanished"))?;
            self.state_machine.lock().await.apply(&pending.txn).await?;
            broadcast.last_committed = zxid;
            self.fan_out(&Packet::commit(zxid));
            debug!(%zxid, "committed");
        }
    }

    pub async fn last_committed(&self) -> Zxid {
        self.broadcast.lock().await.last_committed
    }

    fn fan_out(&self, packet: &Packet) {
        for entry in self.replicas.iter() {
            // A closed channel means the handler is tearing down; it will
            // unregister itself.
            let _ = entry.value().send(packet.clone());
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_core::storage::Snapshot;
    use chorus_persistence::{InMemoryEpochStore, InMemoryLog};
    use std::time::Duration;

    struct RecordingMachine {
        applied: Vec<Zxid>,
    }

    #[async_trait]
    impl StateMachine for RecordingMachine {
        async fn apply(&mut self, txn: &Transaction) -> Result<()> {
            self.applied.push(txn.zxid);
            Ok(())
        }

        async fn create_snapshot(&self) -> Result<Snapshot> {
            Ok(Snapshot::new(
                self.last_applied(),
                Bytes::from_static(b"recorded"),
            ))
        }

        async fn restore_snapshot(&mut self, _snapshot: &Snapshot) -> Result<()> {
            Ok(())
        }

        fn last_applied(&self) -> Zxid {
            self.applied.last().copied().unwrap_or_default()
        }
    }

    fn coordinator_of(ensemble_size: u64) -> Arc<Coordinator> {
        let members = (0..ensemble_size).map(NodeId::new).collect();
        let ensemble = EnsembleConfig::new(NodeId::new(0), members);
        let config = ProtocolConfig::new()
            .with_tick_time(Duration::from_millis(10))
            .with_init_limit(5);
        Arc::new(Coordinator::new(
            ensemble,
            config,
            Arc::new(InMemoryEpochStore::new()),
            Arc::new(InMemoryLog::new()),
            Arc::new(AsyncMutex::new(RecordingMachine { applied: vec![] })),
        ))
    }

    #[tokio::test]
    async fn epoch_is_one_past_the_highest_reported() {
        let coordinator = coordinator_of(3);
        let own = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.propose_epoch(NodeId::new(0), Epoch::new(0)).await
            })
        };
        let epoch = coordinator
            .propose_epoch(NodeId::new(1), Epoch::new(6))
            .await
            .unwrap();
        assert_eq!(epoch, Epoch::new(7));
        assert_eq!(own.await.unwrap().unwrap(), Epoch::new(7));
    }

    #[tokio::test]
    async fn replicas_alone_cannot_decide_the_epoch() {
        let coordinator = coordinator_of(3);
        let err = coordinator
            .propose_epoch(NodeId::new(1), Epoch::new(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ChorusError::QuorumTimeout { .. }));

        // The timed-out replica's vote persists; the coordinator's own vote
        // now completes the quorum without any live replica.
        let epoch = coordinator
            .propose_epoch(NodeId::new(0), Epoch::new(0))
            .await
            .unwrap();
        assert_eq!(epoch, Epoch::new(1));
    }

    #[tokio::test]
    async fn stale_coordinator_is_rejected_by_a_fresher_replica() {
        let coordinator = coordinator_of(3);
        let theirs = StateSummary::new(Epoch::new(4), Zxid::new(Epoch::new(4), 9));
        let err = coordinator
            .ack_epoch(NodeId::new(1), theirs)
            .await
            .unwrap_err();
        assert!(matches!(err, ChorusError::StaleCoordinator { .. }));
    }

    #[tokio::test]
    async fn single_node_ensemble_commits_on_its_own_ack() {
        let coordinator = coordinator_of(1);
        coordinator.establish().await.unwrap();

        let zxid = coordinator.propose(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(zxid, Zxid::new(Epoch::new(1), 1));
        assert_eq!(coordinator.last_committed().await, zxid);
    }

    #[tokio::test]
    async fn commits_stay_in_order_under_out_of_order_acks() {
        let coordinator = coordinator_of(3);
        let establish = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.establish().await })
        };
        let replica = NodeId::new(1);
        coordinator.propose_epoch(replica, Epoch::new(0)).await.unwrap();
        coordinator
            .ack_epoch(replica, StateSummary::default())
            .await
            .unwrap();
        coordinator.ack_new_leader(replica).await.unwrap();
        establish.await.unwrap().unwrap();

        let first = coordinator.propose(Bytes::from_static(b"a")).await.unwrap();
        let second = coordinator.propose(Bytes::from_static(b"b")).await.unwrap();

        // Acknowledging the second proposal first must not commit it early.
        coordinator.process_ack(replica, second).await.unwrap();
        assert_eq!(coordinator.last_committed().await, Zxid::new(Epoch::new(1), 0));

        coordinator.process_ack(replica, first).await.unwrap();
        assert_eq!(coordinator.last_committed().await, second);
    }
}

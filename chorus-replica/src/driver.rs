//! Replica side of the protocol: one driver per coordinator connection.
//!
//! The driver announces itself, validates the offered epoch, consumes the
//! synchronization stream (snapshot or committed log suffix), acknowledges
//! the new leader, and then settles into the broadcast loop where proposals
//! are logged and acknowledged but only applied on their commit.

use crate::config::ReplicaConfig;
use chorus_core::messages::{SnapshotPayload, PROTOCOL_VERSION};
use chorus_core::storage::{EpochStore, SnapshotStore, StateMachine, TransactionLog};
use chorus_core::wire::{framed, FramedReader, FramedWriter};
use chorus_core::{
    ChorusError, Epoch, NodeId, Packet, PacketKind, Result, Transaction, Zxid,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

pub struct ReplicaDriver {
    id: NodeId,
    config: ReplicaConfig,
    epoch_store: Arc<dyn EpochStore>,
    log: Arc<dyn TransactionLog>,
    snapshot_store: Arc<dyn SnapshotStore>,
    state_machine: Arc<AsyncMutex<dyn StateMachine>>,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl ReplicaDriver {
    pub fn new(
        id: NodeId,
        config: ReplicaConfig,
        epoch_store: Arc<dyn EpochStore>,
        log: Arc<dyn TransactionLog>,
        snapshot_store: Arc<dyn SnapshotStore>,
        state_machine: Arc<AsyncMutex<dyn StateMachine>>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            config,
            epoch_store,
            log,
            snapshot_store,
            state_machine,
            ready,
            shutdown,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Flips to `true` once the coordinator has declared this replica up to
    /// date and the broadcast phase is active.
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Follow one coordinator connection to completion. Returns when the
    /// stream closes, the coordinator violates the protocol, or
    /// [`ReplicaDriver::shutdown`] is called.
    pub async fn run<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = framed(stream);

        let epoch = self.negotiate_epoch(&mut reader, &mut writer).await?;
        self.synchronize(epoch, &mut reader, &mut writer).await?;
        self.broadcast_loop(reader, writer).await
    }

    /// Discovery plus epoch validation: announce our accepted epoch, check
    /// the coordinator's offer, and acknowledge it with our history summary.
    async fn negotiate_epoch<S>(
        &self,
        reader: &mut FramedReader<ReadHalf<S>>,
        writer: &mut FramedWriter<WriteHalf<S>>,
    ) -> Result<Epoch>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let accepted = self.epoch_store.accepted_epoch().await?;
        writer
            .write_packet(&Packet::replica_info(self.id, accepted)?)
            .await?;

        let offer = self
            .bounded_read(reader, "epoch offer")
            .await?
            .expect(PacketKind::EpochInfo)?;
        let version: u32 = offer.decode_payload()?;
        if version != PROTOCOL_VERSION {
            return Err(ChorusError::protocol(format!(
                "unsupported protocol version {:#x}",
                version
            )));
        }
        let offered = offer.zxid.epoch();
        if offered < accepted {
            return Err(ChorusError::protocol(format!(
                "coordinator offered epoch {} below our accepted epoch {}",
                offered, accepted
            )));
        }
        // An offer equal to our accepted epoch is a reconnect within the same
        // establishment round; nothing new to persist.
        if offered > accepted {
            self.epoch_store.set_accepted_epoch(offered).await?;
        }
        info!(replica = %self.id, epoch = %offered, "epoch accepted");

        let prior_current = self.epoch_store.current_epoch().await?;
        let last = self.log.last_logged().await?.unwrap_or_default();
        writer
            .write_packet(&Packet::epoch_ack(prior_current, last)?)
            .await?;
        Ok(offered)
    }

    /// Consume the synchronization stream up to the new-leader marker. The
    /// current epoch is persisted before the marker is acknowledged, so a
    /// crash after the acknowledgment can never resurface the old epoch.
    async fn synchronize<S>(
        &self,
        epoch: Epoch,
        reader: &mut FramedReader<ReadHalf<S>>,
        writer: &mut FramedWriter<WriteHalf<S>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        loop {
            let packet = self.bounded_read(reader, "synchronization").await?;
            match packet.kind {
                PacketKind::Snapshot => {
                    let payload: SnapshotPayload = packet.decode_payload()?;
                    payload.verify_signature()?;
                    if !payload.snapshot.verify_checksum() {
                        return Err(ChorusError::protocol("snapshot checksum mismatch"));
                    }
                    debug!(replica = %self.id, at = %payload.snapshot.last_zxid, "restoring snapshot");
                    self.state_machine
                        .lock()
                        .await
                        .restore_snapshot(&payload.snapshot)
                        .await?;
                    self.snapshot_store.save(&payload.snapshot).await?;
                }
                PacketKind::Proposal => {
                    // Part of the committed diff: applied immediately, no
                    // acknowledgment expected.
                    let txn = packet.to_transaction();
                    self.log.append(&txn).await?;
                    self.state_machine.lock().await.apply(&txn).await?;
                }
                PacketKind::NewLeader => {
                    if packet.zxid != Zxid::new(epoch, 0) {
                        return Err(ChorusError::protocol(format!(
                            "new leader marker at {} does not match epoch {}",
                            packet.zxid, epoch
                        )));
                    }
                    self.epoch_store.set_current_epoch(epoch).await?;
                    writer.write_packet(&Packet::ack(packet.zxid)).await?;
                    info!(replica = %self.id, %epoch, "synchronized");
                    return Ok(());
                }
                PacketKind::Ping => {
                    writer.write_packet(&Packet::ping()).await?;
                }
                other => {
                    return Err(ChorusError::protocol(format!(
                        "unexpected {} during synchronization",
                        other
                    )));
                }
            }
        }
    }

    /// The steady state: log and acknowledge proposals, apply them on their
    /// commit, answer pings. Proposals received before the up-to-date marker
    /// are the coordinator's uncommitted tail and are treated identically.
    async fn broadcast_loop<S>(
        &self,
        mut reader: FramedReader<ReadHalf<S>>,
        mut writer: FramedWriter<WriteHalf<S>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // Reader runs in its own task so shutdown can interrupt the loop
        // without abandoning a half-read frame.
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Result<Packet>>();
        let read_task = tokio::spawn(async move {
            loop {
                let result = reader.read_packet().await;
                let failed = result.is_err();
                if inbound_tx.send(result).is_err() || failed {
                    break;
                }
            }
        });

        let result = self.apply_stream(&mut writer, &mut inbound).await;
        read_task.abort();
        if let Err(err) = &result {
            warn!(replica = %self.id, %err, "broadcast loop closed");
        }
        result
    }

    async fn apply_stream<W>(
        &self,
        writer: &mut FramedWriter<W>,
        inbound: &mut mpsc::UnboundedReceiver<Result<Packet>>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut pending: VecDeque<Transaction> = VecDeque::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            // The coordinator pings inside this window, so a quiet but live
            // connection never trips the bound.
            let silence = tokio::time::sleep(self.config.sync_timeout());
            tokio::pin!(silence);

            let packet = tokio::select! {
                received = inbound.recv() => received
                    .ok_or_else(|| ChorusError::network("coordinator disconnected"))??,
                _ = &mut silence => {
                    return Err(ChorusError::network(
                        "coordinator silent past the sync limit",
                    ));
                }
                _ = shutdown.changed() => {
                    debug!(replica = %self.id, "replica shut down");
                    return Ok(());
                }
            };

            match packet.kind {
                PacketKind::Proposal => {
                    let txn = packet.to_transaction();
                    self.log.append(&txn).await?;
                    writer.write_packet(&Packet::ack(txn.zxid)).await?;
                    pending.push_back(txn);
                }
                PacketKind::Commit => {
                    let applied = self.state_machine.lock().await.last_applied();
                    if packet.zxid <= applied {
                        // Commit for history we already hold from the
                        // synchronization diff.
                        continue;
                    }
                    let front = pending.front().map(|txn| txn.zxid);
                    if front != Some(packet.zxid) {
                        return Err(ChorusError::protocol(format!(
                            "commit for {} but the oldest pending proposal is {:?}",
                            packet.zxid, front
                        )));
                    }
                    let txn = pending
                        .pop_front()
                        .ok_or_else(|| ChorusError::internal("pending queue underflow"))?;
                    self.state_machine.lock().await.apply(&txn).await?;
                    debug!(replica = %self.id, zxid = %txn.zxid, "applied");
                }
                PacketKind::UpToDate => {
                    info!(replica = %self.id, "broadcast phase active");
                    let _ = self.ready.send(true);
                }
                PacketKind::Ping => {
                    writer.write_packet(&Packet::ping()).await?;
                }
                other => {
                    return Err(ChorusError::protocol(format!(
                        "unexpected {} during broadcast",
                        other
                    )));
                }
            }
        }
    }

    async fn bounded_read<R>(&self, reader: &mut FramedReader<R>, phase: &str) -> Result<Packet>
    where
        R: AsyncRead + Unpin,
    {
        match tokio::time::timeout(self.config.init_timeout(), reader.read_packet()).await {
            Ok(result) => result,
            Err(_) => Err(ChorusError::quorum_timeout(phase)),
        }
    }
}

//! Per-connection driver for one replica.
//!
//! Each accepted stream gets its own handler task that walks the replica
//! through establishment (discovery, epoch acknowledgment, synchronization,
//! new-leader acknowledgment) and then relays the broadcast stream until the
//! connection drops or the coordinator shuts down.

use crate::coordinator::{Coordinator, SyncPlan};
use chorus_core::messages::PROTOCOL_VERSION;
use chorus_core::wire::{framed, FramedReader, FramedWriter};
use chorus_core::{
    ChorusError, Epoch, NodeId, Packet, PacketKind, ReplicaInfo, Result, StateSummary, Zxid,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ReplicaHandler {
    coordinator: Arc<Coordinator>,
}

impl ReplicaHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Drive one replica connection to completion. Returns when the replica
    /// disconnects, violates the protocol, or the coordinator shuts down.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = framed(stream);

        let (replica, accepted) = self.read_discovery(&mut reader).await?;
        info!(%replica, last_accepted = %accepted, "replica connected");

        let result = self.serve(replica, accepted, reader, writer).await;
        self.coordinator.unregister_replica(replica);
        match &result {
            Ok(()) => info!(%replica, "replica handler finished"),
            Err(err) => {
                warn!(%replica, %err, "replica handler closed");
                if matches!(err, ChorusError::StaleCoordinator { .. }) {
                    // We cannot lead a replica whose history we lack.
                    self.coordinator.shutdown();
                }
            }
        }
        result
    }

    async fn read_discovery<R>(&self, reader: &mut FramedReader<R>) -> Result<(NodeId, Epoch)>
    where
        R: AsyncRead + Unpin,
    {
        let packet = self
            .bounded_read(reader, "replica discovery")
            .await?
            .expect(PacketKind::ReplicaInfo)?;
        let info: ReplicaInfo = packet.decode_payload()?;
        if info.protocol_version != PROTOCOL_VERSION {
            return Err(ChorusError::protocol(format!(
                "unsupported protocol version {:#x}",
                info.protocol_version
            )));
        }
        Ok((info.replica_id, packet.zxid.epoch()))
    }

    async fn serve<S>(
        &self,
        replica: NodeId,
        accepted: Epoch,
        mut reader: FramedReader<ReadHalf<S>>,
        mut writer: FramedWriter<WriteHalf<S>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let epoch = self.coordinator.propose_epoch(replica, accepted).await?;
        writer.write_packet(&Packet::epoch_info(epoch)?).await?;

        let ack = self
            .bounded_read(&mut reader, "epoch acknowledgment")
            .await?
            .expect(PacketKind::EpochAck)?;
        let prior_current: Epoch = ack.decode_payload()?;
        let summary = StateSummary::new(prior_current, ack.zxid);
        self.coordinator.ack_epoch(replica, summary).await?;

        let (sender, outbound) = mpsc::unbounded_channel();
        let plan = self
            .coordinator
            .sync_and_register(replica, ack.zxid, sender.clone())
            .await?;
        match plan {
            SyncPlan::UpToDate => {}
            SyncPlan::Diff(txns) => {
                debug!(%replica, count = txns.len(), "sending log diff");
                for txn in &txns {
                    writer.write_packet(&Packet::proposal(txn)).await?;
                }
            }
            SyncPlan::Snapshot(snapshot) => {
                debug!(%replica, at = %snapshot.last_zxid, "sending snapshot");
                writer.write_packet(&Packet::snapshot(snapshot)?).await?;
            }
        }
        writer.write_packet(&Packet::new_leader(epoch)).await?;

        let leader_ack = self
            .bounded_read(&mut reader, "new leader acknowledgment")
            .await?
            .expect(PacketKind::Ack)?;
        if leader_ack.zxid != Zxid::new(epoch, 0) {
            return Err(ChorusError::protocol(format!(
                "new leader acknowledged at {} instead of {}",
                leader_ack.zxid,
                Zxid::new(epoch, 0)
            )));
        }
        self.coordinator.ack_new_leader(replica).await?;
        writer.write_packet(&Packet::up_to_date()).await?;

        self.broadcast_loop(replica, reader, writer, outbound, sender)
            .await
    }

    async fn broadcast_loop<S>(
        &self,
        replica: NodeId,
        mut reader: FramedReader<ReadHalf<S>>,
        mut writer: FramedWriter<WriteHalf<S>>,
        mut outbound: mpsc::UnboundedReceiver<Packet>,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        // Inbound frames flow through a task of their own; selecting on the
        // reader directly could drop a half-read frame when another branch
        // fires first.
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

        let result = self
            .relay(replica, &mut writer, &mut outbound, &mut inbound, sender)
            .await;
        read_task.abort();
        result
    }

    async fn relay<W>(
        &self,
        replica: NodeId,
        writer: &mut FramedWriter<W>,
        outbound: &mut mpsc::UnboundedReceiver<Packet>,
        inbound: &mut mpsc::UnboundedReceiver<Result<Packet>>,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let config = self.coordinator.config().clone();
        let mut ping = tokio::time::interval(config.ping_interval);
        let mut shutdown = self.coordinator.shutdown_signal();
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                received = inbound.recv() => {
                    let packet = received
                        .ok_or_else(|| ChorusError::network("replica disconnected"))??;
                    last_heard = Instant::now();
                    match packet.kind {
                        PacketKind::Ack => {
                            self.coordinator.process_ack(replica, packet.zxid).await?;
                        }
                        PacketKind::Ping => {}
                        other => {
                            return Err(ChorusError::protocol(format!(
                                "unexpected {} during broadcast",
                                other
                            )));
                        }
                    }
                }
                outgoing = outbound.recv() => {
                    match outgoing {
                        Some(packet) => writer.write_packet(&packet).await?,
                        None => return Err(ChorusError::Shutdown),
                    }
                }
                _ = ping.tick() => {
                    if last_heard.elapsed() > config.sync_timeout() {
                        return Err(ChorusError::network(format!(
                            "replica {} silent past the sync limit",
                            replica
                        )));
                    }
                    if sender.send(Packet::ping()).is_err() {
                        return Err(ChorusError::Shutdown);
                    }
                }
                _ = shutdown.changed() => {
                    debug!(%replica, "coordinator shut down");
                    return Ok(());
                }
            }
        }
    }

    async fn bounded_read<R>(&self, reader: &mut FramedReader<R>, phase: &str) -> Result<Packet>
    where
        R: AsyncRead + Unpin,
    {
        let limit = self.coordinator.config().init_timeout();
        match tokio::time::timeout(limit, reader.read_packet()).await {
            Ok(result) => result,
            Err(_) => Err(ChorusError::quorum_timeout(phase)),
        }
    }
}

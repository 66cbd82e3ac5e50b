//! Builders and scripted peers for exercising the protocol over in-process
//! duplex streams.

use chorus_core::quorum::EnsembleConfig;
use chorus_core::storage::StateMachine;
use chorus_core::wire::{framed, FramedReader, FramedWriter};
use chorus_core::{Epoch, NodeId, Packet, PacketKind, Result};
use chorus_coordinator::{Coordinator, ProtocolConfig, ReplicaHandler};
use chorus_kvstore::KvStore;
use chorus_persistence::{InMemoryEpochStore, InMemoryLog, InMemorySnapshotStore};
use chorus_replica::{ReplicaConfig, ReplicaDriver};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Short timeouts so negative tests fail fast.
pub const TICK: Duration = Duration::from_millis(20);
pub const INIT_LIMIT: u32 = 10;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn ensemble(node_id: u64, size: u64) -> EnsembleConfig {
    let members: HashSet<NodeId> = (0..size).map(NodeId::new).collect();
    EnsembleConfig::new(NodeId::new(node_id), members)
}

/// A coordinator wired to in-memory storage and a key-value store, with the
/// backing handles exposed for assertions.
pub struct TestCoordinator {
    pub coordinator: Arc<Coordinator>,
    pub epochs: Arc<InMemoryEpochStore>,
    pub log: Arc<InMemoryLog>,
    pub store: Arc<AsyncMutex<KvStore>>,
}

impl TestCoordinator {
    pub fn new(ensemble_size: u64) -> Self {
        let epochs = Arc::new(InMemoryEpochStore::new());
        let log = Arc::new(InMemoryLog::new());
        let store = Arc::new(AsyncMutex::new(KvStore::new()));
        let state_machine: Arc<AsyncMutex<dyn StateMachine>> = store.clone();
        let config = ProtocolConfig::new()
            .with_tick_time(TICK)
            .with_init_limit(INIT_LIMIT)
            .with_ping_interval(TICK);
        let coordinator = Arc::new(Coordinator::new(
            ensemble(0, ensemble_size),
            config,
            epochs.clone(),
            log.clone(),
            state_machine,
        ));
        Self {
            coordinator,
            epochs,
            log,
            store,
        }
    }

    /// Spawn a handler for one incoming connection; the returned stream is
    /// the replica's end.
    pub fn accept(&self) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (ours, theirs) = duplex(64 * 1024);
        let handler = ReplicaHandler::new(Arc::clone(&self.coordinator));
        let task = tokio::spawn(async move { handler.run(ours).await });
        (theirs, task)
    }

    pub fn establish(&self) -> JoinHandle<Result<Epoch>> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move { coordinator.establish().await })
    }
}

/// A replica driver wired to in-memory storage, with handles exposed.
pub struct TestReplica {
    pub driver: Arc<ReplicaDriver>,
    pub epochs: Arc<InMemoryEpochStore>,
    pub log: Arc<InMemoryLog>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub store: Arc<AsyncMutex<KvStore>>,
}

impl TestReplica {
    pub fn new(id: u64) -> Self {
        Self::with_accepted_epoch(id, Epoch::new(0))
    }

    pub fn with_accepted_epoch(id: u64, accepted: Epoch) -> Self {
        let epochs = Arc::new(InMemoryEpochStore::with_accepted(accepted));
        let log = Arc::new(InMemoryLog::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let store = Arc::new(AsyncMutex::new(KvStore::new()));
        let state_machine: Arc<AsyncMutex<dyn StateMachine>> = store.clone();
        let config = ReplicaConfig::new()
            .with_tick_time(TICK)
            .with_init_limit(INIT_LIMIT);
        let driver = Arc::new(ReplicaDriver::new(
            NodeId::new(id),
            config,
            epochs.clone(),
            log.clone(),
            snapshots.clone(),
            state_machine,
        ));
        Self {
            driver,
            epochs,
            log,
            snapshots,
            store,
        }
    }

    pub fn run(&self, stream: DuplexStream) -> JoinHandle<Result<()>> {
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move { driver.run(stream).await })
    }

    /// Wait until the coordinator declares this replica up to date.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.driver.ready_signal();
        let wait = async {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(TICK * INIT_LIMIT, wait)
            .await
            .map_err(|_| chorus_core::ChorusError::quorum_timeout("replica readiness"))
    }
}

/// A hand-driven protocol peer: reads and writes raw packets over one end of
/// a duplex stream, standing in for either side of the conversation.
pub struct ScriptedPeer {
    reader: FramedReader<ReadHalf<DuplexStream>>,
    writer: FramedWriter<WriteHalf<DuplexStream>>,
}

impl ScriptedPeer {
    pub fn over(stream: DuplexStream) -> Self {
        let (reader, writer) = framed(stream);
        Self { reader, writer }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.writer.write_packet(packet).await
    }

    /// Next packet, with liveness pings skipped.
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            let packet = tokio::time::timeout(TICK * INIT_LIMIT, self.reader.read_packet())
                .await
                .map_err(|_| chorus_core::ChorusError::quorum_timeout("scripted read"))??;
            if packet.kind != PacketKind::Ping {
                return Ok(packet);
            }
        }
    }

    /// Next packet of the expected kind, failing on anything else but pings.
    pub async fn expect(&mut self, kind: PacketKind) -> Result<Packet> {
        self.recv().await?.expect(kind)
    }
}

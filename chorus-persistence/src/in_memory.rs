use async_trait::async_trait;
use chorus_core::storage::{EpochStore, Snapshot, SnapshotStore, TransactionLog};
use chorus_core::{ChorusError, Epoch, Result, Transaction, Zxid};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::RangeFrom;
use std::sync::Arc;

/// Epoch pair held in memory. Suitable for tests and non-persistent peers;
/// still enforces the monotonicity the durable implementations provide.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEpochStore {
    inner: Arc<RwLock<EpochPair>>,
}

#[derive(Debug, Default)]
struct EpochPair {
    accepted: Epoch,
    current: Epoch,
}

impl InMemoryEpochStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known accepted epoch, as a restarted peer would.
    pub fn with_accepted(accepted: Epoch) -> Self {
        let store = Self::new();
        store.inner.write().accepted = accepted;
        store
    }
}

#[async_trait]
impl EpochStore for InMemoryEpochStore {
    async fn accepted_epoch(&self) -> Result<Epoch> {
        Ok(self.inner.read().accepted)
    }

    async fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()> {
        let mut pair = self.inner.write();
        if epoch < pair.accepted {
            return Err(ChorusError::storage(format!(
                "accepted epoch may not regress: {} < {}",
                epoch, pair.accepted
            )));
        }
        pair.accepted = epoch;
        Ok(())
    }

    async fn current_epoch(&self) -> Result<Epoch> {
        Ok(self.inner.read().current)
    }

    async fn set_current_epoch(&self, epoch: Epoch) -> Result<()> {
        let mut pair = self.inner.write();
        if epoch > pair.accepted {
            return Err(ChorusError::storage(format!(
                "current epoch {} would exceed accepted epoch {}",
                epoch, pair.accepted
            )));
        }
        if epoch < pair.current {
            return Err(ChorusError::storage(format!(
                "current epoch may not regress: {} < {}",
                epoch, pair.current
            )));
        }
        pair.current = epoch;
        Ok(())
    }
}

/// Transaction log held in an ordered in-memory map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLog {
    entries: Arc<RwLock<BTreeMap<Zxid, Transaction>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl TransactionLog for InMemoryLog {
    async fn append(&self, txn: &Transaction) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some((&last, _)) = entries.iter().next_back() {
            if txn.zxid <= last {
                return Err(ChorusError::storage(format!(
                    "log append out of order: {} after {}",
                    txn.zxid, last
                )));
            }
        }
        entries.insert(txn.zxid, txn.clone());
        Ok(())
    }

    async fn read_from(&self, from: Zxid) -> Result<Vec<Transaction>> {
        let entries = self.entries.read();
        Ok(entries
            .range(RangeFrom { start: from })
            .map(|(_, txn)| txn.clone())
            .collect())
    }

    async fn first_logged(&self) -> Result<Option<Zxid>> {
        Ok(self.entries.read().keys().next().copied())
    }

    async fn last_logged(&self) -> Result<Option<Zxid>> {
        Ok(self.entries.read().keys().next_back().copied())
    }
}

/// Single-slot snapshot store held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    slot: Arc<RwLock<Option<Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.slot.write() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.slot.read().clone())
    }
}

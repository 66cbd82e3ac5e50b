//! The replicated store itself: a flat key space fed by the ordered apply
//! path, queried locally, and observed through one-shot watches.

use crate::operations::KvOp;
use crate::watches::{WatchEvent, WatchId, WatchRegistry};
use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::storage::{Snapshot, StateMachine};
use chorus_core::{ChorusError, Result, Transaction, Zxid};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Serialized image of the store; ordered so identical contents always
/// produce identical snapshot bytes.
#[derive(Debug, Serialize, Deserialize)]
struct StoreImage {
    entries: BTreeMap<String, String>,
}

pub struct KvStore {
    data: DashMap<String, String>,
    last_applied: Mutex<Zxid>,
    watches: Arc<WatchRegistry>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            last_applied: Mutex::new(Zxid::default()),
            watches: Arc::new(WatchRegistry::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Arm a one-shot watch on `key`; resolves with the next committed change.
    pub fn watch(&self, key: &str) -> (WatchId, oneshot::Receiver<WatchEvent>) {
        self.watches.register(key)
    }

    pub fn watches(&self) -> Arc<WatchRegistry> {
        Arc::clone(&self.watches)
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for KvStore {
    async fn apply(&mut self, txn: &Transaction) -> Result<()> {
        {
            let last = self.last_applied.lock();
            if txn.zxid <= *last {
                return Err(ChorusError::internal(format!(
                    "apply out of order: {} after {}",
                    txn.zxid, *last
                )));
            }
        }

        let op = KvOp::decode(&txn.payload)?;
        match op {
            KvOp::Set { key, value } => {
                self.data.insert(key.clone(), value.clone());
                self.watches.fire(WatchEvent::Set {
                    key,
                    value,
                    zxid: txn.zxid,
                });
            }
            KvOp::Delete { key } => {
                let existed = self.data.remove(&key).is_some();
                if existed {
                    self.watches.fire(WatchEvent::Deleted {
                        key,
                        zxid: txn.zxid,
                    });
                }
            }
        }
        *self.last_applied.lock() = txn.zxid;
        debug!(zxid = %txn.zxid, "applied operation");
        Ok(())
    }

    async fn create_snapshot(&self) -> Result<Snapshot> {
        let image = StoreImage {
            entries: self
                .data
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        let data = Bytes::from(bincode::serialize(&image)?);
        Ok(Snapshot::new(self.last_applied(), data))
    }

    async fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let image: StoreImage = bincode::deserialize(&snapshot.data)?;
        self.data.clear();
        for (key, value) in image.entries {
            self.data.insert(key, value);
        }
        *self.last_applied.lock() = snapshot.last_zxid;
        debug!(at = %snapshot.last_zxid, "restored snapshot");
        Ok(())
    }

    fn last_applied(&self) -> Zxid {
        *self.last_applied.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::Epoch;

    fn txn(counter: u32, op: &KvOp) -> Transaction {
        Transaction::new(Zxid::new(Epoch::new(1), counter), op.encode().unwrap())
    }

    #[tokio::test]
    async fn set_and_delete_flow_through_apply() {
        let mut store = KvStore::new();
        store.apply(&txn(1, &KvOp::set("a", "1"))).await.unwrap();
        store.apply(&txn(2, &KvOp::set("b", "2"))).await.unwrap();
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.len(), 2);

        store.apply(&txn(3, &KvOp::delete("a"))).await.unwrap();
        assert!(!store.contains_key("a"));
        assert_eq!(store.last_applied(), Zxid::new(Epoch::new(1), 3));
    }

    #[tokio::test]
    async fn out_of_order_apply_is_rejected() {
        let mut store = KvStore::new();
        store.apply(&txn(2, &KvOp::set("a", "1"))).await.unwrap();
        assert!(store.apply(&txn(2, &KvOp::set("a", "dup"))).await.is_err());
        assert!(store.apply(&txn(1, &KvOp::set("a", "old"))).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trip_preserves_contents_and_position() {
        let mut store = KvStore::new();
        store.apply(&txn(1, &KvOp::set("a", "1"))).await.unwrap();
        store.apply(&txn(2, &KvOp::set("b", "2"))).await.unwrap();
        let snapshot = store.create_snapshot().await.unwrap();
        assert!(snapshot.verify_checksum());

        let mut restored = KvStore::new();
        restored.restore_snapshot(&snapshot).await.unwrap();
        assert_eq!(restored.get("b").as_deref(), Some("2"));
        assert_eq!(restored.last_applied(), Zxid::new(Epoch::new(1), 2));

        // The restored store continues from the snapshot position.
        restored.apply(&txn(3, &KvOp::set("c", "3"))).await.unwrap();
        assert_eq!(restored.len(), 3);
    }

    #[tokio::test]
    async fn a_watch_fires_on_the_committed_change() {
        let mut store = KvStore::new();
        let (_, rx) = store.watch("a");
        store.apply(&txn(1, &KvOp::set("a", "1"))).await.unwrap();

        let event = rx.await.unwrap();
        assert_eq!(
            event,
            WatchEvent::Set {
                key: "a".to_string(),
                value: "1".to_string(),
                zxid: Zxid::new(Epoch::new(1), 1),
            }
        );
    }

    #[tokio::test]
    async fn deleting_a_missing_key_fires_no_watch() {
        let mut store = KvStore::new();
        let (_, mut rx) = store.watch("ghost");
        store.apply(&txn(1, &KvOp::delete("ghost"))).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}

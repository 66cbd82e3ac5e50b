//! Storage collaborator interfaces.
//!
//! The replication core never touches disk directly; it consumes durable
//! epochs, a transaction log, snapshots, and the replicated state machine
//! purely through these traits. Implementations live in `chorus-persistence`
//! and `chorus-kvstore`.

use crate::{Epoch, Result, Transaction, Zxid};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A checksummed full-state dump, keyed by the sequence number at which it was
/// taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_zxid: Zxid,
    pub data: Bytes,
    pub checksum: u32,
}

impl Snapshot {
    pub fn new(last_zxid: Zxid, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = crc32fast::hash(&data);
        Self {
            last_zxid,
            data,
            checksum,
        }
    }

    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }
}

/// Durable `(accepted_epoch, current_epoch)` pair. Both values must survive
/// process restart; `current <= accepted` is maintained by the callers (a peer
/// always accepts an epoch before activating under it).
#[async_trait]
pub trait EpochStore: Send + Sync {
    async fn accepted_epoch(&self) -> Result<Epoch>;

    async fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()>;

    async fn current_epoch(&self) -> Result<Epoch>;

    async fn set_current_epoch(&self, epoch: Epoch) -> Result<()>;
}

/// Append-ordered transaction log keyed by sequence number.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn append(&self, txn: &Transaction) -> Result<()>;

    /// All retained transactions with `zxid >= from`, in order.
    async fn read_from(&self, from: Zxid) -> Result<Vec<Transaction>>;

    /// Oldest retained sequence number, if any.
    async fn first_logged(&self) -> Result<Option<Zxid>>;

    /// Newest retained sequence number, if any.
    async fn last_logged(&self) -> Result<Option<Zxid>>;
}

/// Durable home for periodic full-state snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// The most recent saved snapshot, if any.
    async fn load(&self) -> Result<Option<Snapshot>>;
}

/// The replicated state machine: applies committed transactions and serves
/// the current state. Mutated only from the single ordered-apply path.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply one committed transaction. Callers guarantee strictly increasing
    /// zxid order.
    async fn apply(&mut self, txn: &Transaction) -> Result<()>;

    async fn create_snapshot(&self) -> Result<Snapshot>;

    async fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    /// Sequence number of the last applied (or restored) transaction.
    fn last_applied(&self) -> Zxid;
}

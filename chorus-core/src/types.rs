//! # Core Types
//!
//! Fundamental identifiers and records used throughout the Chorus replication
//! protocol: peer ids, epochs, packed sequence numbers, and transactions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a peer in the replication ensemble.
///
/// Ids are small integers assigned by static configuration; they are stable
/// across restarts and used for quorum accounting and message attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A coordinator term identifier.
///
/// Epochs strictly increase across successive coordinators. Each peer persists
/// two epochs: the highest it has *accepted* (agreed to try) and the highest
/// under which it has completed activation (*current*). The invariant
/// `current <= accepted` holds at all times.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

impl Epoch {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The epoch that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Total-order sequence number: epoch in the high 32 bits, a per-epoch counter
/// in the low 32 bits. Integer comparison of the packed value equals commit
/// order, so the derived `Ord` is the protocol order.
///
/// ```rust
/// use chorus_core::{Epoch, Zxid};
///
/// let z = Zxid::new(Epoch::new(1), 1000);
/// assert_eq!(z.epoch(), Epoch::new(1));
/// assert_eq!(z.counter(), 1000);
/// assert!(Zxid::new(Epoch::new(2), 0) > z);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Zxid(pub u64);

impl Zxid {
    pub fn new(epoch: Epoch, counter: u32) -> Self {
        Self((u64::from(epoch.0) << 32) | u64::from(counter))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn epoch(&self) -> Epoch {
        Epoch((self.0 >> 32) as u32)
    }

    pub fn counter(&self) -> u32 {
        self.0 as u32
    }

    /// The next sequence number within the same epoch.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Zxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch(), self.counter())
    }
}

/// A peer's view of its own history: the epoch it last activated under and the
/// last sequence number it has processed. Exchanged during the epoch-ack
/// handshake so the coordinator can detect a peer that is ahead of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub current_epoch: Epoch,
    pub last_zxid: Zxid,
}

impl StateSummary {
    pub fn new(current_epoch: Epoch, last_zxid: Zxid) -> Self {
        Self {
            current_epoch,
            last_zxid,
        }
    }

    /// True if this summary describes a strictly later history than `other`.
    pub fn is_more_recent_than(&self, other: &StateSummary) -> bool {
        self.current_epoch > other.current_epoch
            || (self.current_epoch == other.current_epoch && self.last_zxid > other.last_zxid)
    }
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(epoch {}, zxid {})", self.current_epoch, self.last_zxid)
    }
}

/// An ordered mutation record. Immutable after creation; the payload is opaque
/// to the replication core and interpreted only by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub zxid: Zxid,
    pub payload: Bytes,
}

impl Transaction {
    pub fn new(zxid: Zxid, payload: impl Into<Bytes>) -> Self {
        Self {
            zxid,
            payload: payload.into(),
        }
    }
}

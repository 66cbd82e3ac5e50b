//! Wire packets exchanged over the per-replica duplex stream.
//!
//! Every packet is a structured record with a type tag, a sequence-number
//! field, and an opaque payload. The payload's meaning depends on the kind:
//! discovery packets carry bincode-encoded handshake records, snapshot packets
//! carry the serialized store, proposals carry the transaction payload.

use crate::storage::Snapshot;
use crate::{ChorusError, Epoch, NodeId, Result, Transaction, Zxid};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Handshake protocol version, carried in `ReplicaInfo` and echoed back in
/// `EpochInfo`.
pub const PROTOCOL_VERSION: u32 = 0x10000;

/// Trailing marker written after a serialized snapshot and validated on load.
pub const SNAPSHOT_SIGNATURE: &str = "chorus-snap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// replica -> coordinator: discovery start; payload is [`ReplicaInfo`],
    /// zxid carries the replica's last accepted epoch.
    ReplicaInfo,
    /// coordinator -> replica: the negotiated epoch (high bits of the zxid)
    /// plus the protocol version.
    EpochInfo,
    /// replica -> coordinator: epoch accepted; zxid is the replica's last
    /// processed sequence number, payload its prior current epoch.
    EpochAck,
    /// coordinator -> replica: full resync; zxid is the coordinator's last
    /// processed sequence number, payload a [`SnapshotPayload`].
    Snapshot,
    /// coordinator -> replica: synchronization complete marker at `(epoch, 0)`.
    NewLeader,
    /// replica -> coordinator: generic acknowledgment of the zxid; epoch-ack,
    /// new-leader-ack, or proposal-ack depending on phase.
    Ack,
    /// coordinator -> replica: replicate a pending transaction.
    Proposal,
    /// coordinator -> replica: the transaction at this zxid is
    /// quorum-committed, apply now.
    Commit,
    /// coordinator -> replica: broadcast phase is active.
    UpToDate,
    /// either direction: liveness.
    Ping,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::ReplicaInfo => "REPLICA_INFO",
            PacketKind::EpochInfo => "EPOCH_INFO",
            PacketKind::EpochAck => "EPOCH_ACK",
            PacketKind::Snapshot => "SNAPSHOT",
            PacketKind::NewLeader => "NEW_LEADER",
            PacketKind::Ack => "ACK",
            PacketKind::Proposal => "PROPOSAL",
            PacketKind::Commit => "COMMIT",
            PacketKind::UpToDate => "UP_TO_DATE",
            PacketKind::Ping => "PING",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub zxid: Zxid,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, zxid: Zxid, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            zxid,
            payload: payload.into(),
        }
    }

    pub fn replica_info(replica_id: NodeId, last_accepted: Epoch) -> Result<Self> {
        let info = ReplicaInfo {
            protocol_version: PROTOCOL_VERSION,
            replica_id,
        };
        Ok(Self::new(
            PacketKind::ReplicaInfo,
            Zxid::new(last_accepted, 0),
            bincode::serialize(&info)?,
        ))
    }

    pub fn epoch_info(epoch: Epoch) -> Result<Self> {
        Ok(Self::new(
            PacketKind::EpochInfo,
            Zxid::new(epoch, 0),
            bincode::serialize(&PROTOCOL_VERSION)?,
        ))
    }

    pub fn epoch_ack(prior_current: Epoch, last_zxid: Zxid) -> Result<Self> {
        Ok(Self::new(
            PacketKind::EpochAck,
            last_zxid,
            bincode::serialize(&prior_current)?,
        ))
    }

    pub fn snapshot(snapshot: Snapshot) -> Result<Self> {
        let at = snapshot.last_zxid;
        let payload = SnapshotPayload {
            snapshot,
            signature: SNAPSHOT_SIGNATURE.to_string(),
        };
        Ok(Self::new(
            PacketKind::Snapshot,
            at,
            bincode::serialize(&payload)?,
        ))
    }

    pub fn new_leader(epoch: Epoch) -> Self {
        Self::new(PacketKind::NewLeader, Zxid::new(epoch, 0), Bytes::new())
    }

    pub fn ack(zxid: Zxid) -> Self {
        Self::new(PacketKind::Ack, zxid, Bytes::new())
    }

    pub fn proposal(txn: &Transaction) -> Self {
        Self::new(PacketKind::Proposal, txn.zxid, txn.payload.clone())
    }

    pub fn commit(zxid: Zxid) -> Self {
        Self::new(PacketKind::Commit, zxid, Bytes::new())
    }

    pub fn up_to_date() -> Self {
        Self::new(PacketKind::UpToDate, Zxid::default(), Bytes::new())
    }

    pub fn ping() -> Self {
        Self::new(PacketKind::Ping, Zxid::default(), Bytes::new())
    }

    /// Decode the bincode payload of a handshake packet.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Fail with a protocol violation unless this packet has the expected
    /// kind.
    pub fn expect(self, kind: PacketKind) -> Result<Self> {
        if self.kind == kind {
            Ok(self)
        } else {
            Err(ChorusError::protocol(format!(
                "expected {} but received {}",
                kind, self.kind
            )))
        }
    }

    /// View the proposal payload as a transaction.
    pub fn to_transaction(&self) -> Transaction {
        Transaction::new(self.zxid, self.payload.clone())
    }
}

/// Discovery record sent by a replica when it first connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub protocol_version: u32,
    pub replica_id: NodeId,
}

/// Snapshot packet payload: the serialized store plus the trailing signature
/// string the replica validates before restoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot: Snapshot,
    pub signature: String,
}

impl SnapshotPayload {
    pub fn verify_signature(&self) -> Result<()> {
        if self.signature == SNAPSHOT_SIGNATURE {
            Ok(())
        } else {
            Err(ChorusError::protocol(format!(
                "bad snapshot signature {:?}",
                self.signature
            )))
        }
    }
}

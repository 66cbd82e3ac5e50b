//! # Chorus Core
//!
//! Shared building blocks for the Chorus recovery-and-broadcast protocol: the
//! coordinator and its replicas agree on a monotonically ordered epoch,
//! transfer state until every replica holds an identical history, then
//! replicate further updates with majority-acknowledged commit.
//!
//! This crate carries no protocol state machines of its own; it provides:
//!
//! - **Types**: [`NodeId`], [`Epoch`], the packed [`Zxid`] sequence number,
//!   [`Transaction`], [`StateSummary`]
//! - **Wire protocol**: [`messages::Packet`] records and the length-prefixed
//!   [`wire`] codec for duplex peer streams
//! - **Quorum**: the pure [`quorum::QuorumVerifier`] predicate and static
//!   ensemble membership
//! - **Storage seams**: [`storage::EpochStore`], [`storage::TransactionLog`],
//!   [`storage::SnapshotStore`], and [`storage::StateMachine`], implemented by
//!   `chorus-persistence` and `chorus-kvstore`
//! - **Errors**: the [`ChorusError`] taxonomy separating connection-local from
//!   peer-fatal failures
//!
//! The coordinator side lives in `chorus-coordinator`, the replica side in
//! `chorus-replica`.

pub mod error;
pub mod messages;
pub mod quorum;
pub mod storage;
pub mod types;
pub mod wire;

pub use error::*;
pub use messages::{Packet, PacketKind, ReplicaInfo};
pub use types::*;

//! # Chorus Coordinator
//!
//! The coordinator side of the Chorus protocol. A coordinator establishes a
//! new epoch with a quorum of replicas, synchronizes each replica's history
//! to its own, and then drives the quorum-committed broadcast stream.
//!
//! ## Architecture
//!
//! - [`Coordinator`] holds the shared protocol state: the establishment
//!   barriers, the ordered table of outstanding proposals, and the outbound
//!   channels of connected replicas.
//! - [`ReplicaHandler`] owns one replica connection and walks it through the
//!   establishment handshake before relaying the broadcast stream.
//! - [`QuorumBarrier`] is the waiting primitive behind establishment: votes
//!   accumulate until the coordinator plus a quorum have registered, then
//!   every waiter wakes with the decision.
//!
//! The coordinator's own vote is required by every barrier. A quorum of
//! replicas connecting to a coordinator that never calls
//! [`Coordinator::establish`] waits out its timeout and gives up.

pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod handler;

pub use barrier::QuorumBarrier;
pub use config::ProtocolConfig;
pub use coordinator::{Coordinator, SyncPlan};
pub use handler::ReplicaHandler;

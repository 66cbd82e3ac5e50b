//! # Chorus Replica
//!
//! The replica side of the Chorus protocol. A [`ReplicaDriver`] connects to
//! the coordinator, negotiates the new epoch, catches up through a snapshot
//! or a committed log suffix, and then logs, acknowledges, and applies the
//! broadcast stream.
//!
//! Two persistence rules protect recovery:
//!
//! - The accepted epoch is persisted before the epoch acknowledgment is sent,
//!   so a restarting replica never re-accepts an older epoch.
//! - The current epoch is persisted before the new-leader marker is
//!   acknowledged, so a quorum of acknowledgments implies a quorum of
//!   replicas already carrying the new epoch.

pub mod config;
pub mod driver;

pub use config::ReplicaConfig;
pub use driver::ReplicaDriver;

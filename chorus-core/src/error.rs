//! # Error Types
//!
//! Error taxonomy for the Chorus replication protocol. The variants map onto
//! the propagation policy: connection-local failures (`QuorumTimeout`,
//! `ProtocolViolation`, `Network`) tear down one handler, while
//! `StaleCoordinator` and `Storage` are fatal to the owning peer.

use crate::{NodeId, StateSummary};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChorusError {
    /// Communication failure on a peer connection.
    #[error("network error: {message}")]
    Network { message: String },

    /// The persistence collaborator failed an append/read/snapshot call.
    /// Fatal to the owning peer; it cannot safely continue without durable
    /// history.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// A bounded wait for epoch or new-leader-ack quorum expired. Local to the
    /// caller; the coordinator and other handlers are unaffected.
    #[error("timed out waiting for quorum: {operation}")]
    QuorumTimeout { operation: String },

    /// A replica reported a history ahead of the coordinator's. The
    /// coordinator must not continue serving; it abdicates and re-runs leader
    /// election.
    #[error("replica {replica} has more recent state {summary} than coordinator {ours}")]
    StaleCoordinator {
        replica: NodeId,
        summary: StateSummary,
        ours: StateSummary,
    },

    /// Unexpected message type, order, or sequence number from a peer. Fatal
    /// to that connection only.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Wire or persisted record could not be encoded/decoded.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// File system or socket I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer is shutting down; barrier waiters and handler loops unwind
    /// with this.
    #[error("shutting down")]
    Shutdown,

    /// Unexpected internal condition.
    #[error("internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, ChorusError>;

impl ChorusError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn quorum_timeout(operation: impl Into<String>) -> Self {
        Self::QuorumTimeout {
            operation: operation.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True if this condition must bring down the whole peer rather than a
    /// single connection.
    pub fn is_fatal_to_peer(&self) -> bool {
        matches!(
            self,
            Self::StaleCoordinator { .. } | Self::Storage { .. } | Self::Shutdown
        )
    }
}

impl From<bincode::Error> for ChorusError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Epoch, Zxid};

    #[test]
    fn fatality_classification() {
        assert!(ChorusError::storage("disk full").is_fatal_to_peer());
        assert!(ChorusError::StaleCoordinator {
            replica: NodeId::new(2),
            summary: StateSummary::new(Epoch::new(2), Zxid::default()),
            ours: StateSummary::new(Epoch::new(1), Zxid::default()),
        }
        .is_fatal_to_peer());
        assert!(!ChorusError::quorum_timeout("epoch election").is_fatal_to_peer());
        assert!(!ChorusError::protocol("unexpected packet").is_fatal_to_peer());
    }
}

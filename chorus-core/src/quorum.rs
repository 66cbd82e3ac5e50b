//! Quorum predicate and static ensemble membership.

use crate::NodeId;
use std::collections::HashSet;

/// Pure predicate over a set of peer ids: does this set form a quorum of the
/// ensemble? No side effects; callable concurrently without synchronization.
pub trait QuorumVerifier: Send + Sync {
    fn contains_quorum(&self, ids: &HashSet<NodeId>) -> bool;
}

/// Default policy: strict majority of the full, statically configured
/// ensemble.
#[derive(Debug, Clone, Copy)]
pub struct MajorityQuorum {
    ensemble_size: usize,
}

impl MajorityQuorum {
    pub fn new(ensemble_size: usize) -> Self {
        Self { ensemble_size }
    }

    pub fn quorum_size(&self) -> usize {
        self.ensemble_size / 2 + 1
    }
}

impl QuorumVerifier for MajorityQuorum {
    fn contains_quorum(&self, ids: &HashSet<NodeId>) -> bool {
        ids.len() > self.ensemble_size / 2
    }
}

/// Static ensemble membership for one peer: its own id and the full member
/// set.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub node_id: NodeId,
    pub members: HashSet<NodeId>,
}

impl EnsembleConfig {
    pub fn new(node_id: NodeId, mut members: HashSet<NodeId>) -> Self {
        members.insert(node_id);
        Self { node_id, members }
    }

    pub fn verifier(&self) -> MajorityQuorum {
        MajorityQuorum::new(self.members.len())
    }

    pub fn ensemble_size(&self) -> usize {
        self.members.len()
    }
}

//! Quorum barriers for the establishment phase.
//!
//! Each barrier collects votes from connecting replicas and publishes a
//! decision once the voter set contains the coordinator itself plus a quorum
//! of the ensemble. Votes are recorded before the caller starts waiting, so a
//! replica that votes and then disconnects still counts toward the quorum for
//! everyone who arrives later.

use chorus_core::quorum::QuorumVerifier;
use chorus_core::{ChorusError, NodeId, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;

struct BarrierState<T> {
    voters: HashSet<NodeId>,
    decision: Option<T>,
}

/// A one-shot quorum barrier yielding a decision value of type `T`.
///
/// Waiters block on a watch cell rather than polling; the vote that completes
/// the quorum computes the decision under the lock and wakes everyone.
pub struct QuorumBarrier<T> {
    state: Mutex<BarrierState<T>>,
    cell: watch::Sender<bool>,
}

impl<T: Clone> QuorumBarrier<T> {
    pub fn new() -> Self {
        let (cell, _) = watch::channel(false);
        Self {
            state: Mutex::new(BarrierState {
                voters: HashSet::new(),
                decision: None,
            }),
            cell,
        }
    }

    /// Record a vote. The entry outlives the voter: a replica that registers
    /// and then times out waiting still counts for later arrivals.
    pub fn register(&self, voter: NodeId) {
        self.state.lock().voters.insert(voter);
    }

    pub fn voters(&self) -> HashSet<NodeId> {
        self.state.lock().voters.clone()
    }

    pub fn decision(&self) -> Option<T> {
        self.state.lock().decision.clone()
    }

    pub fn is_decided(&self) -> bool {
        self.state.lock().decision.is_some()
    }

    /// Decide if the voter set now contains `coordinator_id` plus a quorum.
    ///
    /// A quorum of replicas alone is not enough: the barrier holds until the
    /// coordinator itself has voted, so a coordinator that never joins leaves
    /// its replicas waiting out their timeout.
    pub fn try_decide<F>(
        &self,
        coordinator_id: NodeId,
        verifier: &dyn QuorumVerifier,
        decide: F,
    ) -> Option<T>
    where
        F: FnOnce(&HashSet<NodeId>) -> T,
    {
        let mut state = self.state.lock();
        if let Some(existing) = &state.decision {
            return Some(existing.clone());
        }
        if !state.voters.contains(&coordinator_id) || !verifier.contains_quorum(&state.voters) {
            return None;
        }
        let value = decide(&state.voters);
        state.decision = Some(value.clone());
        let _ = self.cell.send(true);
        Some(value)
    }

    /// Wait until the barrier decides, up to `timeout`.
    pub async fn wait(&self, timeout: Duration, operation: &str) -> Result<T> {
        let mut rx = self.cell.subscribe();
        loop {
            if let Some(value) = self.decision() {
                return Ok(value);
            }
            match tokio::time::timeout(timeout, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ChorusError::Shutdown),
                Err(_) => return Err(ChorusError::quorum_timeout(operation)),
            }
        }
    }
}

impl<T: Clone> Default for QuorumBarrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

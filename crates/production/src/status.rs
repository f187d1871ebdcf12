//! Copy-on-read consensus status for operators.
//!
//! The runner publishes a [`ConsensusSnapshot`] after every event that
//! produced actions; readers never touch the state machine.

use parking_lot::RwLock;
use pbft::ConsensusSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Shared handle to the latest snapshot. Cheap to clone.
#[derive(Clone)]
pub struct StatusHandle {
    snapshot: Arc<RwLock<Option<ConsensusSnapshot>>>,
    start_time: Instant,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(None)),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn publish(&self, snapshot: ConsensusSnapshot) {
        *self.snapshot.write() = Some(snapshot);
    }

    /// Latest snapshot, or `None` before the runner has started.
    pub fn snapshot(&self) -> Option<ConsensusSnapshot> {
        self.snapshot.read().clone()
    }

    /// JSON-friendly summary for the `/status` endpoint.
    pub fn response(&self) -> Option<NodeStatusResponse> {
        let guard = self.snapshot.read();
        let snapshot = guard.as_ref()?;
        Some(NodeStatusResponse {
            node_id: snapshot.node_id.to_hex(),
            node_index: snapshot.node_index.map(|i| i.0),
            view: snapshot.view.0,
            leader: snapshot.leader.map(|i| i.0),
            committed_index: snapshot.committed_index.0,
            committed_hash: snapshot.committed_hash.to_hex(),
            stable_checkpoint: snapshot.stable_checkpoint.0,
            awaiting_new_view: snapshot.awaiting_new_view,
            pending_slots: snapshot.pending_slots,
            consensus_timeout_ms: snapshot.consensus_timeout.as_millis() as u64,
            consecutive_apply_failures: snapshot.consecutive_apply_failures,
            sealers: snapshot.membership.sealers.len(),
            observers: snapshot.membership.observers.len(),
            quorum: snapshot.membership.quorum,
            total_weight: snapshot.membership.total_weight,
            uptime_secs: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

/// Response for the `/status` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    /// Hex-encoded public key of this node.
    pub node_id: String,
    /// Sealer index, absent for observers.
    pub node_index: Option<u32>,
    pub view: u64,
    /// Leader of the next index in the current view.
    pub leader: Option<u32>,
    pub committed_index: u64,
    pub committed_hash: String,
    pub stable_checkpoint: u64,
    pub awaiting_new_view: bool,
    pub pending_slots: usize,
    pub consensus_timeout_ms: u64,
    pub consecutive_apply_failures: u32,
    pub sealers: usize,
    pub observers: usize,
    pub quorum: u64,
    pub total_weight: u64,
    pub uptime_secs: u64,
    pub version: String,
}

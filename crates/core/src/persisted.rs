//! State that crosses the boundary between the state machine and its runner.

use pbft_messages::PreparedCertificate;
use pbft_types::{BlockNumber, Features, Hash, Keyring, View};

/// Minimum state a node must persist to rejoin consensus safely.
///
/// Restoring `view` prevents a restarted node from voting in a view it has
/// already left; restoring `prepared` preserves the evidence it must carry
/// into the next view change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub view: View,
    pub committed_index: BlockNumber,
    pub committed_hash: Hash,
    pub prepared: Vec<PreparedCertificate>,
}

impl PersistedState {
    pub fn is_genesis(&self) -> bool {
        self.committed_index == BlockNumber::GENESIS && self.view == View(0)
    }
}

/// Everything needed to verify a message's signatures off the state machine thread.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    pub keyring: Keyring,
    pub features: Features,
}

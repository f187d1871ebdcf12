//! Recovery messages used by restarting or lagging nodes.

use crate::VoteMsg;
use pbft_types::signing::{SigningBuffer, DOMAIN_RECOVER_REQUEST, DOMAIN_RECOVER_RESPONSE};
use pbft_types::{BlockNumber, Hash, KeyPair, NodeIndex, Proposal, Signature, View};
use sbor::prelude::BasicSbor;

/// Ask peers for their view and any committed proposals above `index`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RecoverRequestMsg {
    pub view: View,
    /// Requester's committed index.
    pub index: BlockNumber,
    pub from: NodeIndex,
    pub signature: Signature,
}

impl RecoverRequestMsg {
    pub fn new(view: View, index: BlockNumber, from: NodeIndex, key: &KeyPair) -> Self {
        let mut msg = Self {
            view,
            index,
            from,
            signature: Signature::empty(),
        };
        msg.signature = key.sign(&msg.signing_bytes());
        msg
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(DOMAIN_RECOVER_REQUEST)
            .view(self.view)
            .index(self.index)
            .node(self.from)
            .finish()
    }
}

/// A committed proposal together with the Commit quorum that finalized it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct CommittedProposal {
    pub proposal: Proposal,
    pub commits: Vec<VoteMsg>,
}

/// Responder's view, committed height and retained committed proposals.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct RecoverResponseMsg {
    pub view: View,
    pub index: BlockNumber,
    pub hash: Hash,
    pub from: NodeIndex,
    pub committed: Vec<CommittedProposal>,
    pub signature: Signature,
}

impl RecoverResponseMsg {
    pub fn new(
        view: View,
        index: BlockNumber,
        hash: Hash,
        from: NodeIndex,
        committed: Vec<CommittedProposal>,
        key: &KeyPair,
    ) -> Self {
        let mut msg = Self {
            view,
            index,
            hash,
            from,
            committed,
            signature: Signature::empty(),
        };
        msg.signature = key.sign(&msg.signing_bytes());
        msg
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = SigningBuffer::new(DOMAIN_RECOVER_RESPONSE)
            .view(self.view)
            .index(self.index)
            .hash(&self.hash)
            .node(self.from)
            .u64(self.committed.len() as u64);
        for cp in &self.committed {
            buf = buf.index(cp.proposal.index).hash(&cp.proposal.hash);
        }
        buf.finish()
    }
}

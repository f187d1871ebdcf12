//! Normal-case messages: PrePrepare and the phase votes.

use pbft_types::signing::{SigningBuffer, DOMAIN_PRE_PREPARE, DOMAIN_VOTE};
use pbft_types::{BlockNumber, Hash, KeyPair, NodeIndex, Phase, Proposal, Signature, View};
use sbor::prelude::BasicSbor;

/// Leader's announcement of a proposal for `(view, index)`.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PrePrepareMsg {
    pub view: View,
    pub index: BlockNumber,
    pub hash: Hash,
    pub from: NodeIndex,
    pub proposal: Proposal,
    /// Set when the pre-prepare is re-issued inside a NewView.
    pub generated_from_new_view: bool,
    pub signature: Signature,
}

impl PrePrepareMsg {
    pub fn new(
        view: View,
        proposal: Proposal,
        from: NodeIndex,
        generated_from_new_view: bool,
        key: &KeyPair,
    ) -> Self {
        let mut msg = Self {
            view,
            index: proposal.index,
            hash: proposal.hash,
            from,
            proposal,
            generated_from_new_view,
            signature: Signature::empty(),
        };
        msg.signature = key.sign(&msg.signing_bytes());
        msg
    }

    /// Binds the payload digest so the leader cannot swap block contents
    /// under a signed hash.
    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(DOMAIN_PRE_PREPARE)
            .view(self.view)
            .index(self.index)
            .hash(&self.hash)
            .node(self.from)
            .bool(self.generated_from_new_view)
            .hash(&Hash::from_bytes(&self.proposal.payload))
            .finish()
    }
}

/// A Prepare, Commit or CheckPoint vote.
///
/// For CheckPoint votes `hash` is the execution result hash rather than the
/// proposal hash, and `view` is informational only.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct VoteMsg {
    pub phase: Phase,
    pub view: View,
    pub index: BlockNumber,
    pub hash: Hash,
    pub from: NodeIndex,
    pub signature: Signature,
}

impl VoteMsg {
    pub fn new(
        phase: Phase,
        view: View,
        index: BlockNumber,
        hash: Hash,
        from: NodeIndex,
        key: &KeyPair,
    ) -> Self {
        let mut vote = Self {
            phase,
            view,
            index,
            hash,
            from,
            signature: Signature::empty(),
        };
        vote.signature = key.sign(&vote.signing_bytes());
        vote
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(DOMAIN_VOTE)
            .u8(self.phase.as_u8())
            .view(self.view)
            .index(self.index)
            .hash(&self.hash)
            .node(self.from)
            .finish()
    }
}

//! Block proposals.

use crate::signing::{SigningBuffer, DOMAIN_PROPOSAL};
use crate::{BlockNumber, Hash, KeyPair, NodeIndex, Signature, View};
use sbor::prelude::BasicSbor;

/// A proposed block at a consensus index.
///
/// The payload is opaque to consensus. Identity is `(index, hash)`: two
/// proposals at the same index with different hashes conflict, and at most
/// one of them may ever commit.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Proposal {
    pub index: BlockNumber,
    /// View in which the proposal was first generated.
    pub view: View,
    pub hash: Hash,
    pub payload: Vec<u8>,
    /// Number of transactions in the payload, checked against the ledger limit.
    pub tx_count: u64,
    pub generated_from: NodeIndex,
    /// Generator's signature over [`Proposal::signing_bytes`].
    pub signature: Signature,
}

impl Proposal {
    /// Build and sign a proposal.
    pub fn new(
        index: BlockNumber,
        view: View,
        hash: Hash,
        payload: Vec<u8>,
        tx_count: u64,
        generated_from: NodeIndex,
        key: &KeyPair,
    ) -> Self {
        let mut proposal = Self {
            index,
            view,
            hash,
            payload,
            tx_count,
            generated_from,
            signature: Signature::empty(),
        };
        proposal.signature = key.sign(&proposal.signing_bytes());
        proposal
    }

    /// Excludes the view: a re-proposal in a later view keeps the
    /// generator's original signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        SigningBuffer::new(DOMAIN_PROPOSAL)
            .index(self.index)
            .hash(&self.hash)
            .node(self.generated_from)
            .u64(self.tx_count)
            .finish()
    }
}

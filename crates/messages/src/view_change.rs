//! View change messages and the prepared evidence they carry.

use crate::{PrePrepareMsg, VoteMsg};
use pbft_types::signing::{SigningBuffer, DOMAIN_NEW_VIEW, DOMAIN_VIEW_CHANGE};
use pbft_types::{BlockNumber, Hash, KeyPair, NodeIndex, Signature, View};
use sbor::prelude::BasicSbor;

/// Proof that a proposal reached Prepare quorum in some view: the leader's
/// pre-prepare plus a quorum of matching Prepare votes.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct PreparedCertificate {
    pub pre_prepare: PrePrepareMsg,
    pub prepares: Vec<VoteMsg>,
}

impl PreparedCertificate {
    pub fn view(&self) -> View {
        self.pre_prepare.view
    }

    pub fn index(&self) -> BlockNumber {
        self.pre_prepare.index
    }

    pub fn hash(&self) -> Hash {
        self.pre_prepare.hash
    }
}

/// Vote to move to `to_view`, carrying the sender's committed height and
/// every prepared certificate above its stable checkpoint. Certificates for
/// indices the sender already committed are included, so a quorum always
/// carries evidence for anything an honest node may have committed.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ViewChangeMsg {
    pub to_view: View,
    pub committed_index: BlockNumber,
    pub committed_hash: Hash,
    pub prepared: Vec<PreparedCertificate>,
    pub from: NodeIndex,
    pub signature: Signature,
}

impl ViewChangeMsg {
    pub fn new(
        to_view: View,
        committed_index: BlockNumber,
        committed_hash: Hash,
        prepared: Vec<PreparedCertificate>,
        from: NodeIndex,
        key: &KeyPair,
    ) -> Self {
        let mut msg = Self {
            to_view,
            committed_index,
            committed_hash,
            prepared,
            from,
            signature: Signature::empty(),
        };
        msg.signature = key.sign(&msg.signing_bytes());
        msg
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = SigningBuffer::new(DOMAIN_VIEW_CHANGE)
            .view(self.to_view)
            .index(self.committed_index)
            .hash(&self.committed_hash)
            .node(self.from)
            .u64(self.prepared.len() as u64);
        for cert in &self.prepared {
            buf = buf.view(cert.view()).index(cert.index()).hash(&cert.hash());
        }
        buf.finish()
    }
}

/// New leader's announcement of `view`, justified by a quorum of view
/// changes and re-issuing every prepared proposal above their lowest
/// committed height.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewViewMsg {
    pub view: View,
    pub from: NodeIndex,
    pub view_changes: Vec<ViewChangeMsg>,
    pub pre_prepares: Vec<PrePrepareMsg>,
    pub signature: Signature,
}

impl NewViewMsg {
    pub fn new(
        view: View,
        from: NodeIndex,
        view_changes: Vec<ViewChangeMsg>,
        pre_prepares: Vec<PrePrepareMsg>,
        key: &KeyPair,
    ) -> Self {
        let mut msg = Self {
            view,
            from,
            view_changes,
            pre_prepares,
            signature: Signature::empty(),
        };
        msg.signature = key.sign(&msg.signing_bytes());
        msg
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = SigningBuffer::new(DOMAIN_NEW_VIEW)
            .view(self.view)
            .node(self.from)
            .u64(self.view_changes.len() as u64);
        for vc in &self.view_changes {
            buf = buf.node(vc.from).view(vc.to_view).bytes(vc.signature.as_bytes());
        }
        buf = buf.u64(self.pre_prepares.len() as u64);
        for pp in &self.pre_prepares {
            buf = buf.index(pp.index).hash(&pp.hash).bytes(pp.signature.as_bytes());
        }
        buf.finish()
    }

    /// Lowest committed index reported by the embedded view changes.
    pub fn base_index(&self) -> BlockNumber {
        lowest_committed_index(&self.view_changes)
    }
}

/// Lowest committed index among `view_changes`, genesis if empty.
pub fn lowest_committed_index(view_changes: &[ViewChangeMsg]) -> BlockNumber {
    view_changes
        .iter()
        .map(|vc| vc.committed_index)
        .min()
        .unwrap_or_default()
}

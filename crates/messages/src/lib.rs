//! Network messages for the PBFT protocol.
//!
//! Every message carries `{view, index, hash, from, signature}` (a view
//! change reports its target view and its sender's committed index/hash in
//! those slots) and knows the exact bytes its signature covers.

mod consensus;
mod recover;
mod view_change;

pub use consensus::{PrePrepareMsg, VoteMsg};
pub use recover::{CommittedProposal, RecoverRequestMsg, RecoverResponseMsg};
pub use view_change::{lowest_committed_index, NewViewMsg, PreparedCertificate, ViewChangeMsg};

use pbft_types::{BlockNumber, Hash, NodeIndex, Signature, View};
use sbor::prelude::BasicSbor;

/// Message kind, used for dispatch, logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    PrePrepare,
    Prepare,
    Commit,
    CheckPoint,
    ViewChange,
    NewView,
    RecoverRequest,
    RecoverResponse,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::PrePrepare => "pre_prepare",
            PacketType::Prepare => "prepare",
            PacketType::Commit => "commit",
            PacketType::CheckPoint => "checkpoint",
            PacketType::ViewChange => "view_change",
            PacketType::NewView => "new_view",
            PacketType::RecoverRequest => "recover_request",
            PacketType::RecoverResponse => "recover_response",
        }
    }
}

/// A PBFT protocol message.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum PbftMessage {
    PrePrepare(PrePrepareMsg),
    Prepare(VoteMsg),
    Commit(VoteMsg),
    CheckPoint(VoteMsg),
    ViewChange(ViewChangeMsg),
    NewView(NewViewMsg),
    RecoverRequest(RecoverRequestMsg),
    RecoverResponse(RecoverResponseMsg),
}

impl PbftMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PbftMessage::PrePrepare(_) => PacketType::PrePrepare,
            PbftMessage::Prepare(_) => PacketType::Prepare,
            PbftMessage::Commit(_) => PacketType::Commit,
            PbftMessage::CheckPoint(_) => PacketType::CheckPoint,
            PbftMessage::ViewChange(_) => PacketType::ViewChange,
            PbftMessage::NewView(_) => PacketType::NewView,
            PbftMessage::RecoverRequest(_) => PacketType::RecoverRequest,
            PbftMessage::RecoverResponse(_) => PacketType::RecoverResponse,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.packet_type().as_str()
    }

    pub fn view(&self) -> View {
        match self {
            PbftMessage::PrePrepare(m) => m.view,
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => v.view,
            PbftMessage::ViewChange(m) => m.to_view,
            PbftMessage::NewView(m) => m.view,
            PbftMessage::RecoverRequest(m) => m.view,
            PbftMessage::RecoverResponse(m) => m.view,
        }
    }

    pub fn index(&self) -> BlockNumber {
        match self {
            PbftMessage::PrePrepare(m) => m.index,
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => {
                v.index
            }
            PbftMessage::ViewChange(m) => m.committed_index,
            PbftMessage::NewView(m) => m.base_index(),
            PbftMessage::RecoverRequest(m) => m.index,
            PbftMessage::RecoverResponse(m) => m.index,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            PbftMessage::PrePrepare(m) => m.hash,
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => v.hash,
            PbftMessage::ViewChange(m) => m.committed_hash,
            PbftMessage::NewView(_) | PbftMessage::RecoverRequest(_) => Hash::ZERO,
            PbftMessage::RecoverResponse(m) => m.hash,
        }
    }

    pub fn from(&self) -> NodeIndex {
        match self {
            PbftMessage::PrePrepare(m) => m.from,
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => v.from,
            PbftMessage::ViewChange(m) => m.from,
            PbftMessage::NewView(m) => m.from,
            PbftMessage::RecoverRequest(m) => m.from,
            PbftMessage::RecoverResponse(m) => m.from,
        }
    }

    pub fn signature(&self) -> &Signature {
        match self {
            PbftMessage::PrePrepare(m) => &m.signature,
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => {
                &v.signature
            }
            PbftMessage::ViewChange(m) => &m.signature,
            PbftMessage::NewView(m) => &m.signature,
            PbftMessage::RecoverRequest(m) => &m.signature,
            PbftMessage::RecoverResponse(m) => &m.signature,
        }
    }

    /// Bytes covered by the outer signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        match self {
            PbftMessage::PrePrepare(m) => m.signing_bytes(),
            PbftMessage::Prepare(v) | PbftMessage::Commit(v) | PbftMessage::CheckPoint(v) => {
                v.signing_bytes()
            }
            PbftMessage::ViewChange(m) => m.signing_bytes(),
            PbftMessage::NewView(m) => m.signing_bytes(),
            PbftMessage::RecoverRequest(m) => m.signing_bytes(),
            PbftMessage::RecoverResponse(m) => m.signing_bytes(),
        }
    }

    /// Whether the message belongs to the normal-case phases of a single view.
    pub fn is_normal_case(&self) -> bool {
        matches!(
            self,
            PbftMessage::PrePrepare(_) | PbftMessage::Prepare(_) | PbftMessage::Commit(_)
        )
    }
}

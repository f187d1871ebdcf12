//! Consensus phases and equivocation evidence.

use crate::{BlockNumber, Hash, NodeIndex, Signature, View};
use sbor::prelude::BasicSbor;
use std::fmt;

/// Phase a vote or certificate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
pub enum Phase {
    PrePrepare,
    Prepare,
    Commit,
    CheckPoint,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        match self {
            Phase::PrePrepare => 0,
            Phase::Prepare => 1,
            Phase::Commit => 2,
            Phase::CheckPoint => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PrePrepare => "pre_prepare",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::CheckPoint => "checkpoint",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two signed, conflicting statements by the same node for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivocationEvidence {
    pub node: NodeIndex,
    pub index: BlockNumber,
    pub phase: Phase,
    pub view: View,
    pub first: (Hash, Signature),
    pub second: (Hash, Signature),
}

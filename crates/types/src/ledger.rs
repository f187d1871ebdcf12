//! Ledger-side configuration and execution results consumed by consensus.

use crate::{BlockNumber, ConsensusNode, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Versioned behavior toggles.
///
/// A feature is active for every index at or above its activation block, so
/// historical blocks keep being judged by the rules they were produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Rotate leaders in proportion to vote weight instead of plain round robin.
    WeightedLeaderRotation,
    /// Require a valid generator signature on every proposal.
    ProposalSignatureCheck,
}

/// Feature activation heights.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    activations: BTreeMap<Feature, BlockNumber>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: Feature, at: BlockNumber) -> Self {
        self.enable(feature, at);
        self
    }

    pub fn enable(&mut self, feature: Feature, at: BlockNumber) {
        self.activations.insert(feature, at);
    }

    pub fn disable(&mut self, feature: Feature) {
        self.activations.remove(&feature);
    }

    pub fn is_active(&self, feature: Feature, index: BlockNumber) -> bool {
        self.activations
            .get(&feature)
            .is_some_and(|activation| *activation <= index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, BlockNumber)> + '_ {
        self.activations.iter().map(|(f, b)| (*f, *b))
    }
}

/// How the quorum weight is derived from total sealer weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuorumPolicyKind {
    /// `total - floor((total - 1) / 3)`, i.e. 2f+1 of 3f+1.
    #[default]
    Byzantine,
    /// A fixed weighted threshold, capped at the total weight.
    Fixed { weight: u64 },
}

/// Consensus-relevant ledger configuration, polled at epoch boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub membership: Vec<ConsensusNode>,
    pub quorum_policy: QuorumPolicyKind,
    pub block_tx_count_limit: u64,
    /// Number of consecutive indices a leader keeps within a view.
    pub leader_period: u64,
    pub features: Features,
    /// First index this configuration governs.
    pub enable_index: BlockNumber,
}

impl LedgerConfig {
    pub fn new(membership: Vec<ConsensusNode>) -> Self {
        Self {
            membership,
            quorum_policy: QuorumPolicyKind::Byzantine,
            block_tx_count_limit: 1000,
            leader_period: 1,
            features: Features::default(),
            enable_index: BlockNumber(1),
        }
    }
}

/// Result reported by the executor after applying a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationOutcome {
    pub index: BlockNumber,
    /// Digest of the post-execution state; checkpoints agree on this value.
    pub result_hash: Hash,
}

/// Errors from the external executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

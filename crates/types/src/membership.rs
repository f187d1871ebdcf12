//! Consensus membership: sealers that vote and observers that follow.

use crate::{NodeId, NodeIndex, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors from validating a membership set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("membership has no sealers")]
    NoSealers,

    #[error("duplicate node {0}")]
    DuplicateNode(NodeId),

    #[error("sealer {0} has zero weight")]
    ZeroWeight(NodeId),

    #[error("enable index {enable} is not after committed index {committed}")]
    EnableIndexPassed { enable: u64, committed: u64 },
}

/// Role of a node in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Votes in every phase.
    Sealer,
    /// Receives consensus traffic but never votes.
    Observer,
}

/// A member of the consensus set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusNode {
    pub node_id: NodeId,
    pub weight: u64,
    pub node_type: NodeType,
}

impl ConsensusNode {
    pub fn sealer(node_id: NodeId, weight: u64) -> Self {
        Self {
            node_id,
            weight,
            node_type: NodeType::Sealer,
        }
    }

    pub fn observer(node_id: NodeId) -> Self {
        Self {
            node_id,
            weight: 0,
            node_type: NodeType::Observer,
        }
    }
}

/// A validated membership set.
///
/// Sealers are sorted by node id so every node derives the same
/// [`NodeIndex`] assignment from the same configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    sealers: Vec<ConsensusNode>,
    observers: Vec<ConsensusNode>,
    total_weight: u64,
}

impl Membership {
    pub fn new(nodes: Vec<ConsensusNode>) -> Result<Self, MembershipError> {
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.node_id) {
                return Err(MembershipError::DuplicateNode(node.node_id));
            }
            if node.node_type == NodeType::Sealer && node.weight == 0 {
                return Err(MembershipError::ZeroWeight(node.node_id));
            }
        }

        let (mut sealers, mut observers): (Vec<_>, Vec<_>) = nodes
            .into_iter()
            .partition(|n| n.node_type == NodeType::Sealer);
        if sealers.is_empty() {
            return Err(MembershipError::NoSealers);
        }
        sealers.sort_by_key(|n| n.node_id);
        observers.sort_by_key(|n| n.node_id);
        let total_weight = sealers.iter().map(|n| n.weight).sum();

        Ok(Self {
            sealers,
            observers,
            total_weight,
        })
    }

    pub fn sealers(&self) -> &[ConsensusNode] {
        &self.sealers
    }

    pub fn observers(&self) -> &[ConsensusNode] {
        &self.observers
    }

    pub fn sealer_count(&self) -> usize {
        self.sealers.len()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn sealer(&self, index: NodeIndex) -> Option<&ConsensusNode> {
        self.sealers.get(index.as_usize())
    }

    pub fn weight_of(&self, index: NodeIndex) -> u64 {
        self.sealer(index).map(|n| n.weight).unwrap_or(0)
    }

    pub fn index_of(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.sealers
            .iter()
            .position(|n| n.node_id == *node_id)
            .map(|i| NodeIndex(i as u32))
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.index_of(node_id).is_some() || self.observers.iter().any(|n| n.node_id == *node_id)
    }

    /// Voting weight per sealer index.
    pub fn weights(&self) -> BTreeMap<NodeIndex, u64> {
        self.sealers
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeIndex(i as u32), n.weight))
            .collect()
    }

    pub fn keyring(&self) -> Keyring {
        Keyring(
            self.sealers
                .iter()
                .enumerate()
                .map(|(i, n)| (NodeIndex(i as u32), PublicKey::from(n.node_id)))
                .collect(),
        )
    }
}

/// Public keys of the sealers, by index. Handed to signature verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyring(BTreeMap<NodeIndex, PublicKey>);

impl Keyring {
    pub fn get(&self, index: NodeIndex) -> Option<&PublicKey> {
        self.0.get(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

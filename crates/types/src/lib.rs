//! Core types for PBFT consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, ed25519 keys and signatures, signing domains
//! - **Identifiers**: View, BlockNumber, NodeIndex, NodeId
//! - **Consensus types**: Proposal, Phase, Membership, equivocation evidence
//! - **Ledger interface**: LedgerConfig, Features, ApplicationOutcome
//!
//! # Design Philosophy
//!
//! This crate is self-contained. It does not depend on any other workspace
//! crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod ledger;
mod membership;
mod phase;
mod proposal;
pub mod signing;

pub use crypto::{CryptoError, KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{BlockNumber, NodeId, NodeIndex, View};
pub use ledger::{
    ApplicationOutcome, ApplyError, Feature, Features, LedgerConfig, QuorumPolicyKind,
};
pub use membership::{ConsensusNode, Keyring, Membership, MembershipError, NodeType};
pub use phase::{EquivocationEvidence, Phase};
pub use proposal::Proposal;

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic key pair from a seed byte.
    pub fn test_keypair(seed: u8) -> KeyPair {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        bytes[31] = 0xA5;
        KeyPair::from_seed(&bytes).expect("32-byte seed is a valid secret key")
    }

    /// `n` unit-weight sealers. Keys are returned in sealer index order.
    pub fn test_committee(n: u8) -> (Vec<KeyPair>, Vec<ConsensusNode>) {
        test_weighted_committee(&vec![1; n as usize])
    }

    /// Sealers with the given weights. Keys are returned in sealer index order,
    /// so `keys[i]` signs as `NodeIndex(i)`.
    pub fn test_weighted_committee(weights: &[u64]) -> (Vec<KeyPair>, Vec<ConsensusNode>) {
        let mut keys: Vec<KeyPair> = (0..weights.len())
            .map(|i| test_keypair(i as u8 + 1))
            .collect();
        keys.sort_by_key(|k| k.node_id());
        let nodes = keys
            .iter()
            .zip(weights)
            .map(|(k, w)| ConsensusNode::sealer(k.node_id(), *w))
            .collect();
        (keys, nodes)
    }
}

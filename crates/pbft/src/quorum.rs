//! Quorum certificate accounting.
//!
//! Votes are tracked per `(index, phase)`. Each node contributes at most one
//! vote per slot and view; a second vote for a different hash is
//! equivocation and is recorded as evidence, never merged. Quorum is
//! edge-triggered: [`VoteOutcome::QuorumReached`] is returned exactly once
//! per certificate.

use pbft_messages::VoteMsg;
use pbft_types::{
    BlockNumber, EquivocationEvidence, Hash, NodeIndex, Phase, Signature, View,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of adding a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Counted, quorum not (or already) reached.
    Added,
    /// The node already voted for this hash.
    DuplicateIgnored,
    /// The node already voted for a different hash in this view.
    Equivocation(Box<EquivocationEvidence>),
    /// This vote pushed the hash over the quorum threshold.
    QuorumReached,
    /// The slot is already finalized for a different hash.
    ConflictIgnored,
    /// Vote for an older view than the certificate being collected.
    Stale,
}

/// A quorum of signatures for one hash at `(index, phase)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub index: BlockNumber,
    pub phase: Phase,
    pub view: View,
    pub hash: Hash,
    pub signatures: Vec<(NodeIndex, Signature)>,
}

impl QuorumCertificate {
    /// Rebuild the signed vote messages that make up this certificate.
    pub fn votes(&self) -> Vec<VoteMsg> {
        self.signatures
            .iter()
            .map(|(node, signature)| VoteMsg {
                phase: self.phase,
                view: self.view,
                index: self.index,
                hash: self.hash,
                from: *node,
                signature: signature.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Certificate {
    view: View,
    votes: BTreeMap<NodeIndex, (Hash, Signature)>,
    weight_by_hash: BTreeMap<Hash, u64>,
    reached: Option<Hash>,
}

impl Certificate {
    fn new(view: View) -> Self {
        Self {
            view,
            ..Default::default()
        }
    }

    fn retally(&mut self, weights: &BTreeMap<NodeIndex, u64>) {
        self.weight_by_hash.clear();
        for (node, (hash, _)) in &self.votes {
            let weight = weights.get(node).copied().unwrap_or(0);
            *self.weight_by_hash.entry(*hash).or_default() += weight;
        }
    }
}

/// Vote store for every in-flight `(index, phase)`.
#[derive(Debug, Default)]
pub struct QuorumStore {
    certificates: BTreeMap<(BlockNumber, Phase), Certificate>,
    /// Indices whose Commit certificate reached quorum; their hash is final.
    finalized: BTreeMap<BlockNumber, Hash>,
    weights: BTreeMap<NodeIndex, u64>,
    threshold: u64,
    equivocations: Vec<EquivocationEvidence>,
}

impl QuorumStore {
    pub fn new(weights: BTreeMap<NodeIndex, u64>, threshold: u64) -> Self {
        Self {
            weights,
            threshold,
            ..Default::default()
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Install new voting weights.
    ///
    /// In-flight certificates that are not finalized are dropped only when the
    /// threshold changes; otherwise they are re-tallied under the new weights.
    /// Returns whether anything was dropped.
    pub fn set_membership(&mut self, weights: BTreeMap<NodeIndex, u64>, threshold: u64) -> bool {
        let threshold_changed = threshold != self.threshold;
        self.weights = weights;
        self.threshold = threshold;

        if threshold_changed {
            self.certificates.retain(|_, cert| cert.reached.is_some());
        }
        for cert in self.certificates.values_mut() {
            cert.retally(&self.weights);
        }
        threshold_changed
    }

    /// Count a vote.
    pub fn add_vote(
        &mut self,
        index: BlockNumber,
        phase: Phase,
        view: View,
        hash: Hash,
        node: NodeIndex,
        signature: Signature,
    ) -> VoteOutcome {
        if phase == Phase::Commit {
            if let Some(final_hash) = self.finalized.get(&index) {
                if *final_hash != hash {
                    debug!(
                        index = index.0,
                        node = node.0,
                        "Ignoring commit vote conflicting with finalized index"
                    );
                    return VoteOutcome::ConflictIgnored;
                }
            }
        }

        let weight = self.weights.get(&node).copied().unwrap_or(0);
        let threshold = self.threshold;
        let cert = self
            .certificates
            .entry((index, phase))
            .or_insert_with(|| Certificate::new(view));

        if view < cert.view {
            return VoteOutcome::Stale;
        }
        if view > cert.view && phase != Phase::CheckPoint {
            // Votes from an older view do not combine with this one.
            let keep_final = phase == Phase::Commit && cert.reached.is_some();
            if !keep_final {
                *cert = Certificate::new(view);
            }
        }

        if let Some((existing, first_sig)) = cert.votes.get(&node) {
            if *existing == hash {
                return VoteOutcome::DuplicateIgnored;
            }
            let evidence = EquivocationEvidence {
                node,
                index,
                phase,
                view,
                first: (*existing, first_sig.clone()),
                second: (hash, signature),
            };
            warn!(
                index = index.0,
                phase = %phase,
                node = node.0,
                first = %existing,
                second = %hash,
                "Equivocating vote"
            );
            self.equivocations.push(evidence.clone());
            return VoteOutcome::Equivocation(Box::new(evidence));
        }

        cert.votes.insert(node, (hash, signature));
        let accumulated = cert.weight_by_hash.entry(hash).or_default();
        *accumulated += weight;
        let accumulated = *accumulated;

        if cert.reached.is_none() && accumulated >= threshold && threshold > 0 {
            cert.reached = Some(hash);
            if phase == Phase::Commit {
                self.finalized.insert(index, hash);
            }
            debug!(
                index = index.0,
                phase = %phase,
                weight = accumulated,
                threshold,
                "Quorum reached"
            );
            return VoteOutcome::QuorumReached;
        }
        VoteOutcome::Added
    }

    /// The hash that reached quorum at `(index, phase)`, if any.
    pub fn reached(&self, index: BlockNumber, phase: Phase) -> Option<Hash> {
        self.certificates
            .get(&(index, phase))
            .and_then(|c| c.reached)
    }

    pub fn is_finalized(&self, index: BlockNumber) -> Option<Hash> {
        self.finalized.get(&index).copied()
    }

    /// Certificate for the hash that reached quorum at `(index, phase)`.
    pub fn certificate_for(&self, index: BlockNumber, phase: Phase) -> Option<QuorumCertificate> {
        let cert = self.certificates.get(&(index, phase))?;
        let hash = cert.reached?;
        let signatures = cert
            .votes
            .iter()
            .filter(|(_, (h, _))| *h == hash)
            .map(|(node, (_, sig))| (*node, sig.clone()))
            .collect();
        Some(QuorumCertificate {
            index,
            phase,
            view: cert.view,
            hash,
            signatures,
        })
    }

    /// Accumulated weight for `hash` at `(index, phase)`.
    pub fn weight_for(&self, index: BlockNumber, phase: Phase, hash: &Hash) -> u64 {
        self.certificates
            .get(&(index, phase))
            .and_then(|c| c.weight_by_hash.get(hash).copied())
            .unwrap_or(0)
    }

    /// Drop everything at or below a stable index.
    pub fn evict(&mut self, index: BlockNumber) {
        self.certificates.retain(|(i, _), _| *i > index);
        self.finalized.retain(|i, _| *i > index);
        self.equivocations.retain(|e| e.index > index);
    }

    /// Drop non-finalized Prepare/Commit certificates collected in views below `view`.
    pub fn evict_view(&mut self, view: View) {
        let finalized = &self.finalized;
        self.certificates.retain(|(index, phase), cert| match phase {
            Phase::CheckPoint | Phase::PrePrepare => true,
            Phase::Commit if finalized.contains_key(index) => true,
            _ => cert.view >= view,
        });
    }

    /// Evidence of every equivocation seen so far.
    pub fn equivocations(&self) -> &[EquivocationEvidence] {
        &self.equivocations
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

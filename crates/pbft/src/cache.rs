//! Pending proposal cache.
//!
//! One slot per in-flight index. Slots move `PrePrepared → Prepared →
//! Committed` and are released once their checkpoint is stable. Prepared
//! evidence lives beside the slots so it survives the slot reset that
//! accompanies a view change.

use pbft_messages::{CommittedProposal, PrePrepareMsg, PreparedCertificate, VoteMsg};
use pbft_types::{BlockNumber, Hash, Proposal, Signature, View};
use std::collections::{BTreeMap, VecDeque};

/// Progress of a single index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    PrePrepared,
    Prepared,
    Committed,
}

/// Everything known about one index.
#[derive(Debug, Clone)]
pub struct Slot {
    pub pre_prepare: PrePrepareMsg,
    pub phase: SlotPhase,
    /// Commit quorum, once reached.
    pub commits: Vec<VoteMsg>,
    pub applied: bool,
    pub result_hash: Option<Hash>,
}

impl Slot {
    pub fn view(&self) -> View {
        self.pre_prepare.view
    }

    pub fn hash(&self) -> Hash {
        self.pre_prepare.hash
    }

    pub fn proposal(&self) -> &Proposal {
        &self.pre_prepare.proposal
    }
}

/// What happened when a pre-prepare was offered to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new slot was created or an older view's slot replaced.
    Inserted,
    /// Same view, same hash.
    Duplicate,
    /// A different hash for an index that already holds one in this view,
    /// or for an index that is already committed.
    Conflict { existing: Hash },
    /// A later view re-proposed the hash this index already committed.
    /// The slot stays committed; the node votes again in the new view.
    Revote,
    /// The pre-prepare belongs to an older view than the slot.
    Stale,
}

/// Slots keyed by index plus the evidence and history kept across views.
#[derive(Debug, Default)]
pub struct ProposalCache {
    slots: BTreeMap<BlockNumber, Slot>,
    /// Highest-view prepared certificate per index, kept across view changes.
    prepared_evidence: BTreeMap<BlockNumber, PreparedCertificate>,
    /// Recently committed proposals with their commit quorum, for recovery.
    committed_log: VecDeque<CommittedProposal>,
    committed_log_retention: usize,
}

impl ProposalCache {
    pub fn new(committed_log_retention: usize) -> Self {
        Self {
            committed_log_retention,
            ..Default::default()
        }
    }

    /// Offer a pre-prepare for its index.
    pub fn insert(&mut self, pre_prepare: PrePrepareMsg) -> InsertOutcome {
        let index = pre_prepare.index;
        let Some(slot) = self.slots.get_mut(&index) else {
            self.slots.insert(index, new_slot(pre_prepare));
            return InsertOutcome::Inserted;
        };

        if pre_prepare.view < slot.view() {
            return InsertOutcome::Stale;
        }
        if pre_prepare.hash != slot.hash() {
            if pre_prepare.view == slot.view() || slot.phase == SlotPhase::Committed {
                return InsertOutcome::Conflict {
                    existing: slot.hash(),
                };
            }
            *slot = new_slot(pre_prepare);
            return InsertOutcome::Inserted;
        }
        if pre_prepare.view == slot.view() {
            return InsertOutcome::Duplicate;
        }
        if slot.phase == SlotPhase::Committed {
            slot.pre_prepare = pre_prepare;
            return InsertOutcome::Revote;
        }
        *slot = new_slot(pre_prepare);
        InsertOutcome::Inserted
    }

    pub fn get(&self, index: BlockNumber) -> Option<&Slot> {
        self.slots.get(&index)
    }

    pub fn contains(&self, index: BlockNumber) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn phase(&self, index: BlockNumber) -> Option<SlotPhase> {
        self.slots.get(&index).map(|s| s.phase)
    }

    /// Record the prepare quorum for `index`. Returns false if the slot is
    /// missing, holds another hash, or is already past Prepared.
    pub fn mark_prepared(&mut self, certificate: PreparedCertificate) -> bool {
        let index = certificate.index();
        let Some(slot) = self.slots.get_mut(&index) else {
            return false;
        };
        if slot.hash() != certificate.hash() || slot.phase != SlotPhase::PrePrepared {
            return false;
        }
        slot.phase = SlotPhase::Prepared;
        let replace = self
            .prepared_evidence
            .get(&index)
            .map_or(true, |existing| existing.view() <= certificate.view());
        if replace {
            self.prepared_evidence.insert(index, certificate);
        }
        true
    }

    /// Record the commit quorum for `index`.
    pub fn mark_committed(&mut self, index: BlockNumber, hash: Hash, commits: Vec<VoteMsg>) -> bool {
        let Some(slot) = self.slots.get_mut(&index) else {
            return false;
        };
        if slot.hash() != hash || slot.phase == SlotPhase::Committed {
            return false;
        }
        slot.phase = SlotPhase::Committed;
        slot.commits = commits;
        true
    }

    /// Insert a proposal that was committed elsewhere and proven by a commit
    /// quorum. The slot's pre-prepare carries no leader signature and is never
    /// re-broadcast.
    pub fn insert_committed(&mut self, proposal: Proposal, view: View, commits: Vec<VoteMsg>) {
        let index = proposal.index;
        let pre_prepare = PrePrepareMsg {
            view,
            index,
            hash: proposal.hash,
            from: proposal.generated_from,
            proposal,
            generated_from_new_view: false,
            signature: Signature::empty(),
        };
        let mut slot = new_slot(pre_prepare);
        slot.phase = SlotPhase::Committed;
        slot.commits = commits;
        self.slots.insert(index, slot);
    }

    /// The committed, not yet applied proposal directly above `committed_index`.
    pub fn next_to_apply(&self, committed_index: BlockNumber) -> Option<&Proposal> {
        self.slots
            .get(&committed_index.next())
            .filter(|s| s.phase == SlotPhase::Committed && !s.applied)
            .map(|s| s.proposal())
    }

    /// Mark `index` applied and append it to the committed log.
    pub fn mark_applied(&mut self, index: BlockNumber, result_hash: Hash) -> Option<&Slot> {
        let slot = self.slots.get_mut(&index)?;
        slot.applied = true;
        slot.result_hash = Some(result_hash);

        self.committed_log.push_back(CommittedProposal {
            proposal: slot.pre_prepare.proposal.clone(),
            commits: slot.commits.clone(),
        });
        while self.committed_log.len() > self.committed_log_retention {
            self.committed_log.pop_front();
        }
        Some(&*slot)
    }

    /// Highest-view prepared certificate held for `index`.
    pub fn prepared(&self, index: BlockNumber) -> Option<&PreparedCertificate> {
        self.prepared_evidence.get(&index)
    }

    /// Prepared certificates for indices above `index`, for a view change.
    pub fn prepared_above(&self, index: BlockNumber) -> Vec<PreparedCertificate> {
        self.prepared_evidence
            .range(index.next()..)
            .map(|(_, cert)| cert.clone())
            .collect()
    }

    /// Adopt prepared evidence restored from persistence.
    pub fn restore_prepared(&mut self, certificates: Vec<PreparedCertificate>) {
        for cert in certificates {
            self.prepared_evidence.insert(cert.index(), cert);
        }
    }

    /// Up to `limit` committed proposals above `index`, oldest first.
    pub fn committed_above(&self, index: BlockNumber, limit: usize) -> Vec<CommittedProposal> {
        self.committed_log
            .iter()
            .filter(|cp| cp.proposal.index > index)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop every slot that has not committed. Prepared evidence is kept.
    pub fn reset_for_view(&mut self) {
        self.slots.retain(|_, slot| slot.phase == SlotPhase::Committed);
    }

    /// Release slots and evidence at or below a stable checkpoint. Evidence
    /// for applied indices is kept until then.
    pub fn evict(&mut self, index: BlockNumber) {
        self.slots.retain(|i, slot| *i > index || !slot.applied);
        self.prepared_evidence.retain(|i, _| *i > index);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = (&BlockNumber, &Slot)> {
        self.slots.iter()
    }
}

fn new_slot(pre_prepare: PrePrepareMsg) -> Slot {
    Slot {
        pre_prepare,
        phase: SlotPhase::PrePrepared,
        commits: Vec::new(),
        applied: false,
        result_hash: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::test_utils::test_keypair;
    use pbft_types::{NodeIndex, Phase};

    fn pre_prepare(view: u64, index: u64, tag: &[u8]) -> PrePrepareMsg {
        let key = test_keypair(1);
        let proposal = Proposal::new(
            BlockNumber(index),
            View(view),
            Hash::from_bytes(tag),
            tag.to_vec(),
            1,
            NodeIndex(0),
            &key,
        );
        PrePrepareMsg::new(View(view), proposal, NodeIndex(0), false, &key)
    }

    fn prepared(pp: &PrePrepareMsg) -> PreparedCertificate {
        PreparedCertificate {
            pre_prepare: pp.clone(),
            prepares: vec![],
        }
    }

    #[test]
    fn test_conflicting_pre_prepare_in_same_view() {
        let mut cache = ProposalCache::new(10);
        assert_eq!(cache.insert(pre_prepare(0, 1, b"a")), InsertOutcome::Inserted);
        assert_eq!(cache.insert(pre_prepare(0, 1, b"a")), InsertOutcome::Duplicate);
        assert!(matches!(
            cache.insert(pre_prepare(0, 1, b"b")),
            InsertOutcome::Conflict { .. }
        ));
        assert_eq!(cache.get(BlockNumber(1)).unwrap().hash(), Hash::from_bytes(b"a"));
    }

    #[test]
    fn test_later_view_replaces_uncommitted_slot() {
        let mut cache = ProposalCache::new(10);
        cache.insert(pre_prepare(0, 1, b"a"));
        assert_eq!(cache.insert(pre_prepare(1, 1, b"b")), InsertOutcome::Inserted);
        assert_eq!(cache.insert(pre_prepare(0, 1, b"a")), InsertOutcome::Stale);
    }

    #[test]
    fn test_committed_slot_revotes_on_same_hash() {
        let mut cache = ProposalCache::new(10);
        let pp = pre_prepare(0, 1, b"a");
        cache.insert(pp.clone());
        cache.mark_prepared(prepared(&pp));
        assert!(cache.mark_committed(BlockNumber(1), pp.hash, vec![]));

        assert_eq!(cache.insert(pre_prepare(1, 1, b"a")), InsertOutcome::Revote);
        assert_eq!(cache.phase(BlockNumber(1)), Some(SlotPhase::Committed));
        assert!(matches!(
            cache.insert(pre_prepare(2, 1, b"b")),
            InsertOutcome::Conflict { .. }
        ));
    }

    #[test]
    fn test_prepared_evidence_survives_view_reset() {
        let mut cache = ProposalCache::new(10);
        let pp = pre_prepare(0, 2, b"a");
        cache.insert(pp.clone());
        assert!(cache.mark_prepared(prepared(&pp)));

        cache.reset_for_view();
        assert!(cache.is_empty());
        let evidence = cache.prepared_above(BlockNumber(1));
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].hash(), pp.hash);
    }

    #[test]
    fn test_apply_in_order_and_committed_log() {
        let mut cache = ProposalCache::new(1);
        for i in 1..=2 {
            let pp = pre_prepare(0, i, &[i as u8]);
            cache.insert(pp.clone());
            cache.mark_prepared(prepared(&pp));
            let commit = VoteMsg::new(
                Phase::Commit,
                View(0),
                BlockNumber(i),
                pp.hash,
                NodeIndex(0),
                &test_keypair(1),
            );
            cache.mark_committed(BlockNumber(i), pp.hash, vec![commit]);
        }

        assert_eq!(cache.next_to_apply(BlockNumber(1)).unwrap().index, BlockNumber(2));
        assert_eq!(cache.next_to_apply(BlockNumber(0)).unwrap().index, BlockNumber(1));
        cache.mark_applied(BlockNumber(1), Hash::from_bytes(b"r1"));
        cache.mark_applied(BlockNumber(2), Hash::from_bytes(b"r2"));

        // Retention of one keeps only the latest.
        let log = cache.committed_above(BlockNumber(0), 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].proposal.index, BlockNumber(2));
        assert_eq!(log[0].commits.len(), 1);

        // Applying keeps the prepared evidence until the checkpoint is stable.
        assert_eq!(cache.prepared_above(BlockNumber(0)).len(), 2);
        cache.evict(BlockNumber(2));
        assert!(cache.is_empty());
        assert!(cache.prepared(BlockNumber(2)).is_none());
    }
}

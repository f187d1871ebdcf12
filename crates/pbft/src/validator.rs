//! Stateless message admission and signature checks.
//!
//! Admission happens in two steps. [`MessageValidator::check`] runs on the
//! state machine thread against the current view, water mark and leader
//! schedule, and decides whether a message is worth verifying at all.
//! [`MessageValidator::verify_signatures`] then runs on the crypto pool and
//! checks the outer signature plus every signature the message embeds.

use crate::view::ViewConfig;
use pbft_core::VerificationContext;
use pbft_messages::{
    NewViewMsg, PbftMessage, PrePrepareMsg, PreparedCertificate, VoteMsg, ViewChangeMsg,
};
use pbft_types::{BlockNumber, Feature, Hash, Keyring, NodeId, NodeIndex, Phase, Proposal, View};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Why a message was refused. Used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum RejectReason {
    #[error("sender is not a sealer")]
    UnknownSender,

    #[error("transport sender does not match message sender")]
    SenderMismatch,

    #[error("malformed message")]
    Malformed,

    #[error("sender is not the leader")]
    WrongLeader,

    #[error("index beyond water mark")]
    BeyondWaterMark,

    #[error("too many transactions")]
    TooManyTransactions,

    #[error("invalid signature")]
    BadSignature,

    #[error("invalid new view justification")]
    InvalidNewView,

    #[error("commit certificate below quorum")]
    InsufficientQuorum,

    #[error("view change target too far above the current view")]
    ViewTooFar,

    #[error("conflicts with a proposal prepared in an earlier view")]
    ConflictsWithPrepared,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::UnknownSender => "unknown_sender",
            RejectReason::SenderMismatch => "sender_mismatch",
            RejectReason::Malformed => "malformed",
            RejectReason::WrongLeader => "wrong_leader",
            RejectReason::BeyondWaterMark => "beyond_water_mark",
            RejectReason::TooManyTransactions => "too_many_transactions",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::InvalidNewView => "invalid_new_view",
            RejectReason::InsufficientQuorum => "insufficient_quorum",
            RejectReason::ViewTooFar => "view_too_far",
            RejectReason::ConflictsWithPrepared => "conflicts_with_prepared",
        }
    }
}

/// Admission decision for a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
    /// Older view, committed index or stable checkpoint. Dropped quietly.
    Stale,
    /// A normal-case message for a view we have not reached yet.
    Future(View),
}

/// State the admission checks read.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub config: &'a ViewConfig,
    pub committed_index: BlockNumber,
    pub stable_checkpoint: BlockNumber,
    pub water_mark_limit: u64,
    /// How far above the current view a view change may aim.
    pub view_change_window: u64,
}

impl ValidationContext<'_> {
    fn high_water_mark(&self) -> BlockNumber {
        BlockNumber(self.committed_index.0.saturating_add(self.water_mark_limit))
    }

    fn view(&self) -> View {
        self.config.current_view()
    }
}

/// What a validated NewView asks the node to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewViewPlan {
    pub view: View,
    /// Lowest committed index in the view-change quorum.
    pub base_index: BlockNumber,
    /// Highest committed index that a weak quorum of the view changes
    /// reports. Indices up to here are filled by recovery, not proposed.
    pub recover_to: BlockNumber,
    /// Re-proposals for every prepared index above `base_index`.
    pub pre_prepares: Vec<PrePrepareMsg>,
}

pub struct MessageValidator;

impl MessageValidator {
    /// Stateful admission check, before any signature work.
    pub fn check(from: &NodeId, msg: &PbftMessage, ctx: &ValidationContext<'_>) -> Verdict {
        let Some(sender) = ctx.config.index_of(from) else {
            return Verdict::Reject(RejectReason::UnknownSender);
        };
        if sender != msg.from() {
            return Verdict::Reject(RejectReason::SenderMismatch);
        }

        match msg {
            PbftMessage::PrePrepare(pp) => Self::check_pre_prepare(pp, ctx),
            PbftMessage::Prepare(vote) => Self::check_vote(vote, Phase::Prepare, ctx),
            PbftMessage::Commit(vote) => Self::check_vote(vote, Phase::Commit, ctx),
            PbftMessage::CheckPoint(vote) => {
                if vote.phase != Phase::CheckPoint {
                    return Verdict::Reject(RejectReason::Malformed);
                }
                if vote.index <= ctx.stable_checkpoint {
                    return Verdict::Stale;
                }
                if vote.index > ctx.high_water_mark() {
                    return Verdict::Reject(RejectReason::BeyondWaterMark);
                }
                Verdict::Accept
            }
            PbftMessage::ViewChange(vc) => {
                if vc.to_view <= ctx.view() {
                    return Verdict::Stale;
                }
                if vc.to_view.0 > ctx.view().0.saturating_add(ctx.view_change_window) {
                    return Verdict::Reject(RejectReason::ViewTooFar);
                }
                if vc.committed_index > ctx.high_water_mark() {
                    return Verdict::Reject(RejectReason::BeyondWaterMark);
                }
                if !Self::prepared_shape_ok(vc) {
                    return Verdict::Reject(RejectReason::Malformed);
                }
                Verdict::Accept
            }
            PbftMessage::NewView(nv) => {
                if nv.view <= ctx.view() {
                    return Verdict::Stale;
                }
                let high = ctx.high_water_mark();
                if nv.view_changes.iter().any(|vc| vc.committed_index > high) {
                    return Verdict::Reject(RejectReason::BeyondWaterMark);
                }
                let base = nv.base_index();
                if !ctx.config.is_leader(nv.from, nv.view, base.next()) {
                    return Verdict::Reject(RejectReason::WrongLeader);
                }
                Verdict::Accept
            }
            PbftMessage::RecoverRequest(_) => Verdict::Accept,
            PbftMessage::RecoverResponse(resp) => {
                let shape_ok = resp.committed.iter().all(|cp| {
                    cp.commits.iter().all(|c| {
                        c.phase == Phase::Commit
                            && c.index == cp.proposal.index
                            && c.hash == cp.proposal.hash
                    })
                });
                if shape_ok {
                    Verdict::Accept
                } else {
                    Verdict::Reject(RejectReason::Malformed)
                }
            }
        }
    }

    fn check_pre_prepare(pp: &PrePrepareMsg, ctx: &ValidationContext<'_>) -> Verdict {
        if pp.proposal.index != pp.index || pp.proposal.hash != pp.hash {
            return Verdict::Reject(RejectReason::Malformed);
        }
        if !pp.generated_from_new_view && pp.proposal.generated_from != pp.from {
            return Verdict::Reject(RejectReason::Malformed);
        }
        if pp.view < ctx.view() {
            return Verdict::Stale;
        }
        if pp.view > ctx.view() {
            return Verdict::Future(pp.view);
        }
        if pp.index <= ctx.committed_index {
            return Verdict::Stale;
        }
        if pp.index > ctx.high_water_mark() {
            return Verdict::Reject(RejectReason::BeyondWaterMark);
        }
        if !ctx.config.is_leader(pp.from, pp.view, pp.index) {
            return Verdict::Reject(RejectReason::WrongLeader);
        }
        if pp.proposal.tx_count > ctx.config.block_tx_count_limit() {
            return Verdict::Reject(RejectReason::TooManyTransactions);
        }
        Verdict::Accept
    }

    fn check_vote(vote: &VoteMsg, expected: Phase, ctx: &ValidationContext<'_>) -> Verdict {
        if vote.phase != expected {
            return Verdict::Reject(RejectReason::Malformed);
        }
        if vote.view < ctx.view() {
            return Verdict::Stale;
        }
        if vote.view > ctx.view() {
            return Verdict::Future(vote.view);
        }
        if vote.index <= ctx.committed_index {
            return Verdict::Stale;
        }
        if vote.index > ctx.high_water_mark() {
            return Verdict::Reject(RejectReason::BeyondWaterMark);
        }
        Verdict::Accept
    }

    /// Every prepared certificate must come from an earlier view and consist
    /// of prepares that match its pre-prepare. At most one per index.
    fn prepared_shape_ok(vc: &ViewChangeMsg) -> bool {
        let mut seen = BTreeSet::new();
        vc.prepared.iter().all(|cert| {
            let pp = &cert.pre_prepare;
            cert.view() < vc.to_view
                && seen.insert(cert.index())
                && pp.proposal.hash == pp.hash
                && cert.prepares.iter().all(|p| {
                    p.phase == Phase::Prepare
                        && p.view == pp.view
                        && p.index == pp.index
                        && p.hash == pp.hash
                })
        })
    }

    /// Verify the outer signature and every nested signature.
    pub fn verify_signatures(msg: &PbftMessage, ctx: &VerificationContext) -> bool {
        if !verify_by(&ctx.keyring, msg.from(), &msg.signing_bytes(), msg.signature()) {
            return false;
        }
        match msg {
            PbftMessage::PrePrepare(pp) => verify_proposal(&pp.proposal, ctx),
            PbftMessage::Prepare(_) | PbftMessage::Commit(_) | PbftMessage::CheckPoint(_) => true,
            PbftMessage::ViewChange(vc) => verify_view_change_contents(vc, ctx),
            PbftMessage::NewView(nv) => verify_new_view_contents(nv, ctx),
            PbftMessage::RecoverRequest(_) => true,
            PbftMessage::RecoverResponse(resp) => resp.committed.iter().all(|cp| {
                verify_proposal(&cp.proposal, ctx)
                    && cp.commits.iter().all(|c| verify_vote(&ctx.keyring, c))
            }),
        }
    }

    /// Check that a NewView is justified by a quorum of view changes and
    /// re-proposes exactly the highest-view prepared proposal per index.
    ///
    /// Signatures are assumed verified.
    pub fn validate_new_view(
        msg: &NewViewMsg,
        ctx: &ValidationContext<'_>,
    ) -> Result<NewViewPlan, RejectReason> {
        let config = ctx.config;
        let mut senders = BTreeSet::new();
        let mut weight = 0u64;
        for vc in &msg.view_changes {
            if vc.to_view != msg.view || !Self::prepared_shape_ok(vc) {
                return Err(RejectReason::InvalidNewView);
            }
            if config.membership().sealer(vc.from).is_none() {
                return Err(RejectReason::UnknownSender);
            }
            if senders.insert(vc.from) {
                weight += config.weight_of(vc.from);
            }
        }
        if weight < config.quorum_size() {
            return Err(RejectReason::InvalidNewView);
        }

        let base_index = msg.base_index();
        if !config.is_leader(msg.from, msg.view, base_index.next()) {
            return Err(RejectReason::WrongLeader);
        }

        let recover_to = committed_by_weak_quorum(&msg.view_changes, config);
        let expected = highest_prepared(&msg.view_changes, base_index, config);
        if expected.len() != msg.pre_prepares.len() {
            return Err(RejectReason::InvalidNewView);
        }
        for pp in &msg.pre_prepares {
            let Some(cert) = expected.get(&pp.index) else {
                return Err(RejectReason::InvalidNewView);
            };
            let matches = pp.view == msg.view
                && pp.from == msg.from
                && pp.generated_from_new_view
                && pp.hash == cert.hash()
                && pp.proposal == cert.pre_prepare.proposal;
            if !matches {
                return Err(RejectReason::InvalidNewView);
            }
        }

        Ok(NewViewPlan {
            view: msg.view,
            base_index,
            recover_to,
            pre_prepares: msg.pre_prepares.clone(),
        })
    }

    /// Weight of distinct sealers behind a set of votes for `hash`.
    pub fn vote_weight(votes: &[VoteMsg], hash: &Hash, config: &ViewConfig) -> u64 {
        let mut seen = BTreeSet::new();
        votes
            .iter()
            .filter(|v| v.hash == *hash && seen.insert(v.from))
            .map(|v| config.weight_of(v.from))
            .sum()
    }
}

/// For each index above `base`, the prepared certificate with the highest
/// view among `view_changes` whose prepares carry a quorum.
pub fn highest_prepared(
    view_changes: &[ViewChangeMsg],
    base: BlockNumber,
    config: &ViewConfig,
) -> BTreeMap<BlockNumber, PreparedCertificate> {
    let mut best: BTreeMap<BlockNumber, PreparedCertificate> = BTreeMap::new();
    for cert in view_changes.iter().flat_map(|vc| vc.prepared.iter()) {
        if cert.index() <= base {
            continue;
        }
        if MessageValidator::vote_weight(&cert.prepares, &cert.hash(), config) < config.quorum_size()
        {
            continue;
        }
        let replace = best
            .get(&cert.index())
            .map_or(true, |existing| cert.view() > existing.view());
        if replace {
            best.insert(cert.index(), cert.clone());
        }
    }
    best
}

/// Highest committed index reported by view changes whose senders together
/// carry weak-quorum weight. At least one honest sender vouches for it.
pub fn committed_by_weak_quorum(
    view_changes: &[ViewChangeMsg],
    config: &ViewConfig,
) -> BlockNumber {
    let mut claims: BTreeMap<NodeIndex, BlockNumber> = BTreeMap::new();
    for vc in view_changes {
        let claim = claims.entry(vc.from).or_default();
        *claim = (*claim).max(vc.committed_index);
    }
    let mut claims: Vec<(BlockNumber, u64)> = claims
        .into_iter()
        .map(|(node, index)| (index, config.weight_of(node)))
        .collect();
    claims.sort_by(|a, b| b.0.cmp(&a.0));

    let mut weight = 0;
    for (index, w) in claims {
        weight += w;
        if weight >= config.weak_quorum_size() {
            return index;
        }
    }
    BlockNumber::GENESIS
}

fn verify_by(keyring: &Keyring, node: NodeIndex, bytes: &[u8], sig: &pbft_types::Signature) -> bool {
    keyring.get(node).is_some_and(|key| key.verify(bytes, sig))
}

fn verify_vote(keyring: &Keyring, vote: &VoteMsg) -> bool {
    verify_by(keyring, vote.from, &vote.signing_bytes(), &vote.signature)
}

fn verify_pre_prepare(pp: &PrePrepareMsg, ctx: &VerificationContext) -> bool {
    verify_by(&ctx.keyring, pp.from, &pp.signing_bytes(), &pp.signature)
        && verify_proposal(&pp.proposal, ctx)
}

fn verify_proposal(proposal: &Proposal, ctx: &VerificationContext) -> bool {
    if !ctx
        .features
        .is_active(Feature::ProposalSignatureCheck, proposal.index)
    {
        return true;
    }
    verify_by(
        &ctx.keyring,
        proposal.generated_from,
        &proposal.signing_bytes(),
        &proposal.signature,
    )
}

fn verify_view_change_contents(vc: &ViewChangeMsg, ctx: &VerificationContext) -> bool {
    vc.prepared.iter().all(|cert| {
        verify_pre_prepare(&cert.pre_prepare, ctx)
            && cert.prepares.iter().all(|p| verify_vote(&ctx.keyring, p))
    })
}

fn verify_new_view_contents(nv: &NewViewMsg, ctx: &VerificationContext) -> bool {
    nv.view_changes.iter().all(|vc| {
        verify_by(&ctx.keyring, vc.from, &vc.signing_bytes(), &vc.signature)
            && verify_view_change_contents(vc, ctx)
    }) && nv.pre_prepares.iter().all(|pp| verify_pre_prepare(pp, ctx))
}

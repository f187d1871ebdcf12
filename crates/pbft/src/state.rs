//! PBFT consensus state machine.

use crate::cache::{InsertOutcome, ProposalCache, SlotPhase};
use crate::config::PbftConfig;
use crate::quorum::{QuorumStore, VoteOutcome};
use crate::recovery::RecoveryState;
use crate::timeout::TimeoutController;
use crate::validator::{
    committed_by_weak_quorum, MessageValidator, NewViewPlan, RejectReason, ValidationContext,
    Verdict,
};
use crate::view::{ViewConfig, ViewSnapshot};
use crate::view_change::{ViewChangeOutcome, ViewChangeState};
use pbft_core::{
    Action, Event, PersistedState, StateMachine, TimerId, VerificationContext,
};
use pbft_messages::{
    NewViewMsg, PbftMessage, PrePrepareMsg, PreparedCertificate, RecoverRequestMsg,
    RecoverResponseMsg, ViewChangeMsg, VoteMsg,
};
use pbft_types::{
    ApplicationOutcome, ApplyError, BlockNumber, EquivocationEvidence, Hash, KeyPair,
    LedgerConfig, MembershipError, NodeId, NodeIndex, Phase, Proposal, Signature, View,
};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

/// Why a local proposal was not turned into a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("not the leader for index {index} in view {view} (leader is {leader:?})")]
    NotLeader {
        index: BlockNumber,
        view: View,
        leader: Option<NodeIndex>,
    },

    #[error("node is not a sealer")]
    NotSealer,

    #[error("view change in progress")]
    ViewChangeInProgress,

    #[error("index {index} is at or below the committed index {committed}")]
    StaleIndex {
        index: BlockNumber,
        committed: BlockNumber,
    },

    #[error("index {index} is beyond the high water mark {high}")]
    BeyondWaterMark { index: BlockNumber, high: BlockNumber },

    #[error("index {0} already has a proposal in this view")]
    AlreadyProposed(BlockNumber),

    #[error("index {0} was prepared in an earlier view and awaits its re-proposal")]
    PreparedEarlier(BlockNumber),

    #[error("index {index} is committed by peers; catching up to {target}")]
    CatchingUp { index: BlockNumber, target: BlockNumber },

    #[error("{count} transactions exceeds the block limit of {limit}")]
    TooManyTransactions { count: u64, limit: u64 },
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PbftStats {
    pub messages_received: u64,
    pub messages_rejected: BTreeMap<RejectReason, u64>,
    pub messages_stale: u64,
    pub messages_buffered: u64,
    pub equivocations: u64,
    /// Consensus timeouts that started (or escalated) a view change.
    pub view_change_requests: u64,
    /// Views adopted after the initial one.
    pub view_changes: u64,
    pub proposals_committed: u64,
    pub apply_failures: u64,
    pub checkpoint_mismatches: u64,
    pub ledger_configs_rejected: u64,
    pub ledger_config_fetch_failures: u64,
    pub recover_requests: u64,
}

/// Copy-on-read view of the engine for status endpoints and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusSnapshot {
    pub node_id: NodeId,
    pub node_index: Option<NodeIndex>,
    pub view: View,
    /// Leader of the next index in the current view.
    pub leader: Option<NodeIndex>,
    pub committed_index: BlockNumber,
    pub committed_hash: Hash,
    pub stable_checkpoint: BlockNumber,
    pub awaiting_new_view: bool,
    pub pending_slots: usize,
    pub consensus_timeout: Duration,
    pub consecutive_apply_failures: u32,
    pub membership: ViewSnapshot,
    pub stats: PbftStats,
}

/// PBFT consensus state machine.
///
/// Drives one ordered sequence of proposals through PrePrepare, Prepare and
/// Commit, applies committed proposals strictly in index order, and recovers
/// from a faulty or slow leader through view changes.
///
/// # State Machine Flow
///
/// 1. Leader: `submit_proposal` → broadcast PrePrepare
/// 2. Sealers: PrePrepare → broadcast Prepare
/// 3. Prepare quorum → `QuorumReached(Prepare)` → broadcast Commit
/// 4. Commit quorum → `QuorumReached(Commit)` → `ApplyProposal`
/// 5. `ProposalApplied` → broadcast CheckPoint, persist, notify
/// 6. CheckPoint quorum → stable checkpoint → evict
pub struct PbftState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    signing_key: KeyPair,
    node_id: NodeId,

    // ═══════════════════════════════════════════════════════════════════════
    // Components
    // ═══════════════════════════════════════════════════════════════════════
    config: PbftConfig,
    view_config: ViewConfig,
    quorum: QuorumStore,
    cache: ProposalCache,
    timeout: TimeoutController,
    view_change: ViewChangeState,
    recovery: RecoveryState,

    /// Keys and features handed to the crypto pool. Rebuilt when the
    /// membership changes.
    verification: Arc<VerificationContext>,

    /// Last ledger configuration accepted, used to skip unchanged polls.
    ledger_config: LedgerConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Progress
    // ═══════════════════════════════════════════════════════════════════════
    committed_index: BlockNumber,
    committed_hash: Hash,
    stable_checkpoint: BlockNumber,

    /// Index handed to the executor and not yet reported back.
    applying: Option<BlockNumber>,

    /// Consecutive failures applying the next index.
    apply_failures: u32,

    /// Consecutive failures fetching the ledger configuration.
    config_fetch_failures: u32,

    /// A view change was broadcast and no NewView adopted yet.
    awaiting_new_view: bool,

    /// Our checkpoint votes that are not yet stable, for re-broadcast.
    own_checkpoints: BTreeMap<BlockNumber, VoteMsg>,

    /// Normal-case messages for views we have not reached yet.
    future_messages: VecDeque<(NodeId, PbftMessage)>,

    // ═══════════════════════════════════════════════════════════════════════
    // Observability
    // ═══════════════════════════════════════════════════════════════════════
    stats: PbftStats,

    /// Current time, as set by the runner.
    now: Duration,
}

impl fmt::Debug for PbftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PbftState")
            .field("node_id", &self.node_id)
            .field("view", &self.view())
            .field("committed_index", &self.committed_index)
            .field("stable_checkpoint", &self.stable_checkpoint)
            .field("awaiting_new_view", &self.awaiting_new_view)
            .field("pending_slots", &self.cache.len())
            .finish()
    }
}

impl PbftState {
    /// Create the state machine.
    ///
    /// `genesis` is the ledger configuration in force at `recovered.committed_index + 1`.
    pub fn new(
        signing_key: KeyPair,
        genesis: LedgerConfig,
        config: PbftConfig,
        recovered: PersistedState,
    ) -> Result<Self, MembershipError> {
        let mut view_config = ViewConfig::new(&genesis)?;
        view_config.set_view(recovered.view);

        let quorum = QuorumStore::new(view_config.membership().weights(), view_config.quorum_size());
        let mut cache = ProposalCache::new(config.committed_log_retention);
        cache.restore_prepared(recovered.prepared);

        let verification = Arc::new(VerificationContext {
            keyring: view_config.keyring(),
            features: view_config.features().clone(),
        });

        Ok(Self {
            node_id: signing_key.node_id(),
            signing_key,
            timeout: TimeoutController::new(config.base_timeout, config.max_timeout),
            recovery: RecoveryState::new(config.recover_interval),
            config,
            view_config,
            quorum,
            cache,
            view_change: ViewChangeState::new(),
            verification,
            ledger_config: genesis,
            committed_index: recovered.committed_index,
            committed_hash: recovered.committed_hash,
            stable_checkpoint: recovered.committed_index,
            applying: None,
            apply_failures: 0,
            config_fetch_failures: 0,
            awaiting_new_view: false,
            own_checkpoints: BTreeMap::new(),
            future_messages: VecDeque::new(),
            stats: PbftStats::default(),
            now: Duration::ZERO,
        })
    }

    /// Start-up actions: arm the consensus timer and ask peers whether we
    /// missed anything while down.
    pub fn initialize(&mut self) -> Vec<Action> {
        let mut actions = self.apply_membership(self.committed_index.next());
        if self.is_sealer() {
            actions.push(self.timeout.arm_current());
            actions.extend(self.request_recovery());
        }
        info!(
            node = %self.node_id,
            index = ?self.self_index(),
            view = self.view().0,
            committed = self.committed_index.0,
            "PBFT state initialized"
        );
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn self_index(&self) -> Option<NodeIndex> {
        self.view_config.index_of(&self.node_id)
    }

    pub fn is_sealer(&self) -> bool {
        self.self_index().is_some()
    }

    pub fn view(&self) -> View {
        self.view_config.current_view()
    }

    pub fn committed_index(&self) -> BlockNumber {
        self.committed_index
    }

    pub fn committed_hash(&self) -> Hash {
        self.committed_hash
    }

    pub fn stable_checkpoint(&self) -> BlockNumber {
        self.stable_checkpoint
    }

    pub fn is_awaiting_new_view(&self) -> bool {
        self.awaiting_new_view
    }

    pub fn config(&self) -> &PbftConfig {
        &self.config
    }

    pub fn view_config(&self) -> &ViewConfig {
        &self.view_config
    }

    pub fn cache(&self) -> &ProposalCache {
        &self.cache
    }

    pub fn quorum_store(&self) -> &QuorumStore {
        &self.quorum
    }

    pub fn stats(&self) -> &PbftStats {
        &self.stats
    }

    pub fn verification_context(&self) -> Arc<VerificationContext> {
        Arc::clone(&self.verification)
    }

    /// State to hand to [`Action::PersistState`].
    pub fn persisted_state(&self) -> PersistedState {
        PersistedState {
            view: self.view(),
            committed_index: self.committed_index,
            committed_hash: self.committed_hash,
            prepared: self.cache.prepared_above(self.committed_index),
        }
    }

    pub fn snapshot(&self) -> ConsensusSnapshot {
        ConsensusSnapshot {
            node_id: self.node_id,
            node_index: self.self_index(),
            view: self.view(),
            leader: self
                .view_config
                .leader_of(self.view(), self.committed_index.next()),
            committed_index: self.committed_index,
            committed_hash: self.committed_hash,
            stable_checkpoint: self.stable_checkpoint,
            awaiting_new_view: self.awaiting_new_view,
            pending_slots: self.cache.len(),
            consensus_timeout: self.timeout.current_timeout(),
            consecutive_apply_failures: self.apply_failures,
            membership: self.view_config.snapshot(),
            stats: self.stats.clone(),
        }
    }

    fn high_water_mark(&self) -> BlockNumber {
        BlockNumber(
            self.committed_index
                .0
                .saturating_add(self.config.water_mark_limit),
        )
    }

    fn validation_context(&self) -> ValidationContext<'_> {
        ValidationContext {
            config: &self.view_config,
            committed_index: self.committed_index,
            stable_checkpoint: self.stable_checkpoint,
            water_mark_limit: self.config.water_mark_limit,
            view_change_window: self.config.view_change_window,
        }
    }

    fn persist(&self) -> Action {
        Action::PersistState {
            state: self.persisted_state(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposal Submission
    // ═══════════════════════════════════════════════════════════════════════════

    /// The lowest index within the water mark that has no proposal yet, if we
    /// lead it in the current view.
    ///
    /// Indices peers already committed are left to recovery, and an index
    /// holding prepared evidence from an earlier view is never proposed afresh.
    pub fn proposable_index(&self) -> Option<BlockNumber> {
        let me = self.self_index()?;
        if self.awaiting_new_view {
            return None;
        }
        let view = self.view();
        let start = self
            .committed_index
            .max(self.recovery.sync_target(&self.view_config));
        (start.0.saturating_add(1)..=self.high_water_mark().0)
            .map(BlockNumber)
            .find(|index| !self.cache.contains(*index))
            .filter(|index| self.cache.prepared(*index).is_none())
            .filter(|index| self.view_config.is_leader(me, view, *index))
    }

    /// Turn a locally built block into a PrePrepare, if we lead `index`.
    #[instrument(skip(self, payload), fields(index = index.0, hash = %hash, tx_count = tx_count))]
    pub fn submit_proposal(
        &mut self,
        payload: Vec<u8>,
        index: BlockNumber,
        hash: Hash,
        tx_count: u64,
    ) -> Result<Vec<Action>, SubmitError> {
        let me = self.self_index().ok_or(SubmitError::NotSealer)?;
        if self.awaiting_new_view {
            return Err(SubmitError::ViewChangeInProgress);
        }
        if index <= self.committed_index {
            return Err(SubmitError::StaleIndex {
                index,
                committed: self.committed_index,
            });
        }
        let high = self.high_water_mark();
        if index > high {
            return Err(SubmitError::BeyondWaterMark { index, high });
        }
        let view = self.view();
        if !self.view_config.is_leader(me, view, index) {
            return Err(SubmitError::NotLeader {
                index,
                view,
                leader: self.view_config.leader_of(view, index),
            });
        }
        if self.cache.contains(index) {
            return Err(SubmitError::AlreadyProposed(index));
        }
        if self.cache.prepared(index).is_some() {
            return Err(SubmitError::PreparedEarlier(index));
        }
        let target = self.recovery.sync_target(&self.view_config);
        if index <= target {
            return Err(SubmitError::CatchingUp { index, target });
        }
        let limit = self.view_config.block_tx_count_limit();
        if tx_count > limit {
            return Err(SubmitError::TooManyTransactions {
                count: tx_count,
                limit,
            });
        }

        let proposal = Proposal::new(index, view, hash, payload, tx_count, me, &self.signing_key);
        let pre_prepare = PrePrepareMsg::new(view, proposal, me, false, &self.signing_key);
        info!(index = index.0, view = view.0, hash = %hash, "Proposing");

        let mut actions = vec![Action::Broadcast {
            message: PbftMessage::PrePrepare(pre_prepare.clone()),
        }];
        actions.extend(self.on_pre_prepare(pre_prepare, false));
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Message Intake
    // ═══════════════════════════════════════════════════════════════════════════

    /// Entry point for a decoded message from the network.
    pub fn on_message_received(&mut self, from: NodeId, message: PbftMessage) -> Vec<Action> {
        self.stats.messages_received += 1;
        self.admit(from, message)
    }

    /// Admission checks, then delegate signature verification.
    fn admit(&mut self, from: NodeId, message: PbftMessage) -> Vec<Action> {
        match MessageValidator::check(&from, &message, &self.validation_context()) {
            Verdict::Accept => {
                if self.awaiting_new_view && message.is_normal_case() {
                    return self.on_stale(&message, "awaiting new view");
                }
                vec![Action::VerifyMessage {
                    from,
                    message,
                    context: Arc::clone(&self.verification),
                }]
            }
            Verdict::Reject(reason) => self.on_rejected(&from, &message, reason),
            Verdict::Stale => self.on_stale(&message, "stale"),
            Verdict::Future(view) => self.buffer_future(from, message, view),
        }
    }

    fn on_stale(&mut self, message: &PbftMessage, why: &'static str) -> Vec<Action> {
        self.stats.messages_stale += 1;
        trace!(
            msg_type = message.type_name(),
            view = message.view().0,
            index = message.index().0,
            from = message.from().0,
            why,
            "Dropping message"
        );
        vec![]
    }

    fn on_rejected(&mut self, from: &NodeId, message: &PbftMessage, reason: RejectReason) -> Vec<Action> {
        *self.stats.messages_rejected.entry(reason).or_default() += 1;
        if reason == RejectReason::BeyondWaterMark {
            // Peers are far ahead of us.
            debug!(
                msg_type = message.type_name(),
                index = message.index().0,
                committed = self.committed_index.0,
                "Message beyond water mark, requesting recovery"
            );
            return self.request_recovery();
        }
        warn!(
            peer = %from,
            msg_type = message.type_name(),
            view = message.view().0,
            index = message.index().0,
            reason = reason.as_str(),
            "Rejected message"
        );
        vec![]
    }

    fn buffer_future(&mut self, from: NodeId, message: PbftMessage, view: View) -> Vec<Action> {
        if self.future_messages.len() >= self.config.max_future_messages {
            self.future_messages.pop_front();
        }
        trace!(
            msg_type = message.type_name(),
            view = view.0,
            current = self.view().0,
            "Buffering message for future view"
        );
        self.future_messages.push_back((from, message));
        self.stats.messages_buffered += 1;
        self.request_recovery()
    }

    fn replay_future(&mut self) -> Vec<Action> {
        let view = self.view();
        let (ready, later): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.future_messages)
            .into_iter()
            .partition(|(_, message)| message.view() <= view);
        self.future_messages = later;
        if !ready.is_empty() {
            debug!(count = ready.len(), view = view.0, "Replaying buffered messages");
        }
        ready
            .into_iter()
            .flat_map(|(from, message)| self.admit(from, message))
            .collect()
    }

    /// Signature verification finished; dispatch the message by type.
    #[instrument(skip(self, message), fields(
        msg_type = message.type_name(),
        view = message.view().0,
        index = message.index().0,
        valid = valid
    ))]
    pub fn on_message_verified(
        &mut self,
        from: NodeId,
        message: PbftMessage,
        valid: bool,
    ) -> Vec<Action> {
        if !valid {
            return self.on_rejected(&from, &message, RejectReason::BadSignature);
        }

        // The view or committed index may have moved while verifying.
        match MessageValidator::check(&from, &message, &self.validation_context()) {
            Verdict::Accept => {}
            Verdict::Reject(reason) => return self.on_rejected(&from, &message, reason),
            Verdict::Stale => return self.on_stale(&message, "stale after verification"),
            Verdict::Future(view) => return self.buffer_future(from, message, view),
        }
        if self.awaiting_new_view && message.is_normal_case() {
            return self.on_stale(&message, "awaiting new view");
        }

        match message {
            PbftMessage::PrePrepare(pp) => self.on_pre_prepare(pp, false),
            PbftMessage::Prepare(vote) | PbftMessage::Commit(vote) => self.on_vote(vote),
            PbftMessage::CheckPoint(vote) => self.on_vote(vote),
            PbftMessage::ViewChange(vc) => self.on_view_change(vc),
            PbftMessage::NewView(nv) => self.on_new_view(nv),
            PbftMessage::RecoverRequest(req) => self.on_recover_request(req),
            PbftMessage::RecoverResponse(resp) => self.on_recover_response(resp),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Normal Case
    // ═══════════════════════════════════════════════════════════════════════════

    /// Accept a pre-prepare into its slot and vote for it.
    ///
    /// `justified` is set only for re-proposals carried by a validated
    /// NewView. Anything else must agree with the proposal this node prepared
    /// for the index in an earlier view, if any.
    #[instrument(skip(self, pp), fields(
        index = pp.index.0,
        view = pp.view.0,
        leader = pp.from.0,
        hash = %pp.hash,
        from_new_view = pp.generated_from_new_view
    ))]
    fn on_pre_prepare(&mut self, pp: PrePrepareMsg, justified: bool) -> Vec<Action> {
        let index = pp.index;
        let hash = pp.hash;
        if index <= self.committed_index && !self.cache.contains(index) {
            trace!("Pre-prepare for applied index");
            return vec![];
        }
        if !justified {
            let prepared = self.cache.prepared(index).map(|c| (c.view(), c.hash()));
            if let Some((prepared_view, prepared_hash)) = prepared {
                if prepared_hash != hash && prepared_view < pp.view {
                    *self
                        .stats
                        .messages_rejected
                        .entry(RejectReason::ConflictsWithPrepared)
                        .or_default() += 1;
                    warn!(
                        prepared = %prepared_hash,
                        prepared_view = prepared_view.0,
                        "Refusing pre-prepare that conflicts with a prepared proposal"
                    );
                    return vec![];
                }
            }
        }

        let (from, view, signature) = (pp.from, pp.view, pp.signature.clone());
        match self.cache.insert(pp) {
            InsertOutcome::Inserted => {
                debug!("Accepted pre-prepare");
                let mut actions = self.cast_vote(Phase::Prepare, index, hash);
                actions.extend(self.advance_slot(index));
                actions
            }
            InsertOutcome::Revote => {
                debug!("Re-voting for committed proposal in new view");
                let mut actions = self.cast_vote(Phase::Prepare, index, hash);
                actions.extend(self.cast_vote(Phase::Commit, index, hash));
                actions
            }
            InsertOutcome::Duplicate => {
                trace!("Duplicate pre-prepare");
                vec![]
            }
            InsertOutcome::Stale => {
                self.stats.messages_stale += 1;
                trace!("Pre-prepare older than slot");
                vec![]
            }
            InsertOutcome::Conflict { existing } => {
                let first_sig = self
                    .cache
                    .get(index)
                    .map(|s| s.pre_prepare.signature.clone())
                    .unwrap_or_else(Signature::empty);
                let evidence = EquivocationEvidence {
                    node: from,
                    index,
                    phase: Phase::PrePrepare,
                    view,
                    first: (existing, first_sig),
                    second: (hash, signature),
                };
                warn!(existing = %existing, "Conflicting pre-prepare from leader");
                self.stats.equivocations += 1;
                vec![Action::ReportEquivocation { evidence }]
            }
        }
    }

    /// Sign, broadcast and count our own vote.
    fn cast_vote(&mut self, phase: Phase, index: BlockNumber, hash: Hash) -> Vec<Action> {
        let Some(me) = self.self_index() else {
            return vec![];
        };
        let vote = VoteMsg::new(phase, self.view(), index, hash, me, &self.signing_key);
        let message = match phase {
            Phase::Prepare => PbftMessage::Prepare(vote.clone()),
            Phase::Commit => PbftMessage::Commit(vote.clone()),
            Phase::CheckPoint | Phase::PrePrepare => PbftMessage::CheckPoint(vote.clone()),
        };
        let mut actions = vec![Action::Broadcast { message }];
        actions.extend(self.on_vote(vote));
        actions
    }

    /// Count a Prepare, Commit or CheckPoint vote.
    fn on_vote(&mut self, vote: VoteMsg) -> Vec<Action> {
        // Checkpoint agreement is on execution results, independent of view.
        let view = match vote.phase {
            Phase::CheckPoint => View(0),
            _ => vote.view,
        };
        let (index, phase, hash) = (vote.index, vote.phase, vote.hash);
        match self
            .quorum
            .add_vote(index, phase, view, hash, vote.from, vote.signature)
        {
            VoteOutcome::QuorumReached => vec![Action::EnqueueInternal {
                event: Event::QuorumReached { index, phase, hash },
            }],
            VoteOutcome::Equivocation(evidence) => {
                self.stats.equivocations += 1;
                vec![Action::ReportEquivocation {
                    evidence: *evidence,
                }]
            }
            VoteOutcome::Added | VoteOutcome::DuplicateIgnored => vec![],
            VoteOutcome::ConflictIgnored | VoteOutcome::Stale => {
                self.stats.messages_stale += 1;
                vec![]
            }
        }
    }

    fn on_quorum_reached(&mut self, index: BlockNumber, phase: Phase, hash: Hash) -> Vec<Action> {
        match phase {
            Phase::Prepare | Phase::Commit => self.advance_slot(index),
            Phase::CheckPoint => self.on_stable_checkpoint(index, hash),
            Phase::PrePrepare => vec![],
        }
    }

    /// Move a slot forward as far as its certificates allow. Idempotent.
    fn advance_slot(&mut self, index: BlockNumber) -> Vec<Action> {
        let Some(slot) = self.cache.get(index) else {
            return vec![];
        };
        let (phase, hash, view) = (slot.phase, slot.hash(), slot.view());
        let pre_prepare = slot.pre_prepare.clone();
        let mut actions = Vec::new();

        if phase == SlotPhase::PrePrepared {
            let prepare_cert = self
                .quorum
                .certificate_for(index, Phase::Prepare)
                .filter(|c| c.hash == hash && c.view == view);
            if let Some(cert) = prepare_cert {
                let prepared = PreparedCertificate {
                    pre_prepare,
                    prepares: cert.votes(),
                };
                if self.cache.mark_prepared(prepared) {
                    info!(index = index.0, view = view.0, hash = %hash, "Prepared");
                    actions.push(self.persist());
                    actions.extend(self.cast_vote(Phase::Commit, index, hash));
                }
            }
        }

        if self.cache.phase(index) != Some(SlotPhase::Committed) {
            let commit_cert = self
                .quorum
                .certificate_for(index, Phase::Commit)
                .filter(|c| c.hash == hash);
            if let Some(cert) = commit_cert {
                if self.cache.mark_committed(index, hash, cert.votes()) {
                    info!(index = index.0, view = cert.view.0, hash = %hash, "Committed");
                    actions.extend(self.try_apply());
                }
            }
        }
        actions
    }

    /// Hand the next committed index to the executor, one at a time.
    fn try_apply(&mut self) -> Vec<Action> {
        if self.applying.is_some() {
            return vec![];
        }
        let Some(proposal) = self.cache.next_to_apply(self.committed_index).cloned() else {
            return vec![];
        };
        self.applying = Some(proposal.index);
        vec![Action::ApplyProposal { proposal }]
    }

    #[instrument(skip(self, outcome), fields(index = outcome.index.0))]
    fn on_proposal_applied(&mut self, outcome: ApplicationOutcome) -> Vec<Action> {
        let index = outcome.index;
        if self.applying != Some(index) {
            warn!(applying = ?self.applying, "Unexpected application result");
            return vec![];
        }
        self.applying = None;
        self.apply_failures = 0;

        let Some(slot) = self.cache.mark_applied(index, outcome.result_hash) else {
            warn!("Applied index has no slot");
            return vec![];
        };
        let proposal = slot.proposal().clone();
        self.committed_index = index;
        self.committed_hash = proposal.hash;
        self.stats.proposals_committed += 1;
        info!(
            hash = %proposal.hash,
            result = %outcome.result_hash,
            tx_count = proposal.tx_count,
            "Proposal applied"
        );

        let mut actions = Vec::new();
        if self.is_sealer() {
            actions.push(self.timeout.on_progress());
        }
        actions.extend(self.cast_checkpoint(index, outcome.result_hash));
        actions.push(self.persist());
        actions.push(Action::NotifyCommitted { proposal, outcome });
        actions.extend(self.apply_membership(index.next()));
        if self.config.epoch_length > 0 && index.0 % self.config.epoch_length == 0 {
            actions.push(Action::FetchLedgerConfig);
        }
        actions.extend(self.try_apply());
        actions
    }

    fn on_proposal_apply_failed(&mut self, index: BlockNumber, error: ApplyError) -> Vec<Action> {
        if self.applying != Some(index) {
            return vec![];
        }
        self.applying = None;
        self.apply_failures = self.apply_failures.saturating_add(1);
        self.stats.apply_failures += 1;

        let delay = self.config.apply_retry_delay(self.apply_failures);
        warn!(
            index = index.0,
            attempts = self.apply_failures,
            retry_in = ?delay,
            error = %error,
            "Proposal application failed"
        );
        let mut actions = vec![Action::SetTimer {
            id: TimerId::ApplyRetry,
            duration: delay,
        }];
        if self.apply_failures == self.config.apply_alert_threshold {
            error!(
                index = index.0,
                attempts = self.apply_failures,
                "Proposal application keeps failing"
            );
            actions.push(Action::AlertApplyFailure {
                index,
                attempts: self.apply_failures,
                error,
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Checkpoints
    // ═══════════════════════════════════════════════════════════════════════════

    fn cast_checkpoint(&mut self, index: BlockNumber, result_hash: Hash) -> Vec<Action> {
        let Some(me) = self.self_index() else {
            return vec![];
        };
        let vote = VoteMsg::new(
            Phase::CheckPoint,
            self.view(),
            index,
            result_hash,
            me,
            &self.signing_key,
        );
        let mut actions = Vec::new();
        if self.own_checkpoints.is_empty() {
            actions.push(Action::SetTimer {
                id: TimerId::CheckpointResend,
                duration: self.config.checkpoint_resend_interval,
            });
        }
        self.own_checkpoints.insert(index, vote.clone());
        actions.push(Action::Broadcast {
            message: PbftMessage::CheckPoint(vote.clone()),
        });
        actions.extend(self.on_vote(vote));

        // Peers may have agreed on this checkpoint before we applied it.
        if let Some(stable) = self.quorum.reached(index, Phase::CheckPoint) {
            actions.extend(self.on_stable_checkpoint(index, stable));
        }
        actions
    }

    fn on_stable_checkpoint(&mut self, index: BlockNumber, hash: Hash) -> Vec<Action> {
        if index <= self.stable_checkpoint {
            return vec![];
        }
        if index > self.committed_index {
            debug!(
                index = index.0,
                committed = self.committed_index.0,
                "Checkpoint stable ahead of local commit"
            );
            self.recovery.raise_target(index);
            return self.request_recovery();
        }

        let local = self.cache.get(index).and_then(|s| s.result_hash);
        if let Some(local) = local {
            if local != hash {
                self.stats.checkpoint_mismatches += 1;
                error!(
                    index = index.0,
                    local = %local,
                    agreed = %hash,
                    "Local execution result diverges from stable checkpoint"
                );
            }
        }

        self.stable_checkpoint = index;
        self.quorum.evict(index);
        self.cache.evict(index);
        self.own_checkpoints.retain(|i, _| *i > index);
        debug!(index = index.0, result = %hash, "Checkpoint stable");

        if self.own_checkpoints.is_empty() {
            vec![Action::CancelTimer {
                id: TimerId::CheckpointResend,
            }]
        } else {
            vec![]
        }
    }

    fn on_checkpoint_resend(&mut self) -> Vec<Action> {
        if self.own_checkpoints.is_empty() {
            return vec![];
        }
        trace!(count = self.own_checkpoints.len(), "Re-broadcasting checkpoints");
        let mut actions: Vec<Action> = self
            .own_checkpoints
            .values()
            .map(|vote| Action::Broadcast {
                message: PbftMessage::CheckPoint(vote.clone()),
            })
            .collect();
        actions.push(Action::SetTimer {
            id: TimerId::CheckpointResend,
            duration: self.config.checkpoint_resend_interval,
        });
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View Change
    // ═══════════════════════════════════════════════════════════════════════════

    #[instrument(skip(self), fields(view = self.view().0, committed = self.committed_index.0))]
    fn on_consensus_timeout(&mut self) -> Vec<Action> {
        if !self.is_sealer() {
            return vec![];
        }
        if self
            .recovery
            .defer_view_change(self.committed_index, &self.view_config)
        {
            debug!(
                target = self.recovery.sync_target(&self.view_config).0,
                "Consensus timeout while catching up, deferring view change"
            );
            let mut actions = vec![self.timeout.arm_current()];
            actions.extend(self.request_recovery());
            return actions;
        }
        self.stats.view_change_requests += 1;
        let target = self.view_change.next_target(self.view());
        warn!(
            target = target.0,
            timeout = ?self.timeout.current_timeout(),
            "Consensus timeout, requesting view change"
        );
        let mut actions = vec![self.timeout.on_fire()];
        actions.extend(self.broadcast_view_change(target));
        actions
    }

    fn broadcast_view_change(&mut self, target: View) -> Vec<Action> {
        let Some(me) = self.self_index() else {
            return vec![];
        };
        let vote = ViewChangeMsg::new(
            target,
            self.committed_index,
            self.committed_hash,
            self.cache.prepared_above(self.stable_checkpoint),
            me,
            &self.signing_key,
        );
        self.view_change.on_sent(vote.clone());
        self.awaiting_new_view = true;

        let mut actions = vec![Action::Broadcast {
            message: PbftMessage::ViewChange(vote.clone()),
        }];
        actions.extend(self.on_view_change(vote));
        actions
    }

    fn on_view_change(&mut self, vote: ViewChangeMsg) -> Vec<Action> {
        if vote.to_view <= self.view() {
            return vec![];
        }
        match self.view_change.add(vote, &self.view_config) {
            ViewChangeOutcome::Duplicate => vec![],
            ViewChangeOutcome::Added { join } => self.join_view(join),
            ViewChangeOutcome::QuorumReached { view, join } => {
                let mut actions = self.join_view(join);
                actions.push(Action::EnqueueInternal {
                    event: Event::ViewChangeQuorumReached { view },
                });
                actions
            }
        }
    }

    fn join_view(&mut self, join: Option<View>) -> Vec<Action> {
        match join {
            Some(view) if self.is_sealer() => {
                info!(view = view.0, "Joining view change backed by weak quorum");
                self.broadcast_view_change(view)
            }
            _ => vec![],
        }
    }

    fn on_view_change_quorum(&mut self, view: View) -> Vec<Action> {
        if view <= self.view() {
            return vec![];
        }
        let Some(me) = self.self_index() else {
            return vec![];
        };
        let Some(new_view) =
            self.view_change
                .build_new_view(view, &self.view_config, me, &self.signing_key)
        else {
            debug!(view = view.0, "View change quorum reached, waiting for new leader");
            return vec![];
        };

        let plan = NewViewPlan {
            view,
            base_index: new_view.base_index(),
            recover_to: committed_by_weak_quorum(&new_view.view_changes, &self.view_config),
            pre_prepares: new_view.pre_prepares.clone(),
        };
        let mut actions = vec![Action::Broadcast {
            message: PbftMessage::NewView(new_view),
        }];
        actions.extend(self.reach_new_view(plan));
        actions
    }

    fn on_new_view(&mut self, msg: NewViewMsg) -> Vec<Action> {
        let from = msg.from;
        match MessageValidator::validate_new_view(&msg, &self.validation_context()) {
            Ok(plan) => self.reach_new_view(plan),
            Err(reason) => {
                *self.stats.messages_rejected.entry(reason).or_default() += 1;
                warn!(
                    view = msg.view.0,
                    leader = from.0,
                    reason = reason.as_str(),
                    "Rejected new view"
                );
                vec![]
            }
        }
    }

    #[instrument(skip(self, plan), fields(
        view = plan.view.0,
        base_index = plan.base_index.0,
        recover_to = plan.recover_to.0
    ))]
    fn reach_new_view(&mut self, plan: NewViewPlan) -> Vec<Action> {
        let mut actions = self.enter_view(plan.view);
        for pre_prepare in plan.pre_prepares {
            actions.extend(self.on_pre_prepare(pre_prepare, true));
        }
        self.recovery.raise_target(plan.recover_to);
        if plan.recover_to > self.committed_index {
            actions.extend(self.request_recovery());
        }
        actions.extend(self.replay_future());
        actions
    }

    fn enter_view(&mut self, view: View) -> Vec<Action> {
        let old_view = self.view();
        self.view_config.set_view(view);
        self.awaiting_new_view = false;
        self.quorum.evict_view(view);
        self.cache.reset_for_view();
        self.view_change.on_view_adopted(view);
        self.recovery.on_view_adopted(view);
        self.stats.view_changes += 1;
        info!(
            old_view = old_view.0,
            new_view = view.0,
            leader = ?self.view_config.leader_of(view, self.committed_index.next()),
            "Entered new view"
        );

        let mut actions = Vec::new();
        if self.is_sealer() {
            actions.push(self.timeout.arm_current());
        }
        actions.push(self.persist());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════════

    fn request_recovery(&mut self) -> Vec<Action> {
        let Some(me) = self.self_index() else {
            return vec![];
        };
        if !self.recovery.try_request(self.now) {
            return vec![];
        }
        self.stats.recover_requests += 1;
        debug!(
            view = self.view().0,
            committed = self.committed_index.0,
            "Requesting recovery"
        );
        let request = RecoverRequestMsg::new(self.view(), self.committed_index, me, &self.signing_key);
        vec![Action::Broadcast {
            message: PbftMessage::RecoverRequest(request),
        }]
    }

    fn on_recover_request(&mut self, req: RecoverRequestMsg) -> Vec<Action> {
        let Some(me) = self.self_index() else {
            return vec![];
        };
        let Some(peer) = self.view_config.membership().sealer(req.from) else {
            return vec![];
        };
        let to = peer.node_id;
        let committed = self
            .cache
            .committed_above(req.index, self.config.max_recover_batch);
        trace!(
            peer = %to,
            their_index = req.index.0,
            sending = committed.len(),
            "Answering recovery request"
        );
        let response = RecoverResponseMsg::new(
            self.view(),
            self.committed_index,
            self.committed_hash,
            me,
            committed,
            &self.signing_key,
        );
        vec![Action::SendTo {
            to,
            message: PbftMessage::RecoverResponse(response),
        }]
    }

    fn on_recover_response(&mut self, resp: RecoverResponseMsg) -> Vec<Action> {
        self.recovery.record_height(resp.from, resp.index);
        let mut actions = Vec::new();
        if let Some(view) = self
            .recovery
            .record_view(resp.from, resp.view, &self.view_config)
        {
            info!(view = view.0, "Adopting view reported by a quorum of peers");
            actions.extend(self.enter_view(view));
            actions.extend(self.replay_future());
        }

        let mut committed = resp.committed;
        committed.sort_by_key(|cp| cp.proposal.index);
        for cp in committed {
            let index = cp.proposal.index;
            if index <= self.committed_index
                || self.cache.phase(index) == Some(SlotPhase::Committed)
            {
                continue;
            }
            if !RecoveryState::has_commit_quorum(&cp, &self.view_config) {
                *self
                    .stats
                    .messages_rejected
                    .entry(RejectReason::InsufficientQuorum)
                    .or_default() += 1;
                warn!(index = index.0, peer = resp.from.0, "Recovered proposal lacks commit quorum");
                continue;
            }
            let view = cp.commits.first().map_or(cp.proposal.view, |c| c.view);
            info!(index = index.0, hash = %cp.proposal.hash, "Recovered committed proposal");
            self.cache.insert_committed(cp.proposal, view, cp.commits);
        }
        actions.extend(self.try_apply());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Membership
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_ledger_config_fetch_failed(&mut self, error: ApplyError) -> Vec<Action> {
        self.config_fetch_failures = self.config_fetch_failures.saturating_add(1);
        self.stats.ledger_config_fetch_failures += 1;
        let delay = self.config.apply_retry_delay(self.config_fetch_failures);
        warn!(
            attempts = self.config_fetch_failures,
            retry_in = ?delay,
            error = %error,
            "Failed to fetch ledger configuration"
        );
        vec![Action::SetTimer {
            id: TimerId::LedgerConfigRetry,
            duration: delay,
        }]
    }

    fn on_ledger_config_fetched(&mut self, config: LedgerConfig) -> Vec<Action> {
        self.config_fetch_failures = 0;
        if config == self.ledger_config {
            trace!("Ledger configuration unchanged");
            return vec![];
        }
        let enable_index = config.enable_index;
        match self.view_config.schedule(config.clone()) {
            Ok(()) => {
                info!(
                    enable_index = enable_index.0,
                    nodes = config.membership.len(),
                    "Scheduled ledger configuration"
                );
                self.ledger_config = config;
                if enable_index <= self.committed_index.next() {
                    self.apply_membership(self.committed_index.next())
                } else {
                    vec![]
                }
            }
            Err(e) => {
                self.stats.ledger_configs_rejected += 1;
                warn!(error = %e, "Rejected ledger configuration");
                vec![]
            }
        }
    }

    /// Apply a scheduled configuration before processing `next_index`.
    fn apply_membership(&mut self, next_index: BlockNumber) -> Vec<Action> {
        let was_sealer = self.is_sealer();
        let Some(change) = self.view_config.apply_pending(next_index) else {
            return vec![];
        };
        let dropped = self.quorum.set_membership(
            self.view_config.membership().weights(),
            self.view_config.quorum_size(),
        );
        self.verification = Arc::new(VerificationContext {
            keyring: self.view_config.keyring(),
            features: self.view_config.features().clone(),
        });
        debug!(
            quorum_changed = change.quorum_changed(),
            dropped_in_flight = dropped,
            "Membership applied"
        );

        match (was_sealer, self.is_sealer()) {
            (false, true) => vec![self.timeout.arm_current()],
            (true, false) => vec![self.timeout.disarm()],
            _ => vec![],
        }
    }
}

impl StateMachine for PbftState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::ConsensusTimeout => self.on_consensus_timeout(),
            Event::CheckpointResendTimer => self.on_checkpoint_resend(),
            Event::ApplyRetryTimer => self.try_apply(),
            Event::MessageReceived { from, message } => self.on_message_received(from, message),
            Event::SubmitProposal {
                index,
                hash,
                payload,
                tx_count,
            } => match self.submit_proposal(payload, index, hash, tx_count) {
                Ok(actions) => actions,
                Err(e) => {
                    debug!(index = index.0, error = %e, "Proposal not submitted");
                    vec![]
                }
            },
            Event::MessageVerified {
                from,
                message,
                valid,
            } => self.on_message_verified(from, message, valid),
            Event::ProposalApplied { outcome } => self.on_proposal_applied(outcome),
            Event::ProposalApplyFailed { index, error } => {
                self.on_proposal_apply_failed(index, error)
            }
            Event::LedgerConfigFetched { config } => self.on_ledger_config_fetched(config),
            Event::LedgerConfigFetchFailed { error } => self.on_ledger_config_fetch_failed(error),
            Event::LedgerConfigRetryTimer => vec![Action::FetchLedgerConfig],
            Event::QuorumReached { index, phase, hash } => {
                self.on_quorum_reached(index, phase, hash)
            }
            Event::ViewChangeQuorumReached { view } => self.on_view_change_quorum(view),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::test_utils::{test_committee, test_keypair};
    use std::collections::BTreeSet;
    use tracing_test::traced_test;

    /// In-process cluster that executes actions synchronously.
    struct Cluster {
        nodes: Vec<PbftState>,
        keys: Vec<KeyPair>,
        internal: VecDeque<(usize, Event)>,
        queue: VecDeque<(usize, Event)>,
        down: BTreeSet<usize>,
        drop_commits: bool,
        /// Drops a message addressed to the given node when it returns true.
        drop_rule: Option<fn(usize, &PbftMessage) -> bool>,
        failing_apply: BTreeSet<usize>,
        committed: Vec<Vec<BlockNumber>>,
        equivocations: Vec<EquivocationEvidence>,
        timers: Vec<(usize, TimerId)>,
        alerts: usize,
    }

    impl Cluster {
        fn new(n: u8) -> Self {
            let (keys, nodes) = test_committee(n);
            let genesis = LedgerConfig::new(nodes);
            let states = keys
                .iter()
                .map(|k| {
                    PbftState::new(
                        k.clone(),
                        genesis.clone(),
                        PbftConfig::default(),
                        PersistedState::default(),
                    )
                    .unwrap()
                })
                .collect();
            let mut cluster = Self {
                nodes: states,
                keys,
                internal: VecDeque::new(),
                queue: VecDeque::new(),
                down: BTreeSet::new(),
                drop_commits: false,
                drop_rule: None,
                failing_apply: BTreeSet::new(),
                committed: vec![Vec::new(); n as usize],
                equivocations: Vec::new(),
                timers: Vec::new(),
                alerts: 0,
            };
            for i in 0..n as usize {
                let actions = cluster.nodes[i].initialize();
                cluster.process(i, actions);
            }
            cluster.run();
            cluster
        }

        fn position(&self, node_id: &NodeId) -> usize {
            self.nodes
                .iter()
                .position(|n| n.node_id() == *node_id)
                .unwrap()
        }

        fn process(&mut self, node: usize, actions: Vec<Action>) {
            let from = self.nodes[node].node_id();
            for action in actions {
                match action {
                    Action::Broadcast { message } => {
                        for peer in 0..self.nodes.len() {
                            if peer != node {
                                self.queue.push_back((
                                    peer,
                                    Event::MessageReceived {
                                        from,
                                        message: message.clone(),
                                    },
                                ));
                            }
                        }
                    }
                    Action::SendTo { to, message } => {
                        let peer = self.position(&to);
                        self.queue
                            .push_back((peer, Event::MessageReceived { from, message }));
                    }
                    Action::VerifyMessage {
                        from,
                        message,
                        context,
                    } => {
                        let valid = MessageValidator::verify_signatures(&message, &context);
                        self.queue.push_back((
                            node,
                            Event::MessageVerified {
                                from,
                                message,
                                valid,
                            },
                        ));
                    }
                    Action::EnqueueInternal { event } => self.internal.push_back((node, event)),
                    Action::ApplyProposal { proposal } => {
                        let event = if self.failing_apply.contains(&node) {
                            Event::ProposalApplyFailed {
                                index: proposal.index,
                                error: ApplyError::Unavailable("executor offline".into()),
                            }
                        } else {
                            Event::ProposalApplied {
                                outcome: ApplicationOutcome {
                                    index: proposal.index,
                                    result_hash: Hash::from_parts(&[
                                        b"result",
                                        proposal.hash.as_bytes(),
                                    ]),
                                },
                            }
                        };
                        self.queue.push_back((node, event));
                    }
                    Action::NotifyCommitted { proposal, .. } => {
                        self.committed[node].push(proposal.index)
                    }
                    Action::ReportEquivocation { evidence } => self.equivocations.push(evidence),
                    Action::AlertApplyFailure { .. } => self.alerts += 1,
                    Action::SetTimer { id, .. } => self.timers.push((node, id)),
                    Action::CancelTimer { .. }
                    | Action::PersistState { .. }
                    | Action::FetchLedgerConfig => {}
                }
            }
        }

        fn deliver(&mut self, node: usize, event: Event) {
            if self.down.contains(&node) {
                return;
            }
            let actions = self.nodes[node].handle(event);
            self.process(node, actions);
        }

        fn run(&mut self) {
            for _ in 0..100_000 {
                let next = self
                    .internal
                    .pop_front()
                    .or_else(|| self.queue.pop_front());
                let Some((node, event)) = next else {
                    return;
                };
                if let Event::MessageReceived { from, message } = &event {
                    if self.down.contains(&self.position(from)) {
                        continue;
                    }
                    if self.drop_commits && matches!(message, PbftMessage::Commit(_)) {
                        continue;
                    }
                    if self.drop_rule.is_some_and(|rule| rule(node, message)) {
                        continue;
                    }
                }
                self.deliver(node, event);
            }
            panic!("cluster did not quiesce");
        }

        fn propose(&mut self, node: usize, index: u64) -> Result<(), SubmitError> {
            let payload = format!("block-{index}").into_bytes();
            let hash = Hash::from_bytes(&payload);
            let actions =
                self.nodes[node].submit_proposal(payload, BlockNumber(index), hash, 1)?;
            self.process(node, actions);
            self.run();
            Ok(())
        }

        fn fire(&mut self, node: usize, event: Event) {
            self.deliver(node, event);
            self.run();
        }

        fn advance(&mut self, by: Duration) {
            for node in &mut self.nodes {
                let now = node.now();
                node.set_time(now + by);
            }
        }

        fn pre_prepare(&self, leader: usize, index: u64, payload: &[u8]) -> PbftMessage {
            let key = &self.keys[leader];
            let me = NodeIndex(leader as u32);
            let proposal = Proposal::new(
                BlockNumber(index),
                View(0),
                Hash::from_bytes(payload),
                payload.to_vec(),
                1,
                me,
                key,
            );
            PbftMessage::PrePrepare(PrePrepareMsg::new(View(0), proposal, me, false, key))
        }
    }

    #[traced_test]
    #[test]
    fn test_happy_path_commits_and_stabilizes() {
        let mut cluster = Cluster::new(4);
        assert_eq!(cluster.nodes[1].proposable_index(), Some(BlockNumber(1)));
        assert_eq!(cluster.nodes[2].proposable_index(), None);

        cluster.propose(1, 1).unwrap();

        for (i, node) in cluster.nodes.iter().enumerate() {
            assert_eq!(node.committed_index(), BlockNumber(1), "node {i}");
            assert_eq!(node.committed_hash(), Hash::from_bytes(b"block-1"));
            assert_eq!(node.stable_checkpoint(), BlockNumber(1), "node {i}");
            assert!(node.cache().is_empty());
            assert_eq!(cluster.committed[i], vec![BlockNumber(1)]);
        }
        assert!(cluster.equivocations.is_empty());

        // Leadership rotates with the index.
        assert_eq!(cluster.nodes[2].proposable_index(), Some(BlockNumber(2)));
        cluster.propose(2, 2).unwrap();
        assert!(cluster
            .nodes
            .iter()
            .all(|n| n.committed_index() == BlockNumber(2)));
    }

    #[traced_test]
    #[test]
    fn test_leader_crash_triggers_view_change() {
        let mut cluster = Cluster::new(4);
        cluster.down.insert(1);

        cluster.fire(0, Event::ConsensusTimeout);
        assert!(cluster.nodes[0].is_awaiting_new_view());
        assert_eq!(cluster.nodes[0].view(), View(0));

        // The second request gives view 1 weak-quorum support, so node 3
        // joins and the quorum completes.
        cluster.fire(2, Event::ConsensusTimeout);
        for i in [0, 2, 3] {
            let node = &cluster.nodes[i];
            assert_eq!(node.view(), View(1), "node {i}");
            assert!(!node.is_awaiting_new_view());
            assert_eq!(node.stats().view_changes, 1);
        }
        assert_eq!(cluster.nodes[3].stats().view_change_requests, 0);

        // Sealer 2 leads index 1 in view 1.
        assert_eq!(cluster.nodes[2].proposable_index(), Some(BlockNumber(1)));
        cluster.propose(2, 1).unwrap();
        for i in [0, 2, 3] {
            assert_eq!(cluster.nodes[i].committed_index(), BlockNumber(1));
        }
        assert_eq!(cluster.nodes[1].committed_index(), BlockNumber(0));
    }

    #[traced_test]
    #[test]
    fn test_prepared_proposal_survives_view_change() {
        let mut cluster = Cluster::new(4);
        cluster.drop_commits = true;
        cluster.propose(1, 1).unwrap();
        for node in &cluster.nodes {
            assert_eq!(node.committed_index(), BlockNumber(0));
            assert_eq!(node.cache().phase(BlockNumber(1)), Some(SlotPhase::Prepared));
        }

        // The leader goes away before anyone sees a commit quorum.
        cluster.down.insert(1);
        cluster.drop_commits = false;
        cluster.fire(0, Event::ConsensusTimeout);
        cluster.fire(2, Event::ConsensusTimeout);

        // The new leader re-proposes the prepared block and it commits.
        for i in [0, 2, 3] {
            let node = &cluster.nodes[i];
            assert_eq!(node.view(), View(1), "node {i}");
            assert_eq!(node.committed_index(), BlockNumber(1), "node {i}");
            assert_eq!(node.committed_hash(), Hash::from_bytes(b"block-1"));
        }
    }

    #[traced_test]
    #[test]
    fn test_single_commit_survives_view_change() {
        let mut cluster = Cluster::new(4);
        // Only node 0 sees the commit quorum, and recovery answers are late.
        cluster.drop_rule = Some(|to, message| match message {
            PbftMessage::Commit(_) => to != 0,
            PbftMessage::RecoverResponse(_) => true,
            _ => false,
        });
        cluster.propose(1, 1).unwrap();
        assert_eq!(cluster.nodes[0].committed_index(), BlockNumber(1));
        for i in 1..4 {
            assert_eq!(cluster.nodes[i].committed_index(), BlockNumber(0), "node {i}");
        }

        cluster.drop_rule = Some(|_, message| matches!(message, PbftMessage::RecoverResponse(_)));
        cluster.fire(0, Event::ConsensusTimeout);
        cluster.fire(2, Event::ConsensusTimeout);

        // Sealer 2 leads index 1 in view 1 and must re-propose block-1.
        assert!(cluster.propose(2, 1).is_err());
        for (i, node) in cluster.nodes.iter().enumerate() {
            assert_eq!(node.view(), View(1), "node {i}");
            assert_eq!(node.committed_index(), BlockNumber(1), "node {i}");
            assert_eq!(node.committed_hash(), Hash::from_bytes(b"block-1"), "node {i}");
        }
        assert_eq!(cluster.committed[0], vec![BlockNumber(1)]);
        assert!(cluster.equivocations.is_empty());
    }

    #[traced_test]
    #[test]
    fn test_prepared_index_refuses_unjustified_proposal() {
        let mut cluster = Cluster::new(4);
        cluster.drop_commits = true;
        cluster.propose(1, 1).unwrap();
        let original = cluster.nodes[0]
            .cache()
            .prepared(BlockNumber(1))
            .map(|c| c.pre_prepare.proposal.clone())
            .unwrap();

        for i in [0, 2] {
            cluster.nodes[i].enter_view(View(1));
        }
        // The new leader of index 1 may not replace it on its own.
        assert_eq!(cluster.nodes[2].proposable_index(), None);
        assert_eq!(
            cluster.nodes[2]
                .submit_proposal(b"other".to_vec(), BlockNumber(1), Hash::from_bytes(b"other"), 1)
                .unwrap_err(),
            SubmitError::PreparedEarlier(BlockNumber(1))
        );

        let key = &cluster.keys[2];
        let other = Proposal::new(
            BlockNumber(1),
            View(1),
            Hash::from_bytes(b"other"),
            b"other".to_vec(),
            1,
            NodeIndex(2),
            key,
        );
        let fresh = PrePrepareMsg::new(View(1), other, NodeIndex(2), false, key);
        assert!(cluster.nodes[0].on_pre_prepare(fresh, false).is_empty());
        assert!(cluster.nodes[0].cache().get(BlockNumber(1)).is_none());
        assert_eq!(
            cluster.nodes[0].stats().messages_rejected[&RejectReason::ConflictsWithPrepared],
            1
        );

        // The same proposal re-issued by a NewView is voted for.
        let reissued = PrePrepareMsg::new(View(1), original, NodeIndex(2), true, key);
        let actions = cluster.nodes[0].on_pre_prepare(reissued, true);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast {
                message: PbftMessage::Prepare(v)
            } if v.view == View(1) && v.hash == Hash::from_bytes(b"block-1")
        )));
    }

    #[traced_test]
    #[test]
    fn test_timeout_while_catching_up_defers_view_change() {
        let mut cluster = Cluster::new(4);
        cluster.down.insert(3);
        cluster.propose(1, 1).unwrap();
        cluster.propose(2, 2).unwrap();

        // Node 3 learns that peers are ahead but cannot apply yet.
        cluster.down.remove(&3);
        cluster.failing_apply.insert(3);
        cluster.advance(Duration::from_secs(5));
        let actions = cluster.nodes[3].request_recovery();
        cluster.process(3, actions);
        cluster.run();
        assert_eq!(cluster.nodes[3].committed_index(), BlockNumber(0));

        let armed = |cluster: &Cluster| {
            cluster
                .timers
                .iter()
                .filter(|t| **t == (3, TimerId::Consensus))
                .count()
        };
        let before = armed(&cluster);
        cluster.fire(3, Event::ConsensusTimeout);
        assert_eq!(armed(&cluster), before + 1);
        assert_eq!(cluster.nodes[3].stats().view_change_requests, 0);
        assert!(!cluster.nodes[3].is_awaiting_new_view());

        // Catch-up made no progress since, so the next timeout escalates.
        cluster.fire(3, Event::ConsensusTimeout);
        assert_eq!(cluster.nodes[3].stats().view_change_requests, 1);
        assert!(cluster.nodes[3].is_awaiting_new_view());
    }

    #[traced_test]
    #[test]
    fn test_commits_without_leader_votes() {
        let mut cluster = Cluster::new(4);
        let pp = cluster.pre_prepare(1, 1, b"block-1");
        let from = cluster.nodes[1].node_id();
        cluster.down.insert(1);
        for i in [0, 2, 3] {
            cluster.deliver(
                i,
                Event::MessageReceived {
                    from,
                    message: pp.clone(),
                },
            );
        }
        cluster.run();
        for i in [0, 2, 3] {
            assert_eq!(cluster.nodes[i].committed_index(), BlockNumber(1));
        }
    }

    #[traced_test]
    #[test]
    fn test_conflicting_pre_prepare_is_reported() {
        let mut cluster = Cluster::new(4);
        cluster.down.extend([2, 3]);
        let from = cluster.nodes[1].node_id();
        let first = cluster.pre_prepare(1, 1, b"a");
        let second = cluster.pre_prepare(1, 1, b"b");

        cluster.deliver(0, Event::MessageReceived { from, message: first });
        cluster.run();
        cluster.deliver(0, Event::MessageReceived { from, message: second });
        cluster.run();

        assert_eq!(cluster.equivocations.len(), 1);
        let evidence = &cluster.equivocations[0];
        assert_eq!(evidence.node, NodeIndex(1));
        assert_eq!(evidence.phase, Phase::PrePrepare);
        assert_eq!(evidence.first.0, Hash::from_bytes(b"a"));
        assert_eq!(evidence.second.0, Hash::from_bytes(b"b"));
        // The first proposal keeps the slot.
        assert_eq!(
            cluster.nodes[0].cache().get(BlockNumber(1)).map(|s| s.hash()),
            Some(Hash::from_bytes(b"a"))
        );
    }

    #[traced_test]
    #[test]
    fn test_lagging_node_recovers_committed_proposals() {
        let mut cluster = Cluster::new(4);
        cluster.down.insert(3);
        cluster.propose(1, 1).unwrap();
        cluster.propose(2, 2).unwrap();
        assert_eq!(cluster.nodes[0].committed_index(), BlockNumber(2));
        assert_eq!(cluster.nodes[3].committed_index(), BlockNumber(0));

        cluster.down.remove(&3);
        cluster.advance(Duration::from_secs(5));
        let actions = cluster.nodes[3].request_recovery();
        assert_eq!(actions.len(), 1);
        cluster.process(3, actions);
        cluster.run();

        assert_eq!(cluster.nodes[3].committed_index(), BlockNumber(2));
        assert_eq!(cluster.committed[3], vec![BlockNumber(1), BlockNumber(2)]);
        assert_eq!(cluster.nodes[3].committed_hash(), Hash::from_bytes(b"block-2"));
    }

    #[traced_test]
    #[test]
    fn test_apply_failure_retries_and_alerts() {
        let mut cluster = Cluster::new(4);
        cluster.failing_apply.insert(0);
        cluster.propose(1, 1).unwrap();
        assert_eq!(cluster.nodes[0].committed_index(), BlockNumber(0));
        assert!(cluster.timers.contains(&(0, TimerId::ApplyRetry)));

        let threshold = cluster.nodes[0].config().apply_alert_threshold;
        for _ in 1..threshold {
            cluster.fire(0, Event::ApplyRetryTimer);
        }
        assert_eq!(cluster.alerts, 1);
        assert_eq!(cluster.nodes[0].snapshot().consecutive_apply_failures, threshold);

        cluster.failing_apply.clear();
        cluster.fire(0, Event::ApplyRetryTimer);
        assert_eq!(cluster.nodes[0].committed_index(), BlockNumber(1));
        assert_eq!(cluster.nodes[0].snapshot().consecutive_apply_failures, 0);
    }

    #[test]
    fn test_submit_proposal_errors() {
        let mut cluster = Cluster::new(4);
        let hash = Hash::from_bytes(b"x");
        let node = &mut cluster.nodes[1];
        assert_eq!(
            node.submit_proposal(vec![], BlockNumber(0), hash, 1).unwrap_err(),
            SubmitError::StaleIndex {
                index: BlockNumber(0),
                committed: BlockNumber(0)
            }
        );
        assert_eq!(
            node.submit_proposal(vec![], BlockNumber(11), hash, 1).unwrap_err(),
            SubmitError::BeyondWaterMark {
                index: BlockNumber(11),
                high: BlockNumber(10)
            }
        );
        assert_eq!(
            node.submit_proposal(vec![], BlockNumber(1), hash, 1001).unwrap_err(),
            SubmitError::TooManyTransactions {
                count: 1001,
                limit: 1000
            }
        );
        assert!(node.submit_proposal(vec![], BlockNumber(1), hash, 1).is_ok());
        assert_eq!(
            node.submit_proposal(vec![], BlockNumber(1), hash, 1).unwrap_err(),
            SubmitError::AlreadyProposed(BlockNumber(1))
        );
        assert_eq!(
            cluster.nodes[0]
                .submit_proposal(vec![], BlockNumber(1), hash, 1)
                .unwrap_err(),
            SubmitError::NotLeader {
                index: BlockNumber(1),
                view: View(0),
                leader: Some(NodeIndex(1))
            }
        );
    }

    #[traced_test]
    #[test]
    fn test_failed_config_fetch_is_retried_with_backoff() {
        let (keys, nodes) = test_committee(4);
        let genesis = LedgerConfig::new(nodes);
        let mut state = PbftState::new(
            keys[0].clone(),
            genesis.clone(),
            PbftConfig::default(),
            PersistedState::default(),
        )
        .unwrap();
        let fail = |state: &mut PbftState| {
            state.handle(Event::LedgerConfigFetchFailed {
                error: ApplyError::Unavailable("store offline".into()),
            })
        };
        let retry_in = |actions: &[Action]| match actions {
            [Action::SetTimer {
                id: TimerId::LedgerConfigRetry,
                duration,
            }] => *duration,
            other => panic!("unexpected actions {other:?}"),
        };

        assert_eq!(retry_in(&fail(&mut state)), Duration::from_millis(200));
        assert_eq!(retry_in(&fail(&mut state)), Duration::from_millis(400));
        assert!(matches!(
            state.handle(Event::LedgerConfigRetryTimer).as_slice(),
            [Action::FetchLedgerConfig]
        ));
        assert_eq!(state.stats().ledger_config_fetch_failures, 2);

        // A successful fetch resets the backoff.
        state.handle(Event::LedgerConfigFetched { config: genesis });
        assert_eq!(retry_in(&fail(&mut state)), Duration::from_millis(200));
    }

    #[test]
    fn test_observer_cannot_propose() {
        let (_, nodes) = test_committee(4);
        let mut observer = PbftState::new(
            test_keypair(200),
            LedgerConfig::new(nodes),
            PbftConfig::default(),
            PersistedState::default(),
        )
        .unwrap();
        assert!(!observer.is_sealer());
        assert_eq!(observer.proposable_index(), None);
        assert_eq!(
            observer
                .submit_proposal(vec![], BlockNumber(1), Hash::ZERO, 0)
                .unwrap_err(),
            SubmitError::NotSealer
        );
        // Observers never arm the consensus timer.
        assert!(observer
            .initialize()
            .iter()
            .all(|a| !matches!(a, Action::SetTimer { .. })));
    }

    #[test]
    fn test_restores_persisted_view_and_index() {
        let (keys, nodes) = test_committee(4);
        let recovered = PersistedState {
            view: View(3),
            committed_index: BlockNumber(7),
            committed_hash: Hash::from_bytes(b"seven"),
            prepared: vec![],
        };
        let state = PbftState::new(
            keys[0].clone(),
            LedgerConfig::new(nodes),
            PbftConfig::default(),
            recovered.clone(),
        )
        .unwrap();
        assert_eq!(state.view(), View(3));
        assert_eq!(state.committed_index(), BlockNumber(7));
        assert_eq!(state.stable_checkpoint(), BlockNumber(7));
        assert_eq!(state.persisted_state(), recovered);
    }
}

//! Deterministic simulation runner.
//!
//! Each node has its own ledger ([`SimExecutor`]) and its own durable
//! consensus state. When a node emits `Action::ApplyProposal` or
//! `Action::VerifyMessage`, the runner does the work inline and schedules the
//! callback event at the current time.

use crate::event_queue::EventKey;
use crate::executor::SimExecutor;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use pbft::{MessageValidator, PbftConfig, PbftState};
use pbft_core::{Action, Event, PersistedState, StateMachine, TimerId};
use pbft_messages::PbftMessage;
use pbft_types::test_utils::{test_committee, test_keypair};
use pbft_types::{
    ApplicationOutcome, BlockNumber, ConsensusNode, EquivocationEvidence, Hash, KeyPair,
    LedgerConfig, MembershipError, NodeId, Proposal, View,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Scenario parameters.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Unit-weight sealers in the genesis configuration.
    pub sealers: u8,
    /// Nodes that follow consensus without voting.
    pub observers: u8,
    pub pbft: PbftConfig,
    /// `num_nodes` is overwritten with `sealers + observers`.
    pub network: NetworkConfig,
    pub seed: u64,
    /// Submit a block whenever a live node leads a free index.
    pub auto_propose: bool,
    /// Delay between a node becoming able to propose and its submission.
    pub propose_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sealers: 4,
            observers: 0,
            pbft: PbftConfig {
                base_timeout: Duration::from_secs(1),
                max_timeout: Duration::from_secs(8),
                checkpoint_resend_interval: Duration::from_millis(500),
                recover_interval: Duration::from_millis(200),
                ..PbftConfig::default()
            },
            network: NetworkConfig {
                latency: Duration::from_millis(10),
                ..NetworkConfig::default()
            },
            seed: 42,
            auto_propose: true,
            propose_delay: Duration::from_millis(5),
        }
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    /// Events addressed to a crashed node.
    pub events_dropped_crashed: u64,
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Blocks handed to leaders.
    pub proposals_submitted: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    config: SimulationConfig,
    genesis: LedgerConfig,

    /// `None` while a node is crashed.
    nodes: Vec<Option<PbftState>>,
    keys: Vec<KeyPair>,
    node_ids: Vec<NodeId>,
    index_by_id: HashMap<NodeId, NodeIndex>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,
    /// Sequence counter for deterministic ordering.
    sequence: u64,
    now: Duration,

    network: SimulatedNetwork,
    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Maps (node, timer_id) -> event_key for cancellation.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    stats: SimulationStats,

    /// Durable consensus state per node; survives crashes.
    stores: Vec<PersistedState>,
    /// Ledger per node; survives crashes.
    executors: Vec<SimExecutor>,
    /// Committed notifications per node, in delivery order.
    committed: Vec<Vec<(Proposal, ApplicationOutcome)>>,
    equivocations: Vec<(NodeIndex, EquivocationEvidence)>,
    apply_alerts: Vec<(NodeIndex, BlockNumber, u32)>,

    /// Submissions already scheduled, so a slow leader is not handed the
    /// same index twice.
    scheduled_submissions: HashSet<(NodeIndex, View, BlockNumber)>,
    /// Highest index the block producer will hand out.
    propose_until: Option<BlockNumber>,
}

impl SimulationRunner {
    /// Create a runner with every node started from genesis.
    pub fn new(mut config: SimulationConfig) -> Result<Self, MembershipError> {
        let (mut keys, mut members) = test_committee(config.sealers);
        for i in 0..config.observers {
            let key = test_keypair(100 + i);
            members.push(ConsensusNode::observer(key.node_id()));
            keys.push(key);
        }
        let genesis = LedgerConfig::new(members);
        config.network.num_nodes = keys.len() as u32;

        let node_ids: Vec<NodeId> = keys.iter().map(|k| k.node_id()).collect();
        let index_by_id = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as NodeIndex))
            .collect();

        let nodes = keys
            .iter()
            .map(|key| {
                PbftState::new(
                    key.clone(),
                    genesis.clone(),
                    config.pbft.clone(),
                    PersistedState::default(),
                )
                .map(Some)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let num_nodes = nodes.len();
        info!(
            sealers = config.sealers,
            observers = config.observers,
            seed = config.seed,
            "Created simulation runner"
        );

        Ok(Self {
            network: SimulatedNetwork::new(config.network.clone()),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            nodes,
            keys,
            node_ids,
            index_by_id,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            timers: HashMap::new(),
            stats: SimulationStats::default(),
            stores: vec![PersistedState::default(); num_nodes],
            executors: (0..num_nodes)
                .map(|_| SimExecutor::new(genesis.clone()))
                .collect(),
            committed: vec![Vec::new(); num_nodes],
            equivocations: Vec::new(),
            apply_alerts: Vec::new(),
            scheduled_submissions: HashSet::new(),
            propose_until: None,
            genesis,
            config,
        })
    }

    // ─── Accessors ───

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// State machine of a live node.
    pub fn node(&self, index: NodeIndex) -> Option<&PbftState> {
        self.nodes.get(index as usize).and_then(|n| n.as_ref())
    }

    pub fn is_alive(&self, index: NodeIndex) -> bool {
        self.node(index).is_some()
    }

    pub fn key(&self, index: NodeIndex) -> &KeyPair {
        &self.keys[index as usize]
    }

    pub fn node_id(&self, index: NodeIndex) -> NodeId {
        self.node_ids[index as usize]
    }

    pub fn genesis(&self) -> &LedgerConfig {
        &self.genesis
    }

    pub fn executor(&self, index: NodeIndex) -> &SimExecutor {
        &self.executors[index as usize]
    }

    pub fn executor_mut(&mut self, index: NodeIndex) -> &mut SimExecutor {
        &mut self.executors[index as usize]
    }

    /// What `node` last wrote to durable storage.
    pub fn persisted(&self, index: NodeIndex) -> &PersistedState {
        &self.stores[index as usize]
    }

    pub fn committed(&self, index: NodeIndex) -> &[(Proposal, ApplicationOutcome)] {
        &self.committed[index as usize]
    }

    pub fn equivocations(&self) -> &[(NodeIndex, EquivocationEvidence)] {
        &self.equivocations
    }

    pub fn apply_alerts(&self) -> &[(NodeIndex, BlockNumber, u32)] {
        &self.apply_alerts
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Get a mutable reference to the network for partition/loss configuration.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn set_auto_propose(&mut self, enabled: bool) {
        self.config.auto_propose = enabled;
    }

    pub fn set_propose_until(&mut self, index: Option<BlockNumber>) {
        self.propose_until = index;
    }

    /// Make every ledger return `config` from its next fetch onward.
    pub fn set_ledger_config(&mut self, config: LedgerConfig) {
        for executor in &mut self.executors {
            executor.set_ledger_config(config.clone());
        }
    }

    /// Lowest applied index across live nodes.
    pub fn min_applied_index(&self) -> BlockNumber {
        (0..self.nodes.len() as NodeIndex)
            .filter(|i| self.is_alive(*i))
            .map(|i| self.executors[i as usize].applied_index())
            .min()
            .unwrap_or(BlockNumber::GENESIS)
    }

    /// First index at which two nodes committed different proposals.
    pub fn first_disagreement(&self) -> Option<BlockNumber> {
        let mut seen: BTreeMap<BlockNumber, Hash> = BTreeMap::new();
        let mut conflict: Option<BlockNumber> = None;
        for log in &self.committed {
            for (proposal, _) in log {
                let agreed = *seen.entry(proposal.index).or_insert(proposal.hash);
                if agreed != proposal.hash {
                    conflict = Some(conflict.map_or(proposal.index, |c| c.min(proposal.index)));
                }
            }
        }
        conflict
    }

    // ─── Lifecycle ───

    /// Start consensus on every node.
    pub fn initialize(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            self.start_node(index);
        }
    }

    /// Crash a node: its state machine, timers and queued events are lost;
    /// its ledger and persisted state survive.
    pub fn crash_node(&mut self, index: NodeIndex) {
        if self.nodes[index as usize].take().is_none() {
            return;
        }
        let timers: Vec<_> = self
            .timers
            .keys()
            .filter(|(node, _)| *node == index)
            .copied()
            .collect();
        for timer in timers {
            if let Some(key) = self.timers.remove(&timer) {
                self.event_queue.remove(&key);
            }
        }
        self.scheduled_submissions
            .retain(|(node, _, _)| *node != index);
        info!(node = index, time = ?self.now, "Node crashed");
    }

    /// Restart a crashed node from its persisted state and ledger.
    pub fn restart_node(&mut self, index: NodeIndex) -> Result<(), MembershipError> {
        if self.is_alive(index) {
            return Ok(());
        }
        let recovered = self.stores[index as usize].clone();
        info!(
            node = index,
            view = recovered.view.0,
            committed_index = recovered.committed_index.0,
            "Node restarting"
        );
        let state = PbftState::new(
            self.keys[index as usize].clone(),
            self.executors[index as usize].ledger_config(),
            self.config.pbft.clone(),
            recovered,
        )?;
        self.nodes[index as usize] = Some(state);
        self.start_node(index);
        Ok(())
    }

    fn start_node(&mut self, index: NodeIndex) {
        let now = self.now;
        let Some(node) = self.nodes[index as usize].as_mut() else {
            return;
        };
        node.set_time(now);
        let actions = node.initialize();
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(index, action);
        }
        self.maybe_propose(index);
    }

    /// Deliver `message` to `to` as if `from` had sent it, after `delay`.
    ///
    /// Bypasses partitions and loss; used to play a Byzantine node.
    pub fn inject_message(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        message: PbftMessage,
        delay: Duration,
    ) {
        let event = Event::MessageReceived {
            from: self.node_ids[from as usize],
            message,
        };
        self.schedule_event(to, self.now + delay, event);
    }

    /// Schedule an event for a node at `now + delay`.
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    // ─── Event Loop ───

    /// Run simulation until no more events or time limit reached. Time
    /// advances to `end_time` either way.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((key, event)) = self.event_queue.pop_first() {
            if key.time > end_time {
                self.event_queue.insert(key, event);
                break;
            }
            self.now = key.time;
            let node_index = key.node_index;
            if let Some(timer) = timer_id(&event) {
                if self.timers.get(&(node_index, timer)) == Some(&key) {
                    self.timers.remove(&(node_index, timer));
                }
            }

            let now = self.now;
            let Some(node) = self.nodes[node_index as usize].as_mut() else {
                self.stats.events_dropped_crashed += 1;
                continue;
            };

            trace!(time = ?now, node = node_index, event = event.type_name(), "Processing event");
            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;

            node.set_time(now);
            let actions = node.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node_index, action);
            }
            self.maybe_propose(node_index);
        }
        self.now = self.now.max(end_time);
    }

    /// Run in small steps until every live node applied `target` or the
    /// simulated clock passes `deadline`.
    pub fn run_until_applied(&mut self, target: BlockNumber, deadline: Duration) -> bool {
        const STEP: Duration = Duration::from_millis(50);
        while self.now < deadline {
            if self.min_applied_index() >= target {
                return true;
            }
            let next = (self.now + STEP).min(deadline);
            self.run_until(next);
        }
        self.min_applied_index() >= target
    }

    /// Play the block producer for `node` when it leads a free index.
    fn maybe_propose(&mut self, node: NodeIndex) {
        if !self.config.auto_propose {
            return;
        }
        let Some(state) = self.nodes[node as usize].as_ref() else {
            return;
        };
        let Some(index) = state.proposable_index() else {
            return;
        };
        if self.propose_until.is_some_and(|limit| index > limit) {
            return;
        }
        let view = state.view();
        if !self.scheduled_submissions.insert((node, view, index)) {
            return;
        }

        let payload = format!("block-{}-view-{}-node-{}", index.0, view.0, node).into_bytes();
        let event = Event::SubmitProposal {
            index,
            hash: Hash::from_bytes(&payload),
            payload,
            tx_count: 1,
        };
        self.stats.proposals_submitted += 1;
        self.schedule_event(node, self.now + self.config.propose_delay, event);
    }

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        self.try_deliver_message(from, to, message.clone());
                    }
                }
            }

            Action::SendTo { to, message } => match self.index_by_id.get(&to).copied() {
                Some(target) => self.try_deliver_message(from, target, message),
                None => warn!(node = from, peer = %to, "Send to unknown node"),
            },

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let key = self.schedule_event(from, self.now + duration, id.event());
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            // Delegated work executes instantly in simulation
            Action::VerifyMessage {
                from: sender,
                message,
                context,
            } => {
                let valid = MessageValidator::verify_signatures(&message, &context);
                self.schedule_event(
                    from,
                    self.now,
                    Event::MessageVerified {
                        from: sender,
                        message,
                        valid,
                    },
                );
            }

            Action::ApplyProposal { proposal } => {
                let event = match self.executors[from as usize].apply(&proposal) {
                    Ok(outcome) => Event::ProposalApplied { outcome },
                    Err(error) => {
                        debug!(node = from, index = proposal.index.0, %error, "Apply failed");
                        Event::ProposalApplyFailed {
                            index: proposal.index,
                            error,
                        }
                    }
                };
                self.schedule_event(from, self.now, event);
            }

            Action::FetchLedgerConfig => {
                let event = match self.executors[from as usize].fetch_ledger_config() {
                    Ok(config) => Event::LedgerConfigFetched { config },
                    Err(error) => Event::LedgerConfigFetchFailed { error },
                };
                self.schedule_event(from, self.now, event);
            }

            Action::PersistState { state } => {
                self.stores[from as usize] = state;
            }

            Action::NotifyCommitted { proposal, outcome } => {
                debug!(
                    node = from,
                    index = proposal.index.0,
                    hash = %proposal.hash,
                    "Proposal committed"
                );
                self.committed[from as usize].push((proposal, outcome));
            }

            Action::ReportEquivocation { evidence } => {
                warn!(
                    node = from,
                    offender = evidence.node.0,
                    index = evidence.index.0,
                    phase = ?evidence.phase,
                    "Equivocation reported"
                );
                self.equivocations.push((from, evidence));
            }

            Action::AlertApplyFailure {
                index,
                attempts,
                error,
            } => {
                warn!(node = from, index = index.0, attempts, %error, "Apply failure alert");
                self.apply_alerts.push((from, index, attempts));
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Try to deliver a message, accounting for partitions and packet loss.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, message: PbftMessage) {
        // Check partition first (deterministic - doesn't consume RNG)
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return;
        }

        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return;
        }

        let latency = self.network.sample_latency(from, to, &mut self.rng);
        let event = Event::MessageReceived {
            from: self.node_ids[from as usize],
            message,
        };
        self.schedule_event(to, self.now + latency, event);
        self.stats.messages_sent += 1;
    }
}

fn timer_id(event: &Event) -> Option<TimerId> {
    match event {
        Event::ConsensusTimeout => Some(TimerId::Consensus),
        Event::CheckpointResendTimer => Some(TimerId::CheckpointResend),
        Event::ApplyRetryTimer => Some(TimerId::ApplyRetry),
        Event::LedgerConfigRetryTimer => Some(TimerId::LedgerConfigRetry),
        _ => None,
    }
}

//! Production runner.

use crate::codec::encode_message;
use crate::executor::Executor;
use crate::metrics;
use crate::status::StatusHandle;
use crate::storage::{ConsensusStore, MemoryStore, StorageError};
use crate::thread_pools::{ThreadPoolError, ThreadPoolManager};
use crate::timers::TimerManager;
use crate::transport::{InboundHandle, Transport};
use pbft::{MessageValidator, PbftConfig, PbftState, PbftStats, SubmitError};
use pbft_core::{Action, Event, StateMachine};
use pbft_types::{
    ApplicationOutcome, BlockNumber, Hash, KeyPair, LedgerConfig, MembershipError, Proposal,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{instrument, span, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,
    #[error("Send error: {0}")]
    SendError(String),
    #[error("Missing builder field: {0}")]
    MissingField(&'static str),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),
}

/// Errors returned to callers of [`ProposalSubmitter`].
#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("Proposal rejected: {0}")]
    Rejected(#[from] SubmitError),
    #[error("Runner stopped")]
    RunnerStopped,
}

/// Requests from the block producer, answered from inside the event loop.
enum ClientRequest {
    Submit {
        payload: Vec<u8>,
        index: BlockNumber,
        hash: Hash,
        tx_count: u64,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    ProposableIndex {
        reply: oneshot::Sender<Option<BlockNumber>>,
    },
}

/// Handle for shutting down a running PbftRunner.
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Submits locally built blocks to a running [`PbftRunner`].
#[derive(Clone)]
pub struct ProposalSubmitter {
    client_tx: mpsc::Sender<ClientRequest>,
}

impl ProposalSubmitter {
    /// Propose `payload` at `index`. Resolves once the state machine has
    /// accepted or rejected it, not when it commits.
    pub async fn submit_proposal(
        &self,
        payload: Vec<u8>,
        index: BlockNumber,
        hash: Hash,
        tx_count: u64,
    ) -> Result<(), ProposalError> {
        let (reply, rx) = oneshot::channel();
        self.client_tx
            .send(ClientRequest::Submit {
                payload,
                index,
                hash,
                tx_count,
                reply,
            })
            .await
            .map_err(|_| ProposalError::RunnerStopped)?;
        rx.await.map_err(|_| ProposalError::RunnerStopped)??;
        Ok(())
    }

    /// The next index this node may propose, if it leads one.
    pub async fn proposable_index(&self) -> Result<Option<BlockNumber>, ProposalError> {
        let (reply, rx) = oneshot::channel();
        self.client_tx
            .send(ClientRequest::ProposableIndex { reply })
            .await
            .map_err(|_| ProposalError::RunnerStopped)?;
        rx.await.map_err(|_| ProposalError::RunnerStopped)
    }
}

/// Builder for constructing a [`PbftRunner`].
///
/// Required fields:
/// - `signing_key` - Ed25519 keypair for signing consensus messages
/// - `genesis` - Ledger configuration in force after the recovered index
/// - `transport` - Outbound message delivery
/// - `executor` - Applies committed proposals and serves the ledger configuration
///
/// Optional fields:
/// - `pbft_config` - Consensus parameters (defaults to `PbftConfig::default()`)
/// - `store` - Durable consensus state (defaults to an in-memory store)
/// - `thread_pools` - Thread pool manager (defaults to auto-configured)
/// - `status` - Handle the runner publishes snapshots to
/// - `channel_capacity` - Inbound message channel capacity (defaults to 10,000)
pub struct PbftRunnerBuilder {
    signing_key: Option<KeyPair>,
    genesis: Option<LedgerConfig>,
    pbft_config: PbftConfig,
    transport: Option<Arc<dyn Transport>>,
    executor: Option<Arc<dyn Executor>>,
    store: Option<Arc<dyn ConsensusStore>>,
    thread_pools: Option<Arc<ThreadPoolManager>>,
    status: Option<StatusHandle>,
    channel_capacity: usize,
}

impl Default for PbftRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PbftRunnerBuilder {
    pub fn new() -> Self {
        Self {
            signing_key: None,
            genesis: None,
            pbft_config: PbftConfig::default(),
            transport: None,
            executor: None,
            store: None,
            thread_pools: None,
            status: None,
            channel_capacity: 10_000,
        }
    }

    pub fn signing_key(mut self, key: KeyPair) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn genesis(mut self, config: LedgerConfig) -> Self {
        self.genesis = Some(config);
        self
    }

    pub fn pbft_config(mut self, config: PbftConfig) -> Self {
        self.pbft_config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the consensus state store.
    ///
    /// The state it holds is loaded once in [`build`](Self::build); a node
    /// restarted with the same store resumes its view and committed index.
    pub fn store(mut self, store: Arc<dyn ConsensusStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the thread pool manager (optional, defaults to auto-configured pools).
    pub fn thread_pools(mut self, pools: Arc<ThreadPoolManager>) -> Self {
        self.thread_pools = Some(pools);
        self
    }

    pub fn status(mut self, status: StatusHandle) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the inbound message channel capacity (default: 10,000).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Build the runner.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing, the store cannot be
    /// read, or the genesis membership is invalid.
    pub fn build(self) -> Result<PbftRunner, RunnerError> {
        let signing_key = self
            .signing_key
            .ok_or(RunnerError::MissingField("signing_key"))?;
        let genesis = self.genesis.ok_or(RunnerError::MissingField("genesis"))?;
        let transport = self
            .transport
            .ok_or(RunnerError::MissingField("transport"))?;
        let executor = self.executor.ok_or(RunnerError::MissingField("executor"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ConsensusStore>);
        let thread_pools = match self.thread_pools {
            Some(pools) => pools,
            None => Arc::new(ThreadPoolManager::auto()?),
        };

        let recovered = store.load()?;
        if !recovered.is_genesis() {
            tracing::info!(
                view = recovered.view.0,
                committed_index = recovered.committed_index.0,
                prepared = recovered.prepared.len(),
                "Recovering consensus state"
            );
        }
        let state = PbftState::new(signing_key, genesis, self.pbft_config, recovered)?;

        // Timers get a small dedicated channel so network floods never delay them.
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (consensus_tx, consensus_rx) = mpsc::channel(self.channel_capacity);
        let (client_tx, client_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (committed_tx, _) = broadcast::channel(1024);

        Ok(PbftRunner {
            timer_rx,
            callback_rx,
            callback_tx,
            consensus_rx,
            consensus_tx,
            client_rx,
            client_tx,
            internal: VecDeque::new(),
            state,
            start_time: Instant::now(),
            thread_pools,
            timer_manager: TimerManager::new(timer_tx),
            transport,
            executor,
            store,
            status: self.status.unwrap_or_default(),
            committed_tx,
            last_stats: PbftStats::default(),
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Drives a [`PbftState`] with real I/O.
///
/// A single task owns the state machine and receives events over channels,
/// so no locks guard consensus state:
///
/// - Timers fire into a dedicated channel
/// - Signature checks and proposal application run on the rayon pools and
///   come back as callbacks
/// - Network messages arrive through the [`InboundHandle`]
/// - Local proposals arrive through the [`ProposalSubmitter`]
///
/// Internal events emitted by the state machine are handled before the next
/// external input.
pub struct PbftRunner {
    timer_rx: mpsc::Receiver<Event>,
    callback_rx: mpsc::UnboundedReceiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    consensus_rx: mpsc::Receiver<Event>,
    consensus_tx: mpsc::Sender<Event>,
    client_rx: mpsc::Receiver<ClientRequest>,
    client_tx: mpsc::Sender<ClientRequest>,
    internal: VecDeque<Event>,
    state: PbftState,
    start_time: Instant,
    thread_pools: Arc<ThreadPoolManager>,
    timer_manager: TimerManager,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    store: Arc<dyn ConsensusStore>,
    status: StatusHandle,
    committed_tx: broadcast::Sender<(Proposal, ApplicationOutcome)>,
    /// Stats already reported to Prometheus.
    last_stats: PbftStats,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl PbftRunner {
    pub fn builder() -> PbftRunnerBuilder {
        PbftRunnerBuilder::new()
    }

    pub fn thread_pools(&self) -> &Arc<ThreadPoolManager> {
        &self.thread_pools
    }

    /// Handle the transport delivers inbound frames to.
    pub fn inbound_handle(&self) -> InboundHandle {
        InboundHandle::new(self.consensus_tx.clone())
    }

    pub fn proposal_submitter(&self) -> ProposalSubmitter {
        ProposalSubmitter {
            client_tx: self.client_tx.clone(),
        }
    }

    /// Committed proposals with their application outcome, in index order.
    pub fn subscribe_committed(&self) -> broadcast::Receiver<(Proposal, ApplicationOutcome)> {
        self.committed_tx.subscribe()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Get a shutdown handle for graceful termination.
    ///
    /// Can only be called once.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the event loop until shutdown.
    ///
    /// Priority order, checked top to bottom on every iteration:
    /// 1. Shutdown
    /// 2. Timers
    /// 3. Callbacks from the thread pools
    /// 4. Network messages, at most `CONSENSUS_BATCH_SIZE` in a row
    /// 5. Local proposals
    /// 6. Metrics tick
    ///
    /// # Errors
    ///
    /// Returns an error if consensus state cannot be persisted; continuing
    /// would let the node sign statements it could forget after a crash.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        // Network messages handled before local proposals get a turn.
        const CONSENSUS_BATCH_SIZE: usize = 10;

        let config = self.thread_pools.config();
        tracing::info!(
            node_id = %self.state.node_id(),
            node_index = ?self.state.self_index(),
            view = self.state.view().0,
            committed_index = self.state.committed_index().0,
            crypto_threads = config.crypto_threads,
            apply_threads = config.apply_threads,
            io_threads = config.io_threads,
            "Starting PBFT runner"
        );

        self.state.set_time(self.start_time.elapsed());
        let actions = self.state.initialize();
        self.process_actions(actions)?;
        self.drain_internal()?;
        self.publish_status();

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut consensus_batch_count: usize = 0;

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    let event_span = span!(
                        Level::INFO,
                        "handle_timer",
                        event.type = %event.type_name(),
                        view = self.state.view().0,
                    );
                    let _guard = event_span.enter();
                    self.handle_event(event)?;
                }

                Some(event) = self.callback_rx.recv() => {
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_callback",
                        event.type = %event.type_name(),
                        view = self.state.view().0,
                    );
                    let _guard = event_span.enter();
                    self.handle_event(event)?;
                }

                event = self.consensus_rx.recv(), if consensus_batch_count < CONSENSUS_BATCH_SIZE => {
                    match event {
                        Some(event) => {
                            consensus_batch_count += 1;
                            let event_span = span!(
                                Level::DEBUG,
                                "handle_message",
                                event.type = %event.type_name(),
                                view = self.state.view().0,
                            );
                            let _guard = event_span.enter();
                            self.handle_event(event)?;
                        }
                        None => {
                            tracing::warn!("Consensus channel closed");
                            break;
                        }
                    }
                }

                Some(request) = self.client_rx.recv() => {
                    consensus_batch_count = 0;
                    self.handle_client_request(request)?;
                }

                _ = metrics_tick.tick() => {
                    metrics::set_pool_queue_depths(
                        self.thread_pools.crypto_queue_depth(),
                        self.thread_pools.apply_queue_depth(),
                    );
                }

                // Nothing else is ready: let network messages flow again.
                _ = std::future::ready(()), if consensus_batch_count >= CONSENSUS_BATCH_SIZE => {
                    consensus_batch_count = 0;
                }
            }
        }

        self.timer_manager.cancel_all();
        tracing::info!("PBFT runner stopped");
        Ok(())
    }

    fn handle_event(&mut self, event: Event) -> Result<(), RunnerError> {
        self.state.set_time(self.start_time.elapsed());
        let actions = self.state.handle(event);
        self.process_actions(actions)?;
        self.drain_internal()?;
        self.publish_status();
        Ok(())
    }

    fn handle_client_request(&mut self, request: ClientRequest) -> Result<(), RunnerError> {
        match request {
            ClientRequest::ProposableIndex { reply } => {
                let _ = reply.send(self.state.proposable_index());
                Ok(())
            }
            ClientRequest::Submit {
                payload,
                index,
                hash,
                tx_count,
                reply,
            } => {
                self.state.set_time(self.start_time.elapsed());
                match self.state.submit_proposal(payload, index, hash, tx_count) {
                    Ok(actions) => {
                        let _ = reply.send(Ok(()));
                        self.process_actions(actions)?;
                        self.drain_internal()?;
                        self.publish_status();
                    }
                    Err(e) => {
                        tracing::debug!(index = index.0, error = %e, "Proposal rejected");
                        let _ = reply.send(Err(e));
                    }
                }
                Ok(())
            }
        }
    }

    fn drain_internal(&mut self) -> Result<(), RunnerError> {
        while let Some(event) = self.internal.pop_front() {
            self.state.set_time(self.start_time.elapsed());
            let actions = self.state.handle(event);
            self.process_actions(actions)?;
        }
        Ok(())
    }

    /// Execute the actions of one event. State is persisted before anything
    /// else so that no message leaves the node ahead of its durable record.
    fn process_actions(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        let (persist, rest): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|action| matches!(action, Action::PersistState { .. }));

        // Every PersistState carries the full state; the last one wins.
        if let Some(Action::PersistState { state }) = persist.into_iter().last() {
            if let Err(e) = self.store.save(&state) {
                tracing::error!(error = %e, "Failed to persist consensus state");
                return Err(e.into());
            }
        }

        for action in rest {
            self.process_action(action);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(action.type = %action.type_name()))]
    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => match encode_message(&message) {
                Ok(frame) => {
                    metrics::record_network_message_sent(message.type_name());
                    self.transport.broadcast(frame);
                }
                Err(e) => tracing::error!(error = %e, "Failed to encode broadcast"),
            },

            Action::SendTo { to, message } => match encode_message(&message) {
                Ok(frame) => {
                    metrics::record_network_message_sent(message.type_name());
                    self.transport.send_to(to, frame);
                }
                Err(e) => tracing::error!(error = %e, peer = %to, "Failed to encode message"),
            },

            Action::SetTimer { id, duration } => {
                self.timer_manager.set_timer(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timer_manager.cancel_timer(id);
            }

            Action::EnqueueInternal { event } => {
                self.internal.push_back(event);
            }

            Action::VerifyMessage {
                from,
                message,
                context,
            } => {
                let event_tx = self.callback_tx.clone();
                self.thread_pools.spawn_crypto(move || {
                    let start = Instant::now();
                    let valid = MessageValidator::verify_signatures(&message, &context);
                    metrics::record_signature_verification_latency(
                        start.elapsed().as_secs_f64(),
                    );
                    if !valid {
                        metrics::record_signature_verification_failure();
                    }
                    let _ = event_tx.send(Event::MessageVerified {
                        from,
                        message,
                        valid,
                    });
                });
            }

            Action::ApplyProposal { proposal } => {
                let event_tx = self.callback_tx.clone();
                let executor = self.executor.clone();
                self.thread_pools.spawn_apply(move || {
                    let start = Instant::now();
                    let event = match executor.apply_proposal(&proposal) {
                        Ok(outcome) => {
                            metrics::record_apply_latency(start.elapsed().as_secs_f64());
                            Event::ProposalApplied { outcome }
                        }
                        Err(error) => {
                            tracing::warn!(
                                index = proposal.index.0,
                                error = %error,
                                "Proposal application failed"
                            );
                            Event::ProposalApplyFailed {
                                index: proposal.index,
                                error,
                            }
                        }
                    };
                    let _ = event_tx.send(event);
                });
            }

            Action::FetchLedgerConfig => {
                let event_tx = self.callback_tx.clone();
                let executor = self.executor.clone();
                self.thread_pools
                    .spawn_apply(move || match executor.current_ledger_config() {
                        Ok(config) => {
                            let _ = event_tx.send(Event::LedgerConfigFetched { config });
                        }
                        Err(error) => {
                            let _ = event_tx.send(Event::LedgerConfigFetchFailed { error });
                        }
                    });
            }

            // Handled up front by process_actions.
            Action::PersistState { .. } => {}

            Action::NotifyCommitted { proposal, outcome } => {
                tracing::info!(
                    index = proposal.index.0,
                    hash = %proposal.hash,
                    result = %outcome.result_hash,
                    tx_count = proposal.tx_count,
                    "Proposal committed"
                );
                metrics::record_proposal_committed(proposal.index.0);
                // No subscribers is fine.
                let _ = self.committed_tx.send((proposal, outcome));
            }

            Action::ReportEquivocation { evidence } => {
                tracing::warn!(
                    node = evidence.node.0,
                    index = evidence.index.0,
                    view = evidence.view.0,
                    phase = ?evidence.phase,
                    first = %evidence.first.0,
                    second = %evidence.second.0,
                    "Equivocation detected"
                );
                metrics::record_equivocation();
            }

            Action::AlertApplyFailure {
                index,
                attempts,
                error,
            } => {
                tracing::error!(
                    index = index.0,
                    attempts,
                    error = %error,
                    "Proposal application keeps failing"
                );
                metrics::record_apply_failure_alert();
            }
        }
    }

    /// Publish a fresh snapshot and forward counter deltas to Prometheus.
    fn publish_status(&mut self) {
        let snapshot = self.state.snapshot();

        metrics::set_consensus_progress(
            snapshot.view.0,
            snapshot.stable_checkpoint.0,
            snapshot.consensus_timeout.as_secs_f64(),
            snapshot.consecutive_apply_failures,
        );

        let stats = &snapshot.stats;
        for (reason, count) in &stats.messages_rejected {
            let seen = self
                .last_stats
                .messages_rejected
                .get(reason)
                .copied()
                .unwrap_or(0);
            if *count > seen {
                metrics::record_messages_rejected(reason.as_str(), count - seen);
            }
        }
        if stats.messages_stale > self.last_stats.messages_stale {
            metrics::record_messages_stale(stats.messages_stale - self.last_stats.messages_stale);
        }
        if stats.view_changes > self.last_stats.view_changes {
            metrics::record_view_changes(stats.view_changes - self.last_stats.view_changes);
        }
        if stats.apply_failures > self.last_stats.apply_failures {
            metrics::record_apply_failures(stats.apply_failures - self.last_stats.apply_failures);
        }
        self.last_stats = stats.clone();

        self.status.publish(snapshot);
    }
}

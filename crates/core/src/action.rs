//! Action types for the deterministic state machine.

use crate::{Event, PersistedState, TimerId, VerificationContext};
use pbft_messages::PbftMessage;
use pbft_types::{
    ApplicationOutcome, ApplyError, BlockNumber, EquivocationEvidence, NodeId, Proposal,
};
use std::sync::Arc;
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every other consensus node.
    Broadcast { message: PbftMessage },

    /// Send a message to a single node.
    SendTo { to: NodeId, message: PbftMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration, replacing any timer with the same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify every signature carried by a received message.
    ///
    /// Delegated to the crypto pool in production, instant in simulation.
    /// Returns `Event::MessageVerified` when complete.
    VerifyMessage {
        from: NodeId,
        message: PbftMessage,
        /// Keys and feature flags in force when the message was admitted.
        context: Arc<VerificationContext>,
    },

    /// Apply a committed proposal through the external executor.
    ///
    /// Returns `Event::ProposalApplied` or `Event::ProposalApplyFailed`.
    /// The executor must be idempotent: a retry may re-submit the same index.
    ApplyProposal { proposal: Proposal },

    /// Ask the executor for the current ledger configuration.
    ///
    /// Returns `Event::LedgerConfigFetched` or `Event::LedgerConfigFetchFailed`.
    FetchLedgerConfig,

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist the minimum state needed to rejoin safely after a restart.
    PersistState { state: PersistedState },

    // ═══════════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// A proposal was committed and applied.
    NotifyCommitted {
        proposal: Proposal,
        outcome: ApplicationOutcome,
    },

    /// A node signed two conflicting statements for the same slot.
    ReportEquivocation { evidence: EquivocationEvidence },

    /// Application of a committed proposal keeps failing.
    AlertApplyFailure {
        index: BlockNumber,
        attempts: u32,
        error: ApplyError,
    },
}

impl Action {
    /// Check if this action is delegated work that returns a callback event.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::VerifyMessage { .. } | Action::ApplyProposal { .. } | Action::FetchLedgerConfig
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendTo { .. } => "SendTo",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyMessage { .. } => "VerifyMessage",
            Action::ApplyProposal { .. } => "ApplyProposal",
            Action::FetchLedgerConfig => "FetchLedgerConfig",
            Action::PersistState { .. } => "PersistState",
            Action::NotifyCommitted { .. } => "NotifyCommitted",
            Action::ReportEquivocation { .. } => "ReportEquivocation",
            Action::AlertApplyFailure { .. } => "AlertApplyFailure",
        }
    }
}

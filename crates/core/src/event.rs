//! Event types for the deterministic state machine.

use pbft_messages::PbftMessage;
use pbft_types::{
    ApplicationOutcome, ApplyError, BlockNumber, Hash, LedgerConfig, NodeId, Phase, View,
};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: messages from other nodes.
    Network = 2,

    /// Client events: proposals from the local sealer.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The consensus timeout fired: no progress within the current timeout.
    ConsensusTimeout,

    /// Re-broadcast checkpoints that have not become stable yet.
    CheckpointResendTimer,

    /// Retry a failed proposal application.
    ApplyRetryTimer,

    /// Retry a failed ledger configuration fetch.
    LedgerConfigRetryTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A decoded message arrived from `from`.
    ///
    /// `from` is the transport-level identity; it must match the sealer the
    /// message claims to come from.
    MessageReceived { from: NodeId, message: PbftMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// The local sealer offers a block for `index`.
    ///
    /// Fire-and-forget form of `PbftState::submit_proposal`; rejections are
    /// only logged.
    SubmitProposal {
        index: BlockNumber,
        hash: Hash,
        payload: Vec<u8>,
        tx_count: u64,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Callbacks from delegated work (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Signature verification of a received message finished.
    MessageVerified {
        from: NodeId,
        message: PbftMessage,
        valid: bool,
    },

    /// The executor applied a committed proposal.
    ProposalApplied { outcome: ApplicationOutcome },

    /// The executor failed to apply a committed proposal.
    ProposalApplyFailed { index: BlockNumber, error: ApplyError },

    /// The executor returned the current ledger configuration.
    LedgerConfigFetched { config: LedgerConfig },

    /// The executor could not return the ledger configuration.
    LedgerConfigFetchFailed { error: ApplyError },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A Prepare, Commit or CheckPoint certificate reached quorum.
    ///
    /// Emitted exactly once per `(index, phase, hash)` transition.
    QuorumReached {
        index: BlockNumber,
        phase: Phase,
        hash: Hash,
    },

    /// A quorum of view changes targeting `view` has been collected.
    ViewChangeQuorumReached { view: View },
}

impl Event {
    /// Get the priority of this event for ordering at equal timestamps.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::MessageVerified { .. }
            | Event::ProposalApplied { .. }
            | Event::ProposalApplyFailed { .. }
            | Event::LedgerConfigFetched { .. }
            | Event::LedgerConfigFetchFailed { .. }
            | Event::QuorumReached { .. }
            | Event::ViewChangeQuorumReached { .. } => EventPriority::Internal,

            Event::ConsensusTimeout
            | Event::CheckpointResendTimer
            | Event::ApplyRetryTimer
            | Event::LedgerConfigRetryTimer => EventPriority::Timer,

            Event::MessageReceived { .. } => EventPriority::Network,

            Event::SubmitProposal { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ConsensusTimeout => "ConsensusTimeout",
            Event::CheckpointResendTimer => "CheckpointResendTimer",
            Event::ApplyRetryTimer => "ApplyRetryTimer",
            Event::LedgerConfigRetryTimer => "LedgerConfigRetryTimer",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::SubmitProposal { .. } => "SubmitProposal",
            Event::MessageVerified { .. } => "MessageVerified",
            Event::ProposalApplied { .. } => "ProposalApplied",
            Event::ProposalApplyFailed { .. } => "ProposalApplyFailed",
            Event::LedgerConfigFetched { .. } => "LedgerConfigFetched",
            Event::LedgerConfigFetchFailed { .. } => "LedgerConfigFetchFailed",
            Event::QuorumReached { .. } => "QuorumReached",
            Event::ViewChangeQuorumReached { .. } => "ViewChangeQuorumReached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_events_sort_first() {
        let internal = Event::ViewChangeQuorumReached { view: View(1) };
        let timer = Event::ConsensusTimeout;
        assert!(internal.priority() < timer.priority());
        assert!(EventPriority::Network < EventPriority::Client);
    }
}

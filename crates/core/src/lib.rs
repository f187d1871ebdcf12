//! Core types for PBFT consensus.
//!
//! This crate provides the foundational types for the consensus architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that the consensus state machine implements
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod event;
mod persisted;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use persisted::{PersistedState, VerificationContext};
pub use traits::StateMachine;

/// Timers owned by the consensus state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Progress timeout; expiry starts a view change.
    Consensus,
    /// Re-broadcast of checkpoint votes that are not yet stable.
    CheckpointResend,
    /// Backoff before re-applying a proposal the executor rejected.
    ApplyRetry,
    /// Backoff before asking the executor for the ledger configuration again.
    LedgerConfigRetry,
}

impl TimerId {
    /// The event delivered when this timer fires.
    pub fn event(self) -> Event {
        match self {
            TimerId::Consensus => Event::ConsensusTimeout,
            TimerId::CheckpointResend => Event::CheckpointResendTimer,
            TimerId::ApplyRetry => Event::ApplyRetryTimer,
            TimerId::LedgerConfigRetry => Event::LedgerConfigRetryTimer,
        }
    }
}

//! The state machine trait shared by the simulation and production runners.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous event processor.
///
/// Implementations perform no I/O. Time only advances when the runner calls
/// [`StateMachine::set_time`] before delivering an event.
pub trait StateMachine {
    /// Process one event and return the actions it triggers.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time, as seen by the state machine.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set by the runner.
    fn now(&self) -> Duration;
}

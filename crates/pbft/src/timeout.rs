//! Consensus progress timeout with exponential backoff.
//!
//! A single logical timer ([`TimerId::Consensus`]) guards liveness. Every
//! commit re-arms it with the base duration; every expiry doubles it up to the
//! configured ceiling so that repeated view changes during a partition do not
//! spin.

use pbft_core::{Action, TimerId};
use std::time::Duration;

/// Lifecycle of the consensus timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
    Fired,
}

#[derive(Debug)]
pub struct TimeoutController {
    base: Duration,
    max: Duration,
    current: Duration,
    state: TimerState,
    /// Expiries since the last progress.
    consecutive_timeouts: u32,
}

impl TimeoutController {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            state: TimerState::Idle,
            consecutive_timeouts: 0,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn current_timeout(&self) -> Duration {
        self.current
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Arm (or re-arm) the timer for `duration`.
    pub fn arm(&mut self, duration: Duration) -> Action {
        self.state = TimerState::Armed;
        Action::SetTimer {
            id: TimerId::Consensus,
            duration,
        }
    }

    /// Arm with the current backoff.
    pub fn arm_current(&mut self) -> Action {
        self.arm(self.current)
    }

    /// Progress was made: reset the backoff and re-arm with the base timeout.
    pub fn on_progress(&mut self) -> Action {
        self.current = self.base;
        self.consecutive_timeouts = 0;
        self.arm(self.base)
    }

    /// The timer expired: double the timeout and return the re-arm action.
    pub fn on_fire(&mut self) -> Action {
        self.state = TimerState::Fired;
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.arm(self.current)
    }

    pub fn disarm(&mut self) -> Action {
        self.state = TimerState::Idle;
        Action::CancelTimer {
            id: TimerId::Consensus,
        }
    }
}

//! PBFT engine configuration.

use std::time::Duration;

/// Tuning knobs for [`crate::PbftState`].
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Initial consensus timeout. Reset to this value on every commit.
    pub base_timeout: Duration,

    /// Ceiling for the doubled consensus timeout.
    pub max_timeout: Duration,

    /// How many indices above the committed index may be in flight.
    pub water_mark_limit: u64,

    /// Interval between re-broadcasts of our own unstable checkpoints.
    pub checkpoint_resend_interval: Duration,

    /// First delay before retrying a failed application.
    pub apply_retry_base: Duration,

    /// Ceiling for the apply retry backoff.
    pub apply_retry_max: Duration,

    /// Consecutive application failures before `Action::AlertApplyFailure`.
    pub apply_alert_threshold: u32,

    /// Minimum time between two recovery requests.
    pub recover_interval: Duration,

    /// Maximum committed proposals returned in one recovery response.
    pub max_recover_batch: usize,

    /// Committed proposals (with commit votes) retained for lagging peers.
    pub committed_log_retention: usize,

    /// Upper bound on buffered messages for views we have not reached yet.
    pub max_future_messages: usize,

    /// View changes aiming more than this many views above the current one
    /// are rejected.
    pub view_change_window: u64,

    /// The ledger configuration is re-read after every block whose index is
    /// a multiple of this value.
    pub epoch_length: u64,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(3),
            max_timeout: Duration::from_secs(60),
            water_mark_limit: 10,
            checkpoint_resend_interval: Duration::from_secs(2),
            apply_retry_base: Duration::from_millis(200),
            apply_retry_max: Duration::from_secs(10),
            apply_alert_threshold: 5,
            recover_interval: Duration::from_secs(1),
            max_recover_batch: 10,
            committed_log_retention: 100,
            max_future_messages: 1024,
            view_change_window: 64,
            epoch_length: 1,
        }
    }
}

impl PbftConfig {
    /// Backoff before retry number `attempt` (1-based) of a failed executor
    /// call. Shared by proposal application and ledger configuration fetches.
    pub fn apply_retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.apply_retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.apply_retry_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_retry_delay_is_capped() {
        let config = PbftConfig::default();
        assert_eq!(config.apply_retry_delay(1), Duration::from_millis(200));
        assert_eq!(config.apply_retry_delay(2), Duration::from_millis(400));
        assert_eq!(config.apply_retry_delay(30), config.apply_retry_max);
    }
}

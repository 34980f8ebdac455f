//! Timing constants and reconnect policy.

use std::time::Duration;

use crate::client::ClientOptions;

/// Fixed delays in the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTimings {
    /// Let a fresh client settle before asking for a pairing code.
    pub pairing_grace: Duration,
    /// Upper bound on waiting for registered credentials to reach disk.
    pub settle: Duration,
    /// Pause between the last send and teardown.
    pub post_transfer: Duration,
}

impl Default for PairingTimings {
    fn default() -> Self {
        Self {
            pairing_grace: Duration::from_secs(2),
            settle: Duration::from_secs(5),
            post_transfer: Duration::from_secs(1),
        }
    }
}

/// Bounded reconnects with doubling backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff)
    }

    pub fn allows(&self, completed: u32) -> bool {
        completed < self.max_attempts
    }
}

/// Everything the orchestrator needs to drive attempts.
#[derive(Debug, Clone, Default)]
pub struct PairingConfig {
    pub client: ClientOptions,
    pub timings: PairingTimings,
    pub reconnect: ReconnectPolicy,
}

impl PairingConfig {
    /// Bound on an attempt reaching registration; same as the connect timeout.
    pub fn attempt_timeout(&self) -> Duration {
        self.client.connect_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timings() {
        let timings = PairingTimings::default();
        assert_eq!(timings.pairing_grace, Duration::from_secs(2));
        assert_eq!(timings.settle, Duration::from_secs(5));
        assert_eq!(timings.post_transfer, Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_from_five_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(5));
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn allows_up_to_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn attempt_timeout_follows_connect_timeout() {
        let config = PairingConfig::default();
        assert_eq!(config.attempt_timeout(), Duration::from_secs(300));
    }
}

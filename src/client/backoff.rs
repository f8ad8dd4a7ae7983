//! Reconnect backoff policy

use std::time::Duration;

use crate::config::ClientConfig;

/// Bounded exponential backoff for stream reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Consecutive failed attempts after which the client gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Build from client configuration.
    #[must_use]
    pub const fn from_config(config: &ClientConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            factor: config.reconnect_factor,
            cap: Duration::from_millis(config.reconnect_cap_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before reconnect `attempt` (1-indexed), or `None` once the
    /// attempt budget is spent.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = self.factor.saturating_pow(attempt - 1);
        Some(self.base.saturating_mul(multiplier).min(self.cap))
    }

    /// Whether `failures` consecutive failed attempts exhaust the budget.
    #[must_use]
    pub const fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Every delay the policy will ever produce, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}

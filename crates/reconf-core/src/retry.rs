//! Retry budget and backoff curve for rollouts.
//!
//! Inside `Upgrading` a partially failed rollout is retried up to
//! `max_attempts` more times, `retry_interval` apart. Once the budget is
//! exhausted under the retry policy, the item waits an exponentially
//! growing backoff before the next round.

use std::time::Duration;

/// Configuration for rollout retry behavior.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = no retries, just one attempt).
    pub max_attempts: u32,
    /// Delay between attempts inside one round, in milliseconds.
    pub retry_interval_ms: u64,
    /// First backoff after an exhausted round, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap on backoff growth, in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_interval_ms: 1_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay between attempts.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = duration_ms(interval);
        self
    }

    /// Set the first backoff.
    #[must_use]
    pub const fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff_ms = duration_ms(delay);
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff_ms = duration_ms(delay);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// No retries - one attempt per round.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay between attempts inside a round.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Whether another attempt fits in the budget after `retries_used`.
    #[must_use]
    pub const fn has_budget(&self, retries_used: u32) -> bool {
        retries_used < self.max_attempts
    }

    /// Backoff before round `round` (1-indexed) restarts.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff_delay(&self, round: u32) -> Duration {
        let exponent = i32::try_from(round.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert!(config.has_budget(1));
        assert!(!config.has_budget(2));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(config.backoff_delay(30), Duration::from_millis(350));
    }

    #[test]
    fn no_retry_has_no_budget() {
        assert!(!RetryConfig::no_retry().has_budget(0));
    }
}

//! Exponential backoff between failed rotation cycles.

use std::time::Duration;

use tunrot_core::config::BackoffConfig;

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failed cycle.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each further failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default(), Duration::MAX)
    }
}

impl BackoffPolicy {
    /// Build from config, never waiting longer than `cap` (the rotation
    /// interval: the periodic timer retries by then anyway).
    pub fn from_config(config: &BackoffConfig, cap: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_secs),
            max_delay: Duration::from_secs(config.max_secs).min(cap),
            multiplier: config.multiplier,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Consecutive-failure counter driving a [`BackoffPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Register a failed cycle and return how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(60));
        assert_eq!(policy.max_delay, Duration::from_secs(1800));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exponential_delays_capped_at_rotation_interval() {
        let policy = BackoffPolicy::from_config(&BackoffConfig::default(), Duration::from_secs(600));

        // 60s, 120s, 240s, 480s, 600s (capped), 600s
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(480));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(600));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn backoff_escalates_and_resets() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        assert_eq!(backoff.record_failure(), Duration::from_secs(60));
        assert_eq!(backoff.record_failure(), Duration::from_secs(120));
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.record_failure(), Duration::from_secs(60));
    }
}

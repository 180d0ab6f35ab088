//! Reconnect policy for push channels.
//!
//! Implements capped exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ChannelSettings;

/// Retry policy implementing exponential backoff.
///
/// Attempts are uncapped unless `max_attempts` is set; the delay is always
/// capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Fraction of the delay that is randomized, in `[0, 1]`.
    pub jitter_ratio: f64,
    /// Give up after this many consecutive failures.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(settings: &ChannelSettings) -> Self {
        Self {
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter_ratio: settings.jitter_ratio,
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay to wait after the given number of consecutive failures.
    ///
    /// `attempts=1` waits `initial_backoff`, each further failure multiplies
    /// the delay by `backoff_multiplier`, capped at `max_backoff`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(capped)
    }

    /// Like `backoff`, with `jitter_ratio` of the delay randomized downwards.
    pub fn backoff_with_jitter(&self, attempts: u32) -> Duration {
        let base = self.backoff(attempts);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * ratio;
        let offset = rand::rng().random_range(0.0..=spread);
        Duration::from_secs_f64(base.as_secs_f64() - offset)
    }

    /// Whether another attempt should follow `attempts` consecutive failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&ChannelSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
            jitter_ratio: 0.0,
            max_attempts: None,
        }
    }

    #[test]
    fn test_new_from_settings() {
        let settings = ChannelSettings {
            initial_backoff_ms: 500,
            max_backoff_ms: 20_000,
            backoff_multiplier: 3.0,
            jitter_ratio: 0.25,
            max_attempts: Some(4),
            ..Default::default()
        };
        let policy = RetryPolicy::new(&settings);

        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff, Duration::from_secs(20));
        assert_eq!(policy.backoff_multiplier, 3.0);
        assert_eq!(policy.jitter_ratio, 0.25);
        assert_eq!(policy.max_attempts, Some(4));
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = policy(1000, 60_000, 2.0);

        assert_eq!(policy.backoff(0), Duration::ZERO);
        // 1000 * 2^0
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        // 1000 * 2^1
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        // 1000 * 2^3
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capping() {
        let policy = policy(1000, 5000, 2.0);

        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        // 8s -> capped at 5s
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(50), Duration::from_secs(5));
        // Huge exponents stay finite
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = policy(250, 30_000, 1.7);
        let mut previous = Duration::ZERO;
        for attempts in 0..40 {
            let delay = policy.backoff(attempts);
            assert!(delay >= previous);
            assert!(delay <= policy.max_backoff);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut policy = policy(1000, 10_000, 2.0);
        policy.jitter_ratio = 0.5;

        for _ in 0..100 {
            let delay = policy.backoff_with_jitter(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_no_jitter_is_deterministic() {
        let policy = policy(1000, 10_000, 2.0);
        assert_eq!(policy.backoff_with_jitter(2), policy.backoff(2));
    }

    #[test]
    fn test_should_retry_uncapped_by_default() {
        let policy = policy(1000, 10_000, 2.0);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1_000_000));
    }

    #[test]
    fn test_should_retry_max_attempts() {
        let mut policy = policy(1000, 10_000, 2.0);
        policy.max_attempts = Some(3);

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_zero_initial_backoff() {
        let policy = policy(0, 100, 2.0);
        assert_eq!(policy.backoff(1), Duration::ZERO);
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }
}

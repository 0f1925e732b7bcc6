//! Exponential backoff shared by HTTP retries and realtime reconnection.

use std::time::{Duration, SystemTime};

use rand::Rng;
use reqwest_retry::{RetryDecision, RetryPolicy};

/// Exponential backoff policy.
///
/// Delays double from `base_delay` on every attempt, are capped at
/// `max_delay`, and stop after `max_retries` attempts. An optional jitter
/// factor spreads delays by up to that fraction in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Backoff {
    /// Create a new policy with a 1s base delay, a 60s cap and no jitter.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// True once `n_past_attempts` attempts have been spent.
    pub fn is_exhausted(&self, n_past_attempts: u32) -> bool {
        n_past_attempts >= self.max_retries
    }

    /// Exponential delay before attempt `n_attempts + 1`, without jitter.
    pub fn exponential_delay(&self, n_attempts: u32) -> Duration {
        let exponent = n_attempts.min(31) as i32;
        let delay = self.base_delay.as_secs_f64() * 2_f64.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Delay with jitter applied, never above `max_delay`.
    pub fn delay(&self, n_attempts: u32) -> Duration {
        let delay = self.exponential_delay(n_attempts);
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = delay.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RetryPolicy for Backoff {
    fn should_retry(&self, _request_start_time: SystemTime, n_past_retries: u32) -> RetryDecision {
        if self.is_exhausted(n_past_retries) {
            RetryDecision::DoNotRetry
        } else {
            RetryDecision::Retry {
                execute_after: SystemTime::now() + self.delay(n_past_retries),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let policy = Backoff::new(3);

        assert_eq!(policy.exponential_delay(0).as_secs(), 1);
        assert_eq!(policy.exponential_delay(1).as_secs(), 2);
        assert_eq!(policy.exponential_delay(2).as_secs(), 4);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = Backoff::new(10).with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.exponential_delay(10), Duration::from_secs(5));
        assert_eq!(policy.exponential_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = Backoff::new(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(150))
            .with_jitter(0.5);

        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(49));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        let policy = Backoff::new(1).with_jitter(4.0);
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn test_should_retry_until_exhausted() {
        let policy = Backoff::new(2);
        let start = SystemTime::now();

        assert!(matches!(
            policy.should_retry(start, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 1),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy.should_retry(start, 2),
            RetryDecision::DoNotRetry
        ));
        assert!(policy.is_exhausted(2));
    }
}

//! Retry policy for sink requests
//!
//! Exponential backoff with optional jitter; the attempt count includes the
//! first try.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each following one
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.base_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64().max(0.0);

        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1)) as f64;
        let mut delay = (base_secs * multiplier).min(max_secs);

        if self.jitter > 0.0 && delay > 0.0 {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter.min(1.0);
            delay = (delay * (1.0 + jitter)).clamp(0.0, max_secs);
        }

        Duration::from_secs_f64(delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter,
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let p = policy(0.0);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(p.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(p.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(0.5);
        for _ in 0..100 {
            let delay = p.backoff_delay(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_at_least_one_attempt() {
        let p = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert_eq!(p.max_attempts(), 1);
    }
}

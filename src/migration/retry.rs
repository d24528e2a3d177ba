//! Retry & backoff policy
//!
//! Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
//! With jitter the delay is drawn uniformly from `[delay/2, delay]` so a
//! burst of failing keys doesn't retry in lockstep.

use crate::io::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests
    pub fn test() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// True if a task that just finished attempt number `attempt` may run again
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay to wait before the next attempt, jittered if enabled
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter {
            return delay;
        }
        let max_ms = delay.as_millis() as u64;
        let min_ms = max_ms / 2;
        Duration::from_millis(rng.gen_range(min_ms, max_ms + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SimulatedRng;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(6), Duration::from_millis(5000));
        assert_eq!(policy.backoff(100), Duration::from_millis(5000));
    }

    #[test]
    fn test_should_retry_bounds_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        let mut rng = SimulatedRng::new(7);
        for attempt in 1..8 {
            let full = policy.backoff(attempt);
            let d = policy.delay_for(attempt, &mut rng);
            assert!(d <= full, "attempt {}: {:?} > {:?}", attempt, d, full);
            assert!(d >= full / 2, "attempt {}: {:?} < {:?}", attempt, d, full / 2);
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let mut rng = SimulatedRng::new(1);
        assert_eq!(policy.delay_for(2, &mut rng), Duration::from_millis(400));
    }
}

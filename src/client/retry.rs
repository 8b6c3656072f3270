// client/retry.rs - Backoff Policy and Clock

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Time source for retry scheduling
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential backoff with jitter: attempt `n` waits
/// `min(base * 2^n + jitter, max)` before the next try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 1000,
            max_jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self.max_jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// Jitter no larger than the base delay keeps delays non-decreasing
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms exceeds max_delay_ms".into());
        }
        if self.max_jitter_ms > self.base_delay_ms {
            return Err("max_jitter_ms exceeds base_delay_ms".into());
        }
        Ok(())
    }

    /// Delay after failed attempt `attempt` (0-based) with the given jitter
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let exponential = self.base_delay_ms.saturating_mul(factor);
        let jitter_ms = (jitter.as_millis() as u64).min(self.max_jitter_ms);
        Duration::from_millis(exponential.saturating_add(jitter_ms).min(self.max_delay_ms))
    }

    fn random_jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.max_jitter_ms))
    }
}

/// Retry schedule for one run of attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    next_attempt_at: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            next_attempt_at: None,
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// Record a failed attempt at `now`. Returns the wait before the next
    /// attempt, or `None` once the attempts are exhausted.
    pub fn fail(&mut self, now: Instant) -> Option<Duration> {
        let attempt = self.failures;
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.next_attempt_at = None;
            return None;
        }
        let delay = self.policy.delay(attempt, self.policy.random_jitter());
        self.next_attempt_at = Some(now + delay);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            max_jitter_ms: 600,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, Duration::ZERO), Duration::from_millis(500));
        assert_eq!(policy.delay(0, Duration::from_millis(40)), Duration::from_millis(540));
        assert_eq!(policy.delay(1, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.delay(2, Duration::from_millis(99)), Duration::from_millis(1000));
        assert_eq!(policy.delay(63, Duration::ZERO), Duration::from_millis(1000));
        assert_eq!(policy.delay(200, Duration::ZERO), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_exhausts_after_max_attempts() {
        let mut backoff = Backoff::new(RetryPolicy::default().with_max_attempts(3));
        let now = Instant::now();
        assert!(backoff.fail(now).is_some());
        assert!(backoff.next_attempt_at().is_some());
        assert!(backoff.fail(now).is_some());
        assert!(backoff.fail(now).is_none());
        assert_eq!(backoff.attempts(), 3);
        assert!(backoff.next_attempt_at().is_none());
    }

    proptest! {
        #[test]
        fn test_delays_never_decrease(
            base in 1u64..2_000,
            extra in 0u64..10_000,
            jitters in proptest::collection::vec(0u64..2_000, 1..12),
        ) {
            let policy = RetryPolicy {
                max_attempts: 16,
                base_delay_ms: base,
                max_delay_ms: base + extra,
                max_jitter_ms: base,
            };
            prop_assert!(policy.validate().is_ok());
            let mut previous = Duration::ZERO;
            for (attempt, jitter) in jitters.iter().enumerate() {
                let delay = policy.delay(attempt as u32, Duration::from_millis(*jitter));
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(policy.max_delay_ms));
                previous = delay;
            }
        }
    }
}

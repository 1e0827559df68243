//! Optimistic lock retry policy
//!
//! Backoff calculator used by the aggregate processor when a conditional
//! repository write loses a compare-and-swap race.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::timeout::saturating_millis;

/// Upper bound for random backoff when no maximum delay is configured
const DEFAULT_RANDOM_CEILING_MS: u64 = 1000;

/// Retry policy for optimistic locking conflicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticLockRetryPolicy {
    /// Maximum retries, zero means unbounded
    #[serde(default)]
    pub maximum_retries: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Cap on the computed delay in milliseconds, zero means uncapped
    #[serde(default = "default_maximum_retry_delay_ms")]
    pub maximum_retry_delay_ms: u64,

    /// Double the delay on every attempt
    #[serde(default = "default_true")]
    pub exponential_back_off: bool,

    /// Pick a uniform random delay instead of a constant one
    #[serde(default)]
    pub random_back_off: bool,
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_maximum_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for OptimisticLockRetryPolicy {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            maximum_retry_delay_ms: default_maximum_retry_delay_ms(),
            exponential_back_off: true,
            random_back_off: false,
        }
    }
}

impl OptimisticLockRetryPolicy {
    /// Whether another attempt may be made after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.maximum_retries == 0 || attempt < self.maximum_retries
    }

    /// Delay to sleep before retry number `attempt`
    ///
    /// Exponential backoff takes precedence over random backoff.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.retry_delay_ms;

        if self.exponential_back_off {
            delay_ms = delay_ms
                .checked_shl(attempt)
                .filter(|shifted| shifted >> attempt == delay_ms)
                .unwrap_or(u64::MAX);
        } else if self.random_back_off {
            let ceiling = if self.maximum_retry_delay_ms > 0 {
                self.maximum_retry_delay_ms
            } else {
                DEFAULT_RANDOM_CEILING_MS
            };
            delay_ms = (rand::random::<f64>() * ceiling as f64) as u64;
        }

        if self.maximum_retry_delay_ms > 0 {
            delay_ms = delay_ms.min(self.maximum_retry_delay_ms);
        }

        Duration::from_millis(delay_ms)
    }

    /// Sleep for the delay of `attempt`
    pub async fn do_delay(&self, attempt: u32) {
        let delay = self.delay(attempt);
        trace!(attempt, delay_ms = saturating_millis(delay), "Optimistic lock retry backoff");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn with_maximum_retries(mut self, maximum_retries: u32) -> Self {
        self.maximum_retries = maximum_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_maximum_retry_delay(mut self, delay: Duration) -> Self {
        self.maximum_retry_delay_ms = saturating_millis(delay);
        self
    }

    pub fn with_exponential_back_off(mut self, enabled: bool) -> Self {
        self.exponential_back_off = enabled;
        self
    }

    pub fn with_random_back_off(mut self, enabled: bool) -> Self {
        self.random_back_off = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = OptimisticLockRetryPolicy::default();
        assert_eq!(policy.maximum_retries, 0);
        assert_eq!(policy.retry_delay_ms, 50);
        assert_eq!(policy.maximum_retry_delay_ms, 1000);
        assert!(policy.exponential_back_off);
        assert!(!policy.random_back_off);
    }

    #[test]
    fn test_should_retry_unbounded() {
        let policy = OptimisticLockRetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(10_000));
    }

    #[test]
    fn test_should_retry_bounded() {
        let policy = OptimisticLockRetryPolicy::default().with_maximum_retries(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = OptimisticLockRetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_uncapped_saturates() {
        let policy = OptimisticLockRetryPolicy::default().with_maximum_retry_delay(Duration::ZERO);
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(63), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_constant_delay() {
        let policy = OptimisticLockRetryPolicy::default().with_exponential_back_off(false);
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(7), Duration::from_millis(50));
    }

    #[test]
    fn test_random_delay_within_ceiling() {
        let policy = OptimisticLockRetryPolicy::default()
            .with_exponential_back_off(false)
            .with_random_back_off(true)
            .with_maximum_retry_delay(Duration::from_millis(200));
        for attempt in 0..50 {
            assert!(policy.delay(attempt) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_exponential_wins_over_random() {
        let policy = OptimisticLockRetryPolicy::default().with_random_back_off(true);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: OptimisticLockRetryPolicy =
            serde_json::from_str(r#"{"maximum_retries": 5}"#).unwrap();
        assert_eq!(policy.maximum_retries, 5);
        assert_eq!(policy.retry_delay_ms, 50);
        assert!(policy.exponential_back_off);
    }
}

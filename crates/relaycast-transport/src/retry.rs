//! Retry policy for transient failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BASE_RETRY_DELAY_MS, MAX_ALLOCATE_ATTEMPTS};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay between attempts (exponential backoff applied).
    pub base_delay_ms: u64,

    /// Maximum delay between attempts.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ALLOCATE_ATTEMPTS,
            base_delay_ms: BASE_RETRY_DELAY_MS,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay before the given (1-based) retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Check if another attempt is allowed after `attempt` failed ones.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 1_500,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1500));
    }

    #[test]
    fn test_default_policy_retries_once() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }
}

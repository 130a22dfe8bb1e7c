//! Retry policies with exponential backoff
//!
//! Two independent retry tiers use this policy type: each download
//! connection retries its own byte range with one policy, and the task
//! manager retries whole tasks with another. Keeping them separate avoids
//! both starving retries and double-retrying the same failure.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy: `delay = min(base * multiplier^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = never retry)
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt
    pub multiplier: f64,
    /// Cap on the computed delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            multiplier,
            max_delay_ms,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Default policy for per-connection byte-range retries
    pub fn connection_default() -> Self {
        Self::new(5, 1000, 2.0, 30000)
    }

    /// Default policy for whole-task retries
    pub fn task_default() -> Self {
        Self::new(3, 2000, 2.0, 60000)
    }

    /// Calculate the delay before retry number `attempt` (0-indexed).
    ///
    /// The exponent is clamped so large attempt counts cannot overflow;
    /// the cap dominates long before that anyway.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let raw = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(raw as u64)
    }

    /// Whether another retry is allowed after `attempt` failures
    pub fn allows_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 30000,
        };
        let delays: Vec<u64> = (0..7)
            .map(|a| policy.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX, 1000, 2.0, 30000);
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_millis(30000));
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy::new(3, 1000, 2.0, 30000);
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!RetryPolicy::none().allows_retry(0));
    }

    #[test]
    fn test_tier_defaults_differ() {
        assert_ne!(RetryPolicy::connection_default(), RetryPolicy::task_default());
    }

    #[test]
    fn test_policy_copies_out_of_shared_config() {
        // Callers hand policies around by value from borrowed config
        let policy = RetryPolicy::task_default();
        let borrowed = &policy;
        let copied: RetryPolicy = *borrowed;
        assert_eq!(copied, policy);
    }
}

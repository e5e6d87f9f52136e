//! Retry policy with exponential backoff and jitter.
//!
//! Retry behavior is explicit, per-stage configuration: the coordinator
//! owns the retry loop and asks the policy how long to sleep between
//! attempts. Nothing else in the engine retries on its own.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for one stage (or for the storage layer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries beyond the initial attempt.
    pub max_retries: u32,
    /// Base delay; doubles per failed attempt.
    pub base_delay_ms: u64,
    /// Cap applied after backoff growth.
    pub max_delay_ms: u64,
    /// Full jitter: sleep a uniform random duration in [0, delay].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Long-backoff profile for storage unavailability: the run stalls and
    /// keeps trying well past the point a stage invocation would have
    /// given up.
    pub fn storage_profile() -> Self {
        Self {
            max_retries: 6,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts allowed: one initial plus the retry budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped, then jittered.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let ms = if self.jitter && raw > 0 {
            rand::thread_rng().gen_range(0..=raw)
        } else {
            raw
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(10_000)
            .with_jitter(false);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1_000)
            .with_max_delay_ms(2_500)
            .with_jitter(false);
        assert_eq!(policy.delay_for(10), Duration::from_millis(2_500));
    }

    #[test]
    fn huge_retry_numbers_do_not_overflow() {
        let policy = RetryPolicy::new().with_jitter(false);
        let delay = policy.delay_for(u32::MAX);
        assert_eq!(delay, Duration::from_millis(policy.max_delay_ms));
    }

    #[test]
    fn jitter_stays_within_the_envelope() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(10_000)
            .with_jitter(true);
        for _ in 0..50 {
            assert!(policy.delay_for(3) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn storage_profile_backs_off_longer() {
        let storage = RetryPolicy::storage_profile();
        let stage = RetryPolicy::default();
        assert!(storage.max_retries > stage.max_retries);
        assert!(storage.max_delay_ms > stage.max_delay_ms);
    }

    #[test]
    fn policy_serde_round_trip() {
        let policy = RetryPolicy::new().with_max_retries(5).with_jitter(false);
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}

//! Exponential backoff with jitter.
//!
//! Shared by the outbox dispatcher (per-message retry scheduling) and the
//! reconciliation worker (bounded gateway retries within one run).

use crate::config::{ConfigError, MaxRetries};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry cap and backoff curve.
///
/// The delay before retry `n` (zero-based) is
/// `min(max_delay, base_delay * 2^n)` plus, when `jitter` is set, a uniform
/// random amount in `[0, base_delay)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: MaxRetries,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MaxRetries::default(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for deterministic schedules.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "retry.base_delay",
                "base delay must not exceed max delay",
            ));
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many retries already happened.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let exponential = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        let capped = exponential.min(self.max_delay);

        if self.jitter {
            capped.saturating_add(jitter_below(self.base_delay))
        } else {
            capped
        }
    }

    /// Whether `failures` failed attempts exceed the retry cap.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > u32::from(self.max_retries)
    }
}

fn jitter_below(bound: Duration) -> Duration {
    let bound_nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
    if bound_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..bound_nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries: MaxRetries::try_new(max_retries).unwrap(),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = policy(5);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for(200), Duration::from_secs(2));
    }

    #[test]
    fn exhaustion_happens_after_max_retries_failures() {
        let policy = policy(5);

        assert!(!policy.is_exhausted(3));
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
        assert!(super::RetryPolicy {
            max_retries: MaxRetries::try_new(0).unwrap(),
            ..policy
        }
        .is_exhausted(1));
    }

    #[test]
    fn base_delay_above_max_is_invalid() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_cap_plus_base(retry_count in 0u32..64) {
            let policy = RetryPolicy { jitter: true, ..policy(5) };
            let delay = policy.delay_for(retry_count);
            let unjittered = policy.clone().without_jitter().delay_for(retry_count);

            prop_assert!(delay >= unjittered);
            prop_assert!(delay < unjittered + policy.base_delay);
            prop_assert!(delay < policy.max_delay + policy.base_delay);
        }
    }
}

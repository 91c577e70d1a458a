//! Typed configuration for the dispatcher, the reconciliation engine and the
//! reconciliation worker.
//!
//! Bounded scalars use `nutype` validation so that an out-of-range value is
//! rejected when the configuration is built rather than when it is first used.
//! Every value with financial impact is supplied by the caller; the defaults
//! below are development defaults only.

use crate::retry::RetryPolicy;
use nutype::nutype;
use payrecon_types::AccountCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of outbox messages claimed per dispatch cycle.
///
/// Validated to be between 1 and 1000.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000),
    default = 50,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

/// Number of failed attempts after which a message is quarantined.
///
/// Validated to be at most 100. Zero means the first failure exhausts the
/// message.
#[nutype(
    validate(less_or_equal = 100),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetries(u32);

/// Number of messages from one batch handled in parallel.
///
/// Validated to be between 1 and 256.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    default = 8,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Concurrency(usize);

/// Error returned when a configuration is internally inconsistent or a
/// value cannot be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting {name}")]
    Missing { name: String },

    /// A setting is present but unusable.
    #[error("invalid setting {name}: {detail}")]
    Invalid { name: String, detail: String },
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Invalid {
            name: name.into(),
            detail: detail.to_string(),
        }
    }
}

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub batch_size: BatchSize,
    pub concurrency: Concurrency,
    /// How long a claimed message stays leased before another dispatcher may
    /// reclaim it. Must exceed `handler_timeout`.
    pub lease: Duration,
    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,
    /// First sleep after an empty claim; doubles while idle.
    pub poll_interval: Duration,
    /// Ceiling for the idle sleep.
    pub max_idle_backoff: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::default(),
            concurrency: Concurrency::default(),
            lease: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            max_idle_backoff: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease <= self.handler_timeout {
            return Err(ConfigError::invalid(
                "dispatcher.lease",
                "lease must be longer than the handler timeout",
            ));
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.max_idle_backoff {
            return Err(ConfigError::invalid(
                "dispatcher.poll_interval",
                "poll interval must be positive and at most the idle backoff ceiling",
            ));
        }
        self.retry.validate()
    }
}

/// Policy the reconciliation engine applies to discrepancies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationPolicy {
    /// Largest absolute amount difference corrected without review. Zero
    /// disables auto-correction.
    pub auto_correct_threshold: Decimal,
    /// Ledger entries younger than this are not yet expected in the
    /// processor report.
    pub grace_period: Duration,
    /// Account whose net per reference is what the processor should report.
    pub clearing_account: AccountCode,
    /// Counter-account for automatic corrections.
    pub adjustment_account: AccountCode,
    /// Counter-account for entries created from processor data alone.
    pub suspense_account: AccountCode,
}

impl ReconciliationPolicy {
    /// Policy with the given accounts, no auto-correction and a two day grace
    /// period.
    pub fn new(
        clearing_account: AccountCode,
        adjustment_account: AccountCode,
        suspense_account: AccountCode,
    ) -> Self {
        Self {
            auto_correct_threshold: Decimal::ZERO,
            grace_period: Duration::from_secs(2 * 24 * 60 * 60),
            clearing_account,
            adjustment_account,
            suspense_account,
        }
    }

    #[must_use]
    pub fn with_auto_correct_threshold(mut self, threshold: Decimal) -> Self {
        self.auto_correct_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_correct_threshold.is_sign_negative() {
            return Err(ConfigError::invalid(
                "reconciliation.auto_correct_threshold",
                "threshold must not be negative",
            ));
        }
        if self.clearing_account == self.adjustment_account
            || self.clearing_account == self.suspense_account
        {
            return Err(ConfigError::invalid(
                "reconciliation.clearing_account",
                "clearing account must differ from the adjustment and suspense accounts",
            ));
        }
        Ok(())
    }
}

/// Configuration for the scheduled reconciliation worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Time between scheduled runs.
    pub interval: Duration,
    /// Whole UTC days before today covered by a scheduled run.
    pub lookback_days: u32,
    /// Whether the first scheduled run fires immediately at start-up.
    pub run_on_start: bool,
    /// A `Running` run older than this is treated as abandoned.
    pub stale_run_after: Duration,
    /// Retry policy for `GatewayError::Unavailable` within one run.
    /// `max_retries` bounds the extra fetch attempts.
    pub gateway_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            lookback_days: 1,
            run_on_start: true,
            stale_run_after: Duration::from_secs(2 * 60 * 60),
            gateway_retry: RetryPolicy {
                max_retries: MaxRetries::try_new(3).unwrap_or_default(),
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                jitter: true,
            },
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid(
                "worker.interval",
                "interval must be positive",
            ));
        }
        if self.lookback_days == 0 {
            return Err(ConfigError::invalid(
                "worker.lookback_days",
                "at least one day must be reconciled",
            ));
        }
        self.gateway_retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(code: &str) -> AccountCode {
        AccountCode::try_new(code).unwrap()
    }

    #[test]
    fn bounded_scalars_reject_out_of_range_values() {
        assert!(BatchSize::try_new(0).is_err());
        assert!(BatchSize::try_new(1_001).is_err());
        assert!(Concurrency::try_new(0).is_err());
        assert!(MaxRetries::try_new(101).is_err());
        assert!(MaxRetries::try_new(0).is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(DispatcherConfig::default().validate(), Ok(()));
        assert_eq!(WorkerConfig::default().validate(), Ok(()));
        assert_eq!(usize::from(BatchSize::default()), 50);
    }

    #[test]
    fn lease_must_outlast_handler_timeout() {
        let config = DispatcherConfig {
            lease: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(10),
            ..DispatcherConfig::default()
        };

        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn policy_rejects_negative_threshold_and_shared_accounts() {
        let policy = ReconciliationPolicy::new(
            account("clearing"),
            account("adjustments"),
            account("suspense"),
        );
        assert_eq!(policy.validate(), Ok(()));

        let negative = policy
            .clone()
            .with_auto_correct_threshold(Decimal::NEGATIVE_ONE);
        assert!(negative.validate().is_err());

        let shared = ReconciliationPolicy::new(
            account("clearing"),
            account("clearing"),
            account("suspense"),
        );
        assert!(shared.validate().is_err());
    }

    #[test]
    fn worker_config_requires_lookback() {
        let config = WorkerConfig {
            lookback_days: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

use chrono::FixedOffset;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a fetcher from its configuration.
#[derive(Debug, Error)]
pub enum PaytrSetupError {
    #[error("missing PayTR credential {name}")]
    MissingCredential { name: &'static str },

    #[error("report UTC offset of {minutes} minutes is out of range")]
    InvalidOffset { minutes: i32 },

    #[error("failed to build the HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Merchant credentials and report endpoint settings.
///
/// `merchant_key` and `merchant_salt` are secrets; they never appear in
/// `Debug` output.
#[derive(Clone, Deserialize)]
pub struct PaytrConfig {
    pub merchant_id: String,
    pub merchant_key: String,
    pub merchant_salt: String,
    /// Scheme and host of the API (default: `https://www.paytr.com`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Upper bound on one report request (default: 30 seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Longest range requested in one call (default: one day).
    #[serde(default = "default_max_window")]
    pub max_window: Duration,
    /// Offset of the wall-clock times in the report (default: +03:00).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

fn default_base_url() -> String {
    "https://www.paytr.com".to_owned()
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_utc_offset_minutes() -> i32 {
    180
}

impl PaytrConfig {
    pub fn new(
        merchant_id: impl Into<String>,
        merchant_key: impl Into<String>,
        merchant_salt: impl Into<String>,
    ) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            merchant_key: merchant_key.into(),
            merchant_salt: merchant_salt.into(),
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            max_window: default_max_window(),
            utc_offset_minutes: default_utc_offset_minutes(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub const fn with_max_window(mut self, max_window: Duration) -> Self {
        self.max_window = max_window;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), PaytrSetupError> {
        for (name, value) in [
            ("merchant_id", &self.merchant_id),
            ("merchant_key", &self.merchant_key),
            ("merchant_salt", &self.merchant_salt),
        ] {
            if value.trim().is_empty() {
                return Err(PaytrSetupError::MissingCredential { name });
            }
        }
        self.utc_offset().map(|_| ())
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, PaytrSetupError> {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).ok_or(
            PaytrSetupError::InvalidOffset {
                minutes: self.utc_offset_minutes,
            },
        )
    }
}

impl std::fmt::Debug for PaytrConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaytrConfig")
            .field("merchant_id", &self.merchant_id)
            .field("merchant_key", &"<redacted>")
            .field("merchant_salt", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("max_window", &self.max_window)
            .field("utc_offset_minutes", &self.utc_offset_minutes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secrets() {
        let config = PaytrConfig::new("123456", "key-abc", "salt-xyz");
        let debug = format!("{config:?}");

        assert!(debug.contains("123456"));
        assert!(!debug.contains("key-abc"));
        assert!(!debug.contains("salt-xyz"));
    }

    #[test]
    fn blank_credentials_are_rejected() {
        let config = PaytrConfig::new("123456", "  ", "salt-xyz");

        assert!(matches!(
            config.validate(),
            Err(PaytrSetupError::MissingCredential {
                name: "merchant_key"
            })
        ));
    }

    #[test]
    fn defaults_use_turkey_time_and_daily_windows() {
        let config = PaytrConfig::new("123456", "key-abc", "salt-xyz");

        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), 3 * 60 * 60);
        assert_eq!(config.max_window, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn offsets_beyond_a_day_are_rejected() {
        let mut config = PaytrConfig::new("123456", "key-abc", "salt-xyz");
        config.utc_offset_minutes = 24 * 60;

        assert!(matches!(
            config.validate(),
            Err(PaytrSetupError::InvalidOffset { minutes: 1440 })
        ));
    }

    #[test]
    fn optional_settings_fall_back_to_defaults_when_deserialized() {
        let config: PaytrConfig = serde_json::from_value(serde_json::json!({
            "merchant_id": "123456",
            "merchant_key": "key-abc",
            "merchant_salt": "salt-xyz"
        }))
        .unwrap();

        assert_eq!(config.base_url, "https://www.paytr.com");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.utc_offset_minutes, 180);
    }
}

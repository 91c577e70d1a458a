//! Process configuration read from `PAYRECON_*` environment variables.
//!
//! Every policy value with financial impact (retry cap and backoff curve,
//! auto-correction threshold, grace period, ledger accounts, schedule
//! interval) has a development default only. Outside `development` a missing
//! value is a configuration error, as are missing PayTR credentials.

use std::fmt::Display;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use payrecon::{
    AccountCode, BatchSize, Concurrency, ConfigError, DispatcherConfig, MaxRetries,
    ReconciliationPolicy, RetryPolicy, WorkerConfig,
};
use payrecon_paytr::PaytrConfig;
use payrecon_postgres::{MaxConnections, PostgresConfig};
use rust_decimal::Decimal;

const HOUR: u64 = 60 * 60;

/// Deployment environment (`PAYRECON_ENV`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format (`PAYRECON_LOG_FORMAT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Read before the rest of the settings so that configuration errors are
    /// already logged in the requested format. Unknown values fall back to
    /// text.
    pub fn from_env() -> Self {
        std::env::var("PAYRECON_LOG_FORMAT")
            .ok()
            .and_then(|value| Self::parse(&value))
            .unwrap_or_default()
    }
}

/// A value that must not appear in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Everything the worker process needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub database_url: Secret,
    pub postgres: PostgresConfig,
    pub dispatcher: DispatcherConfig,
    pub policy: ReconciliationPolicy,
    pub worker: WorkerConfig,
    /// `None` only in development without credentials; reconciliation is
    /// then disabled.
    pub paytr: Option<PaytrConfig>,
    pub webhook_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let environment = match vars.get("PAYRECON_ENV") {
            Some(value) => Environment::parse(&value).ok_or_else(|| {
                ConfigError::invalid("PAYRECON_ENV", format!("unknown environment {value:?}"))
            })?,
            None => Environment::default(),
        };
        let development = environment.is_development();

        let database_url = vars
            .get("PAYRECON_DATABASE_URL")
            .or_else(|| vars.get("DATABASE_URL"))
            .map(Secret)
            .ok_or_else(|| ConfigError::Missing {
                name: "PAYRECON_DATABASE_URL".to_owned(),
            })?;

        Ok(Self {
            environment,
            database_url,
            postgres: postgres_config(&vars)?,
            dispatcher: dispatcher_config(&vars, development)?,
            policy: reconciliation_policy(&vars, development)?,
            worker: worker_config(&vars, development)?,
            paytr: paytr_config(&vars, development)?,
            webhook_timeout: vars
                .seconds("PAYRECON_WEBHOOK_TIMEOUT_SECS")?
                .unwrap_or(Duration::from_secs(10)),
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::Missing {
            name: name.to_owned(),
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|error| ConfigError::invalid(name, error))
            })
            .transpose()
    }

    /// Like [`Vars::parse`], but absence is an error outside development.
    fn policy<T>(&self, name: &str, development: bool) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.parse(name)? {
            None if !development => Err(ConfigError::Missing {
                name: name.to_owned(),
            }),
            value => Ok(value),
        }
    }

    fn seconds(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        self.get(name)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(name, format!("not a boolean: {value:?}"))),
            })
            .transpose()
    }

    fn account(
        &self,
        name: &str,
        development_default: &str,
        development: bool,
    ) -> Result<AccountCode, ConfigError> {
        let code = match self.get(name) {
            Some(code) => code,
            None if development => development_default.to_owned(),
            None => {
                return Err(ConfigError::Missing {
                    name: name.to_owned(),
                })
            }
        };
        AccountCode::try_new(code).map_err(|error| ConfigError::invalid(name, error))
    }
}

fn postgres_config<F>(vars: &Vars<F>) -> Result<PostgresConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = PostgresConfig::default();
    if let Some(max) = vars.parse::<NonZeroU32>("PAYRECON_DB_MAX_CONNECTIONS")? {
        config.max_connections = MaxConnections::new(max);
    }
    if let Some(timeout) = vars.seconds("PAYRECON_DB_ACQUIRE_TIMEOUT_SECS")? {
        config.acquire_timeout = timeout;
    }
    Ok(config)
}

fn retry_policy<F>(vars: &Vars<F>, development: bool) -> Result<RetryPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut retry = RetryPolicy::default();
    if let Some(max) = vars.policy::<u32>("PAYRECON_RETRY_MAX", development)? {
        retry.max_retries = MaxRetries::try_new(max)
            .map_err(|error| ConfigError::invalid("PAYRECON_RETRY_MAX", error))?;
    }
    if let Some(base) = vars.policy::<u64>("PAYRECON_RETRY_BASE_MS", development)? {
        retry.base_delay = Duration::from_millis(base);
    }
    if let Some(ceiling) = vars.policy::<u64>("PAYRECON_RETRY_MAX_DELAY_SECS", development)? {
        retry.max_delay = Duration::from_secs(ceiling);
    }
    if let Some(jitter) = vars.flag("PAYRECON_RETRY_JITTER")? {
        retry.jitter = jitter;
    }
    Ok(retry)
}

fn dispatcher_config<F>(vars: &Vars<F>, development: bool) -> Result<DispatcherConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DispatcherConfig {
        retry: retry_policy(vars, development)?,
        ..DispatcherConfig::default()
    };
    if let Some(size) = vars.parse::<usize>("PAYRECON_DISPATCHER_BATCH_SIZE")? {
        config.batch_size = BatchSize::try_new(size)
            .map_err(|error| ConfigError::invalid("PAYRECON_DISPATCHER_BATCH_SIZE", error))?;
    }
    if let Some(concurrency) = vars.parse::<usize>("PAYRECON_DISPATCHER_CONCURRENCY")? {
        config.concurrency = Concurrency::try_new(concurrency)
            .map_err(|error| ConfigError::invalid("PAYRECON_DISPATCHER_CONCURRENCY", error))?;
    }
    if let Some(lease) = vars.seconds("PAYRECON_DISPATCHER_LEASE_SECS")? {
        config.lease = lease;
    }
    if let Some(timeout) = vars.seconds("PAYRECON_HANDLER_TIMEOUT_SECS")? {
        config.handler_timeout = timeout;
    }
    if let Some(poll) = vars.millis("PAYRECON_DISPATCHER_POLL_MS")? {
        config.poll_interval = poll;
    }
    if let Some(ceiling) = vars.millis("PAYRECON_DISPATCHER_MAX_IDLE_MS")? {
        config.max_idle_backoff = ceiling;
    }
    config.validate()?;
    Ok(config)
}

fn reconciliation_policy<F>(
    vars: &Vars<F>,
    development: bool,
) -> Result<ReconciliationPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut policy = ReconciliationPolicy::new(
        vars.account("PAYRECON_CLEARING_ACCOUNT", "paytr:clearing", development)?,
        vars.account(
            "PAYRECON_ADJUSTMENT_ACCOUNT",
            "reconciliation:adjustment",
            development,
        )?,
        vars.account(
            "PAYRECON_SUSPENSE_ACCOUNT",
            "reconciliation:suspense",
            development,
        )?,
    );
    if let Some(threshold) =
        vars.policy::<Decimal>("PAYRECON_AUTO_CORRECT_THRESHOLD", development)?
    {
        policy = policy.with_auto_correct_threshold(threshold);
    }
    if let Some(hours) = vars.policy::<u64>("PAYRECON_GRACE_PERIOD_HOURS", development)? {
        policy = policy.with_grace_period(Duration::from_secs(hours.saturating_mul(HOUR)));
    }
    policy.validate()?;
    Ok(policy)
}

fn worker_config<F>(vars: &Vars<F>, development: bool) -> Result<WorkerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = WorkerConfig::default();
    if let Some(interval) = vars.policy::<u64>("PAYRECON_RECONCILE_INTERVAL_SECS", development)? {
        config.interval = Duration::from_secs(interval);
    }
    if let Some(days) = vars.parse::<u32>("PAYRECON_RECONCILE_LOOKBACK_DAYS")? {
        config.lookback_days = days;
    }
    if let Some(run_on_start) = vars.flag("PAYRECON_RECONCILE_RUN_ON_START")? {
        config.run_on_start = run_on_start;
    }
    if let Some(stale) = vars.seconds("PAYRECON_RECONCILE_STALE_AFTER_SECS")? {
        config.stale_run_after = stale;
    }
    if let Some(retries) = vars.parse::<u32>("PAYRECON_GATEWAY_MAX_RETRIES")? {
        config.gateway_retry.max_retries = MaxRetries::try_new(retries)
            .map_err(|error| ConfigError::invalid("PAYRECON_GATEWAY_MAX_RETRIES", error))?;
    }
    config.validate()?;
    Ok(config)
}

fn paytr_config<F>(vars: &Vars<F>, development: bool) -> Result<Option<PaytrConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    const CREDENTIALS: [&str; 3] = [
        "PAYRECON_PAYTR_MERCHANT_ID",
        "PAYRECON_PAYTR_MERCHANT_KEY",
        "PAYRECON_PAYTR_MERCHANT_SALT",
    ];
    if development && CREDENTIALS.iter().all(|name| vars.get(name).is_none()) {
        return Ok(None);
    }

    let mut config = PaytrConfig::new(
        vars.required(CREDENTIALS[0])?,
        vars.required(CREDENTIALS[1])?,
        vars.required(CREDENTIALS[2])?,
    );
    if let Some(base_url) = vars.get("PAYRECON_PAYTR_BASE_URL") {
        config = config.with_base_url(base_url);
    }
    if let Some(timeout) = vars.seconds("PAYRECON_PAYTR_TIMEOUT_SECS")? {
        config = config.with_request_timeout(timeout);
    }
    if let Some(hours) = vars.parse::<u64>("PAYRECON_PAYTR_MAX_WINDOW_HOURS")? {
        config = config.with_max_window(Duration::from_secs(hours.saturating_mul(HOUR)));
    }
    if let Some(minutes) = vars.parse::<i32>("PAYRECON_PAYTR_UTC_OFFSET_MINUTES")? {
        config.utc_offset_minutes = minutes;
    }
    config
        .validate()
        .map_err(|error| ConfigError::invalid("PAYRECON_PAYTR", error))?;
    Ok(Some(config))
}

/// Load a `.env` file from the working directory or its parents.
///
/// A missing file is normal outside development and is not an error.
pub fn load_dotenv() -> Result<(), dotenvy::Error> {
    ignore_missing_dotenv(dotenvy::dotenv().map(|_| ()))
}

fn ignore_missing_dotenv(result: Result<(), dotenvy::Error>) -> Result<(), dotenvy::Error> {
    match result {
        Err(error) if error.not_found() => Ok(()),
        other => other,
    }
}

//! PostgreSQL stores for PayRecon.
//!
//! One connection pool backs three stores: [`PostgresOutboxStore`],
//! [`PostgresLedgerStore`] and [`PostgresRunStore`]. The schema ships as
//! embedded migrations (see [`PostgresDatabase::migrate`]).
//!
//! Producers that write business rows and outbox messages together use
//! [`PostgresOutboxStore::enqueue_with`] on their own transaction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod outbox;
mod runs;

use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use payrecon_types::Operation;
use serde::Deserialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use ledger::PostgresLedgerStore;
pub use outbox::PostgresOutboxStore;
pub use runs::PostgresRunStore;

/// Errors raised while setting up the database, before any store is used.
#[derive(Debug, Error)]
pub enum PostgresStoreError {
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    #[error("postgres is not answering queries")]
    PingFailed(#[source] sqlx::Error),

    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Backed by `NonZeroU32`, so an empty pool cannot be configured.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into, Deserialize))]
pub struct MaxConnections(NonZeroU32);

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// A migrated PayRecon database and the stores that share its pool.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: Pool<Postgres>,
}

impl PostgresDatabase {
    /// Connect with the default pool configuration.
    pub async fn connect<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with a custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let connection_string = connection_string.into();
        let max_connections: NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresStoreError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool, e.g. one shared with the host application.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), PostgresStoreError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresStoreError::PingFailed)?;
        Ok(())
    }

    /// Apply the embedded schema migrations.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStoreError::MigrationFailed)?;
        info!("[postgres.migrate] schema is up to date");
        Ok(())
    }

    pub fn outbox(&self) -> PostgresOutboxStore {
        PostgresOutboxStore::from_pool(self.pool.clone())
    }

    pub fn ledger(&self) -> PostgresLedgerStore {
        PostgresLedgerStore::from_pool(self.pool.clone())
    }

    pub fn runs(&self) -> PostgresRunStore {
        PostgresRunStore::from_pool(self.pool.clone())
    }
}

/// Whether retrying the same statement later can succeed.
///
/// Serialization failures, deadlocks, connection exhaustion, lost
/// connections and pool timeouts are transient. Constraint violations and
/// schema errors are not.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().is_some_and(|code| {
            matches!(&*code, "40001" | "40P01" | "53300" | "57P01" | "55P03")
                || code.starts_with("08")
        }),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

/// SQLSTATE of a database error, if it is one.
pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(std::borrow::Cow::into_owned),
        _ => None,
    }
}

/// Detail of a non-transient failure, `None` when a retry may succeed.
pub(crate) fn rejection(error: &sqlx::Error) -> Option<String> {
    (!is_transient(error)).then(|| match error {
        sqlx::Error::Database(db_error) => match db_error.code() {
            Some(code) => format!("{} (SQLSTATE {code})", db_error.message()),
            None => db_error.message().to_owned(),
        },
        other => other.to_string(),
    })
}

/// Log a failed statement at a level matching its retryability.
pub(crate) fn log_sqlx_error(error: &sqlx::Error, operation: Operation) {
    if is_transient(error) {
        warn!(
            error = %error,
            operation = %operation,
            "[postgres.transient_error] database operation failed, may succeed on retry"
        );
    } else {
        error!(
            error = %error,
            operation = %operation,
            "[postgres.database_error] database operation failed"
        );
    }
}

/// Decode one column, describing the failure for a `CorruptRow` error.
pub(crate) fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, String>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| format!("column {name}: {error}"))
}

/// Interval parameter for `make_interval(secs => $n)`.
pub(crate) fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// Saturating conversion for counters stored as `BIGINT`.
pub(crate) fn to_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

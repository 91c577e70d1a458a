use payrecon_types::{
    Currency, DateRange, Discrepancy, DiscrepancyId, DiscrepancyKind, ExternalRef, Operation,
    ReconciliationRun, Resolution, RunCounts, RunError, RunId, RunStatus, RunStore, RunTrigger,
    SettlementStatus,
};
use sqlx::postgres::PgRow;
use sqlx::{query, Pool, Postgres};
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{column, log_sqlx_error, rejection, seconds, to_bigint};

const COLUMNS: &str = "id, range_start, range_end, status, run_trigger, matched, unmatched, \
                       adjusted, ignored, attempts, started_at, finished_at, error";

const DISCREPANCY_COLUMNS: &str = "id, run_id, external_ref, kind, resolution, currency, \
                                   expected_amount, reported_amount, expected_status, \
                                   reported_status, note, created_at";

const ABANDONED: &str = "abandoned: still running after the staleness window";

/// How often `try_begin` retries when the run it collided with finished
/// before it could be named.
const BEGIN_ATTEMPTS: usize = 3;

/// Run store in `payrecon_runs` and `payrecon_discrepancies`.
///
/// The run lock is a partial unique index over running rows, so the
/// mutual exclusion holds across every process sharing the database.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Pool<Postgres>,
}

impl PostgresRunStore {
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// One attempt at taking the run lock. `Ok(None)` means the conflicting
    /// run disappeared before it could be reported.
    async fn begin_once(
        &self,
        range: DateRange,
        trigger: RunTrigger,
        stale_after: Duration,
    ) -> Result<Option<ReconciliationRun>, RunError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::BeginTransaction))?;

        let abandoned = query(
            "UPDATE payrecon_runs
             SET status = 'failed', finished_at = now(), error = $2
             WHERE status = 'running' AND started_at + make_interval(secs => $1) <= now()
             RETURNING id",
        )
        .bind(seconds(stale_after))
        .bind(ABANDONED)
        .fetch_all(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::WriteRun))?;
        for row in &abandoned {
            let id: Uuid = column(row, "id").map_err(corrupt)?;
            warn!(run_id = %id, "[reconciliation.abandon] marking stale run as failed");
        }

        let statement = format!(
            "INSERT INTO payrecon_runs (id, range_start, range_end, status, run_trigger)
             VALUES ($1, $2, $3, 'running', $4)
             ON CONFLICT DO NOTHING
             RETURNING {COLUMNS}"
        );
        let inserted = query(&statement)
            .bind(RunId::generate().into_inner())
            .bind(range.start())
            .bind(range.end())
            .bind(trigger.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::WriteRun))?;

        if let Some(row) = inserted {
            let run = run_from_row(&row)?;
            tx.commit()
                .await
                .map_err(|error| map_sqlx_error(&error, Operation::CommitTransaction))?;
            return Ok(Some(run));
        }

        let active = query("SELECT id FROM payrecon_runs WHERE status = 'running'")
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadRun))?;
        match active {
            Some(row) => Err(RunError::LockContention {
                active: RunId::new(column(&row, "id").map_err(corrupt)?),
            }),
            None => Ok(None),
        }
    }

    /// Explain why a `Running`-only update matched no row.
    async fn not_running(&self, id: RunId) -> RunError {
        let current = query("SELECT status FROM payrecon_runs WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await;
        match current {
            Ok(Some(row)) => match column::<String>(&row, "status").map_err(corrupt) {
                Ok(status) => match status_from(&status) {
                    Ok(status) => RunError::NotRunning { id, status },
                    Err(error) => error,
                },
                Err(error) => error,
            },
            Ok(None) => RunError::NotFound { id },
            Err(error) => map_sqlx_error(&error, Operation::ReadRun),
        }
    }

    async fn finish(
        &self,
        id: RunId,
        status: RunStatus,
        counts: RunCounts,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<ReconciliationRun, RunError> {
        let statement = format!(
            "UPDATE payrecon_runs
             SET status = $2, matched = $3, unmatched = $4, adjusted = $5, ignored = $6,
                 attempts = $7, error = $8, finished_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING {COLUMNS}"
        );
        let row = query(&statement)
            .bind(id.into_inner())
            .bind(status.as_str())
            .bind(to_bigint(counts.matched))
            .bind(to_bigint(counts.unmatched))
            .bind(to_bigint(counts.adjusted))
            .bind(to_bigint(counts.ignored))
            .bind(i64::from(attempts))
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::WriteRun))?;

        match row {
            Some(row) => run_from_row(&row),
            None => Err(self.not_running(id).await),
        }
    }
}

fn corrupt(detail: String) -> RunError {
    RunError::CorruptRow { detail }
}

fn map_sqlx_error(error: &sqlx::Error, operation: Operation) -> RunError {
    log_sqlx_error(error, operation);
    match rejection(error) {
        Some(detail) => RunError::Rejected { operation, detail },
        None => RunError::StoreFailure { operation },
    }
}

fn status_from(value: &str) -> Result<RunStatus, RunError> {
    RunStatus::parse(value).ok_or_else(|| corrupt(format!("unknown run status {value:?}")))
}

fn count(row: &PgRow, name: &str) -> Result<u64, RunError> {
    let value: i64 = column(row, name).map_err(corrupt)?;
    u64::try_from(value).map_err(|_| corrupt(format!("negative {name} {value}")))
}

fn run_from_row(row: &PgRow) -> Result<ReconciliationRun, RunError> {
    let status: String = column(row, "status").map_err(corrupt)?;
    let trigger: String = column(row, "run_trigger").map_err(corrupt)?;
    let attempts: i64 = column(row, "attempts").map_err(corrupt)?;

    Ok(ReconciliationRun {
        id: RunId::new(column(row, "id").map_err(corrupt)?),
        range: DateRange::new(
            column(row, "range_start").map_err(corrupt)?,
            column(row, "range_end").map_err(corrupt)?,
        )
        .map_err(|error| corrupt(error.to_string()))?,
        status: status_from(&status)?,
        trigger: RunTrigger::parse(&trigger)
            .ok_or_else(|| corrupt(format!("unknown run trigger {trigger:?}")))?,
        counts: RunCounts {
            matched: count(row, "matched")?,
            unmatched: count(row, "unmatched")?,
            adjusted: count(row, "adjusted")?,
            ignored: count(row, "ignored")?,
        },
        attempts: u32::try_from(attempts)
            .map_err(|_| corrupt(format!("attempts out of range {attempts}")))?,
        started_at: column(row, "started_at").map_err(corrupt)?,
        finished_at: column(row, "finished_at").map_err(corrupt)?,
        error: column(row, "error").map_err(corrupt)?,
    })
}

fn settlement_status(value: Option<String>) -> Result<Option<SettlementStatus>, RunError> {
    value
        .map(|status| {
            SettlementStatus::parse(&status)
                .ok_or_else(|| corrupt(format!("unknown settlement status {status:?}")))
        })
        .transpose()
}

fn discrepancy_from_row(row: &PgRow) -> Result<Discrepancy, RunError> {
    let external_ref: String = column(row, "external_ref").map_err(corrupt)?;
    let kind: String = column(row, "kind").map_err(corrupt)?;
    let resolution: String = column(row, "resolution").map_err(corrupt)?;
    let currency: String = column(row, "currency").map_err(corrupt)?;

    Ok(Discrepancy {
        id: DiscrepancyId::new(column(row, "id").map_err(corrupt)?),
        run_id: RunId::new(column(row, "run_id").map_err(corrupt)?),
        external_ref: ExternalRef::try_new(external_ref)
            .map_err(|error| corrupt(error.to_string()))?,
        kind: DiscrepancyKind::parse(&kind)
            .ok_or_else(|| corrupt(format!("unknown discrepancy kind {kind:?}")))?,
        resolution: Resolution::parse(&resolution)
            .ok_or_else(|| corrupt(format!("unknown resolution {resolution:?}")))?,
        currency: Currency::try_new(currency).map_err(|error| corrupt(error.to_string()))?,
        expected_amount: column(row, "expected_amount").map_err(corrupt)?,
        reported_amount: column(row, "reported_amount").map_err(corrupt)?,
        expected_status: settlement_status(column(row, "expected_status").map_err(corrupt)?)?,
        reported_status: settlement_status(column(row, "reported_status").map_err(corrupt)?)?,
        note: column(row, "note").map_err(corrupt)?,
        created_at: column(row, "created_at").map_err(corrupt)?,
    })
}

impl RunStore for PostgresRunStore {
    #[instrument(name = "postgres.try_begin", skip(self))]
    async fn try_begin(
        &self,
        range: DateRange,
        trigger: RunTrigger,
        stale_after: Duration,
    ) -> Result<ReconciliationRun, RunError> {
        for _ in 0..BEGIN_ATTEMPTS {
            if let Some(run) = self.begin_once(range, trigger, stale_after).await? {
                return Ok(run);
            }
        }
        Err(RunError::StoreFailure {
            operation: Operation::WriteRun,
        })
    }

    #[instrument(
        name = "postgres.record_discrepancy",
        skip(self, discrepancy),
        fields(run_id = %discrepancy.run_id, external_ref = %discrepancy.external_ref)
    )]
    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), RunError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::BeginTransaction))?;

        // Shares the row lock with complete/fail, so a finishing run cannot
        // slip in between the check and the insert.
        let run = query("SELECT status FROM payrecon_runs WHERE id = $1 FOR SHARE")
            .bind(discrepancy.run_id.into_inner())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::WriteRun))?
            .ok_or(RunError::NotFound {
                id: discrepancy.run_id,
            })?;
        let status: String = column(&run, "status").map_err(corrupt)?;
        let status = status_from(&status)?;
        if status != RunStatus::Running {
            return Err(RunError::NotRunning {
                id: discrepancy.run_id,
                status,
            });
        }

        let statement = format!(
            "INSERT INTO payrecon_discrepancies ({DISCREPANCY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                 kind = EXCLUDED.kind,
                 resolution = EXCLUDED.resolution,
                 currency = EXCLUDED.currency,
                 expected_amount = EXCLUDED.expected_amount,
                 reported_amount = EXCLUDED.reported_amount,
                 expected_status = EXCLUDED.expected_status,
                 reported_status = EXCLUDED.reported_status,
                 note = EXCLUDED.note"
        );
        query(&statement)
            .bind(discrepancy.id.into_inner())
            .bind(discrepancy.run_id.into_inner())
            .bind(discrepancy.external_ref.as_str())
            .bind(discrepancy.kind.as_str())
            .bind(discrepancy.resolution.as_str())
            .bind(discrepancy.currency.as_str())
            .bind(discrepancy.expected_amount)
            .bind(discrepancy.reported_amount)
            .bind(discrepancy.expected_status.map(SettlementStatus::as_str))
            .bind(discrepancy.reported_status.map(SettlementStatus::as_str))
            .bind(discrepancy.note.as_deref())
            .bind(discrepancy.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::WriteRun))?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::CommitTransaction))
    }

    #[instrument(name = "postgres.complete_run", skip(self))]
    async fn complete(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        status: RunStatus,
    ) -> Result<ReconciliationRun, RunError> {
        self.finish(id, status, counts, attempts, None).await
    }

    #[instrument(name = "postgres.fail_run", skip(self))]
    async fn fail(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        error: &str,
    ) -> Result<ReconciliationRun, RunError> {
        self.finish(id, RunStatus::Failed, counts, attempts, Some(error))
            .await
    }

    async fn get(&self, id: RunId) -> Result<Option<ReconciliationRun>, RunError> {
        let statement = format!("SELECT {COLUMNS} FROM payrecon_runs WHERE id = $1");
        let row = query(&statement)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadRun))?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn discrepancies(&self, id: RunId) -> Result<Vec<Discrepancy>, RunError> {
        // Byte-wise collation keeps the order identical to `ExternalRef`'s `Ord`.
        let statement = format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM payrecon_discrepancies
             WHERE run_id = $1
             ORDER BY external_ref COLLATE \"C\", id"
        );
        let rows = query(&statement)
            .bind(id.into_inner())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadRun))?;

        rows.iter().map(discrepancy_from_row).collect()
    }

    async fn latest(&self) -> Result<Option<ReconciliationRun>, RunError> {
        let statement = format!(
            "SELECT {COLUMNS} FROM payrecon_runs ORDER BY started_at DESC, id DESC LIMIT 1"
        );
        let row = query(&statement)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadRun))?;

        row.as_ref().map(run_from_row).transpose()
    }
}

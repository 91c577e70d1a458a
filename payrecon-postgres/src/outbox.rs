use chrono::{DateTime, Utc};
use payrecon_types::{
    MessageId, MessageType, NewOutboxMessage, Operation, OutboxError, OutboxMessage, OutboxStatus,
    OutboxStore, PartitionKey, WorkerId,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, PgExecutor, Pool, Postgres};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::{column, log_sqlx_error, rejection, seconds};

const COLUMNS: &str = "id, message_type, payload, partition_key, status, retry_count, \
                       next_attempt_at, claimed_by, created_at, processed_at, last_error";

/// Outbox backed by the `payrecon_outbox` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of dispatchers can
/// poll the same table without handing one row to two workers. Timestamps
/// that decide eligibility come from the database clock.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Pool<Postgres>,
}

impl PostgresOutboxStore {
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Enqueue on a caller-supplied executor.
    ///
    /// Pass the `&mut *tx` of the transaction that writes the business
    /// change: the message becomes visible to dispatchers exactly when that
    /// transaction commits, and disappears with it on rollback.
    ///
    /// ```ignore
    /// let mut tx = pool.begin().await?;
    /// sqlx::query("UPDATE orders SET paid = true WHERE id = $1")
    ///     .bind(order_id)
    ///     .execute(&mut *tx)
    ///     .await?;
    /// PostgresOutboxStore::enqueue_with(&mut *tx, message).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn enqueue_with<'e, E>(
        executor: E,
        message: NewOutboxMessage,
    ) -> Result<MessageId, OutboxError>
    where
        E: PgExecutor<'e>,
    {
        let row = query(
            "INSERT INTO payrecon_outbox (message_type, payload, partition_key, next_attempt_at)
             VALUES ($1, $2, $3, COALESCE($4, now()))
             RETURNING id",
        )
        .bind(message.message_type.as_str())
        .bind(Json(&message.payload))
        .bind(message.partition_key.as_deref().map(String::as_str))
        .bind(message.available_at)
        .fetch_one(executor)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::Enqueue))?;

        let id: i64 = column(&row, "id").map_err(corrupt)?;
        let id = MessageId::try_new(id).map_err(|error| corrupt(error.to_string()))?;
        debug!(
            message_id = %id,
            message_type = %message.message_type,
            "[outbox.enqueue] message enqueued"
        );
        Ok(id)
    }

    /// Explain why an outcome update matched no row.
    async fn claim_lost_or_missing(&self, id: MessageId, worker: &WorkerId) -> OutboxError {
        match self.exists(id).await {
            Ok(true) => OutboxError::ClaimLost {
                id,
                worker: worker.clone(),
            },
            Ok(false) => OutboxError::NotFound { id },
            Err(error) => error,
        }
    }

    async fn exists(&self, id: MessageId) -> Result<bool, OutboxError> {
        let row = query("SELECT 1 FROM payrecon_outbox WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadOutbox))?;
        Ok(row.is_some())
    }
}

fn corrupt(detail: String) -> OutboxError {
    OutboxError::CorruptRow { detail }
}

fn map_sqlx_error(error: &sqlx::Error, operation: Operation) -> OutboxError {
    log_sqlx_error(error, operation);
    match rejection(error) {
        Some(detail) => OutboxError::Rejected { operation, detail },
        None => OutboxError::StoreFailure { operation },
    }
}

fn status_from(value: &str) -> Result<OutboxStatus, OutboxError> {
    OutboxStatus::parse(value).ok_or_else(|| corrupt(format!("unknown outbox status {value:?}")))
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, OutboxError> {
    let id: i64 = column(row, "id").map_err(corrupt)?;
    let message_type: String = column(row, "message_type").map_err(corrupt)?;
    let Json(payload): Json<Value> = column(row, "payload").map_err(corrupt)?;
    let partition_key: Option<String> = column(row, "partition_key").map_err(corrupt)?;
    let status: String = column(row, "status").map_err(corrupt)?;
    let retry_count: i32 = column(row, "retry_count").map_err(corrupt)?;
    let claimed_by: Option<String> = column(row, "claimed_by").map_err(corrupt)?;

    Ok(OutboxMessage {
        id: MessageId::try_new(id).map_err(|error| corrupt(error.to_string()))?,
        message_type: MessageType::try_new(message_type)
            .map_err(|error| corrupt(error.to_string()))?,
        payload,
        partition_key: partition_key
            .map(PartitionKey::try_new)
            .transpose()
            .map_err(|error| corrupt(error.to_string()))?,
        status: status_from(&status)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| corrupt(format!("negative retry_count {retry_count}")))?,
        next_attempt_at: column(row, "next_attempt_at").map_err(corrupt)?,
        claimed_by: claimed_by
            .map(WorkerId::try_new)
            .transpose()
            .map_err(|error| corrupt(error.to_string()))?,
        created_at: column(row, "created_at").map_err(corrupt)?,
        processed_at: column(row, "processed_at").map_err(corrupt)?,
        last_error: column(row, "last_error").map_err(corrupt)?,
    })
}

impl OutboxStore for PostgresOutboxStore {
    #[instrument(name = "postgres.enqueue", skip(self, message))]
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<MessageId, OutboxError> {
        Self::enqueue_with(&self.pool, message).await
    }

    #[instrument(name = "postgres.claim_batch", skip(self, worker), fields(worker = %worker))]
    async fn claim_batch(
        &self,
        max: usize,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        // A keyed message waits for every older open message with its key;
        // the oldest open one is the only candidate of its key.
        let statement = format!(
            "WITH candidates AS (
                 SELECT candidate.id
                 FROM payrecon_outbox candidate
                 WHERE candidate.status IN ('pending', 'processing')
                   AND candidate.next_attempt_at <= now()
                   AND (candidate.partition_key IS NULL OR NOT EXISTS (
                       SELECT 1
                       FROM payrecon_outbox older
                       WHERE older.partition_key = candidate.partition_key
                         AND older.id < candidate.id
                         AND older.status IN ('pending', 'processing')
                   ))
                 ORDER BY candidate.id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE payrecon_outbox
             SET status = 'processing',
                 claimed_by = $2,
                 next_attempt_at = now() + make_interval(secs => $3)
             FROM candidates
             WHERE payrecon_outbox.id = candidates.id
             RETURNING {}",
            qualified_columns("payrecon_outbox")
        );

        let rows = query(&statement)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .bind(worker.as_str())
            .bind(seconds(lease))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ClaimBatch))?;

        let mut claimed = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|message| message.id);

        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), "[outbox.claim] claimed batch");
        }
        Ok(claimed)
    }

    #[instrument(name = "postgres.mark_delivered", skip(self, worker), fields(worker = %worker))]
    async fn mark_delivered(&self, id: MessageId, worker: &WorkerId) -> Result<(), OutboxError> {
        let result = query(
            "UPDATE payrecon_outbox
             SET status = 'delivered', processed_at = now()
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(id.into_inner())
        .bind(worker.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::MarkOutcome))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(id, worker).await);
        }
        Ok(())
    }

    #[instrument(name = "postgres.mark_failed", skip(self, worker, error), fields(worker = %worker))]
    async fn mark_failed(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let result = query(
            "UPDATE payrecon_outbox
             SET status = 'pending',
                 retry_count = retry_count + 1,
                 next_attempt_at = $3,
                 claimed_by = NULL,
                 last_error = $4
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(id.into_inner())
        .bind(worker.as_str())
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::MarkOutcome))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(id, worker).await);
        }
        Ok(())
    }

    #[instrument(name = "postgres.mark_exhausted", skip(self, worker, error), fields(worker = %worker))]
    async fn mark_exhausted(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        let result = query(
            "UPDATE payrecon_outbox
             SET status = 'failed',
                 retry_count = retry_count + 1,
                 claimed_by = NULL,
                 last_error = $3
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2",
        )
        .bind(id.into_inner())
        .bind(worker.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::MarkOutcome))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_lost_or_missing(id, worker).await);
        }
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let statement = format!(
            "SELECT {COLUMNS} FROM payrecon_outbox WHERE id = $1
             UNION ALL
             SELECT {COLUMNS} FROM payrecon_outbox_archive WHERE id = $1
             LIMIT 1"
        );
        let row = query(&statement)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadOutbox))?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let statement =
            format!("SELECT {COLUMNS} FROM payrecon_outbox WHERE status = 'failed' ORDER BY id LIMIT $1");
        let rows = query(&statement)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadOutbox))?;

        rows.iter().map(message_from_row).collect()
    }

    #[instrument(name = "postgres.requeue", skip(self))]
    async fn requeue(&self, id: MessageId) -> Result<(), OutboxError> {
        let result = query(
            "UPDATE payrecon_outbox
             SET status = 'pending', retry_count = 0, next_attempt_at = now(), claimed_by = NULL
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(id.into_inner())
        .execute(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::MaintainOutbox))?;

        if result.rows_affected() == 1 {
            info!(message_id = %id, "[outbox.requeue] failed message requeued");
            return Ok(());
        }

        let current = query("SELECT status FROM payrecon_outbox WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::MaintainOutbox))?;
        match current {
            Some(row) => {
                let status: String = column(&row, "status").map_err(corrupt)?;
                Err(OutboxError::InvalidTransition {
                    id,
                    status: status_from(&status)?,
                })
            }
            None => Err(OutboxError::NotFound { id }),
        }
    }

    #[instrument(name = "postgres.archive_delivered", skip(self))]
    async fn archive_delivered(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let statement = format!(
            "WITH moved AS (
                 DELETE FROM payrecon_outbox
                 WHERE status = 'delivered' AND processed_at < $1
                 RETURNING {COLUMNS}
             )
             INSERT INTO payrecon_outbox_archive ({COLUMNS})
             SELECT {COLUMNS} FROM moved"
        );
        let result = query(&statement)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::MaintainOutbox))?;

        let archived = result.rows_affected();
        if archived > 0 {
            info!(archived, "[outbox.archive] delivered messages archived");
        }
        Ok(archived)
    }
}

fn qualified_columns(table: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|name| format!("{table}.{name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

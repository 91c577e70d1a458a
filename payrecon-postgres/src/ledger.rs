use payrecon_types::{
    AccountCode, Currency, DateRange, DiscrepancyId, EntryKind, ExternalRef, LedgerError,
    LedgerPosting, LedgerStore, LedgerTransaction, NewLedgerTransaction, Operation,
    SettlementStatus, TransactionId,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{query, Pool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{column, log_sqlx_error, rejection, sqlstate};

const COLUMNS: &str =
    "id, external_ref, kind, status, occurred_at, recorded_at, reverses, discrepancy_id";

/// Append-only ledger in `payrecon_ledger_transactions` and
/// `payrecon_ledger_postings`.
///
/// The schema rejects `UPDATE`, `DELETE` and `TRUNCATE` on both tables and
/// re-checks the per-currency balance of every transaction at commit.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Pool<Postgres>,
}

impl PostgresLedgerStore {
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Attach postings to transaction rows that were already fetched in
    /// chronological order.
    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<LedgerTransaction>, LedgerError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = rows
            .iter()
            .map(|row| column::<Uuid>(row, "id").map_err(corrupt))
            .collect::<Result<Vec<_>, _>>()?;
        let posting_rows = query(
            "SELECT transaction_id, account, amount, currency
             FROM payrecon_ledger_postings
             WHERE transaction_id = ANY($1)
             ORDER BY transaction_id, line",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::ReadLedger))?;

        let mut postings: HashMap<Uuid, Vec<LedgerPosting>> = HashMap::new();
        for row in &posting_rows {
            let transaction_id: Uuid = column(row, "transaction_id").map_err(corrupt)?;
            postings
                .entry(transaction_id)
                .or_default()
                .push(posting_from_row(row)?);
        }

        let mut transactions = rows
            .iter()
            .map(|row| {
                let id: Uuid = column(row, "id").map_err(corrupt)?;
                transaction_from_row(row, postings.remove(&id).unwrap_or_default())
            })
            .collect::<Result<Vec<_>, _>>()?;
        transactions.sort_by_key(LedgerTransaction::chronology);
        Ok(transactions)
    }
}

fn corrupt(detail: String) -> LedgerError {
    LedgerError::CorruptRow { detail }
}

fn map_sqlx_error(error: &sqlx::Error, operation: Operation) -> LedgerError {
    log_sqlx_error(error, operation);
    match rejection(error) {
        Some(detail) => LedgerError::Rejected { operation, detail },
        None => LedgerError::StoreFailure { operation },
    }
}

fn posting_from_row(row: &PgRow) -> Result<LedgerPosting, LedgerError> {
    let account: String = column(row, "account").map_err(corrupt)?;
    let amount: Decimal = column(row, "amount").map_err(corrupt)?;
    let currency: String = column(row, "currency").map_err(corrupt)?;

    Ok(LedgerPosting::new(
        AccountCode::try_new(account).map_err(|error| corrupt(error.to_string()))?,
        amount,
        Currency::try_new(currency).map_err(|error| corrupt(error.to_string()))?,
    ))
}

fn transaction_from_row(
    row: &PgRow,
    postings: Vec<LedgerPosting>,
) -> Result<LedgerTransaction, LedgerError> {
    let external_ref: String = column(row, "external_ref").map_err(corrupt)?;
    let kind: String = column(row, "kind").map_err(corrupt)?;
    let status: String = column(row, "status").map_err(corrupt)?;
    let reverses: Option<Uuid> = column(row, "reverses").map_err(corrupt)?;
    let discrepancy: Option<Uuid> = column(row, "discrepancy_id").map_err(corrupt)?;

    Ok(LedgerTransaction {
        id: TransactionId::new(column(row, "id").map_err(corrupt)?),
        external_ref: ExternalRef::try_new(external_ref)
            .map_err(|error| corrupt(error.to_string()))?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| corrupt(format!("unknown entry kind {kind:?}")))?,
        status: SettlementStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("unknown settlement status {status:?}")))?,
        occurred_at: column(row, "occurred_at").map_err(corrupt)?,
        recorded_at: column(row, "recorded_at").map_err(corrupt)?,
        postings,
        reverses: reverses.map(TransactionId::new),
        discrepancy: discrepancy.map(DiscrepancyId::new),
    })
}

/// Check the reversal rules for `target` inside the writing transaction.
///
/// The target row is locked so that a concurrent reversal of the same
/// transaction waits and then sees this one.
async fn check_reversal(
    tx: &mut Transaction<'_, Postgres>,
    target: TransactionId,
    external_ref: &ExternalRef,
) -> Result<(), LedgerError> {
    let row = query(
        "SELECT target.external_ref,
                EXISTS (
                    SELECT 1 FROM payrecon_ledger_transactions reversal
                    WHERE reversal.reverses = target.id
                ) AS reversed
         FROM payrecon_ledger_transactions target
         WHERE target.id = $1
         FOR UPDATE",
    )
    .bind(target.into_inner())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|error| map_sqlx_error(&error, Operation::RecordTransaction))?
    .ok_or(LedgerError::ReversalTargetNotFound { id: target })?;

    let target_ref: String = column(&row, "external_ref").map_err(corrupt)?;
    if target_ref != external_ref.as_str() {
        return Err(LedgerError::ReversalReferenceMismatch {
            id: target,
            expected: ExternalRef::try_new(target_ref)
                .map_err(|error| corrupt(error.to_string()))?,
        });
    }
    let reversed: bool = column(&row, "reversed").map_err(corrupt)?;
    if reversed {
        return Err(LedgerError::AlreadyReversed { id: target });
    }
    Ok(())
}

async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    transaction: &NewLedgerTransaction,
) -> Result<TransactionId, LedgerError> {
    let id = TransactionId::generate();
    query(
        "INSERT INTO payrecon_ledger_transactions
             (id, external_ref, kind, status, occurred_at, reverses, discrepancy_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(id.into_inner())
    .bind(transaction.external_ref.as_str())
    .bind(transaction.kind.as_str())
    .bind(transaction.status.as_str())
    .bind(transaction.occurred_at)
    .bind(transaction.reverses.map(TransactionId::into_inner))
    .bind(transaction.discrepancy.map(DiscrepancyId::into_inner))
    .execute(&mut **tx)
    .await
    .map_err(|error| match transaction.reverses {
        // Lost a race against a concurrent reversal of the same target.
        Some(target) if sqlstate(&error).as_deref() == Some("23505") => {
            LedgerError::AlreadyReversed { id: target }
        }
        _ => map_sqlx_error(&error, Operation::RecordTransaction),
    })?;

    for (line, posting) in transaction.postings.iter().enumerate() {
        query(
            "INSERT INTO payrecon_ledger_postings (transaction_id, line, account, amount, currency)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id.into_inner())
        .bind(i32::try_from(line).unwrap_or(i32::MAX))
        .bind(posting.account.as_str())
        .bind(posting.amount)
        .bind(posting.currency.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|error| map_sqlx_error(&error, Operation::RecordTransaction))?;
    }
    Ok(id)
}

impl LedgerStore for PostgresLedgerStore {
    async fn record_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> Result<TransactionId, LedgerError> {
        let ids = self.record_batch(vec![transaction]).await?;
        ids.into_iter().next().ok_or(LedgerError::StoreFailure {
            operation: Operation::RecordTransaction,
        })
    }

    #[instrument(name = "postgres.record_batch", skip(self, transactions), fields(count = transactions.len()))]
    async fn record_batch(
        &self,
        transactions: Vec<NewLedgerTransaction>,
    ) -> Result<Vec<TransactionId>, LedgerError> {
        for transaction in &transactions {
            transaction.validate()?;
        }
        if transactions.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::BeginTransaction))?;

        let mut ids = Vec::with_capacity(transactions.len());
        for transaction in &transactions {
            if let Some(target) = transaction.reverses {
                check_reversal(&mut tx, target, &transaction.external_ref).await?;
            }
            ids.push(insert(&mut tx, transaction).await?);
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::CommitTransaction))?;

        info!(
            count = ids.len(),
            external_ref = %transactions[0].external_ref,
            "[ledger.record] transactions recorded"
        );
        Ok(ids)
    }

    async fn transactions_in_range(
        &self,
        range: DateRange,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let statement = format!(
            "SELECT {COLUMNS} FROM payrecon_ledger_transactions
             WHERE occurred_at >= $1 AND occurred_at < $2
             ORDER BY occurred_at, recorded_at, id"
        );
        let rows = query(&statement)
            .bind(range.start())
            .bind(range.end())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadLedger))?;

        self.hydrate(rows).await
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &ExternalRef,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let statement = format!(
            "SELECT {COLUMNS} FROM payrecon_ledger_transactions
             WHERE external_ref = $1
             ORDER BY occurred_at, recorded_at, id"
        );
        let rows = query(&statement)
            .bind(external_ref.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(&error, Operation::ReadLedger))?;

        self.hydrate(rows).await
    }
}

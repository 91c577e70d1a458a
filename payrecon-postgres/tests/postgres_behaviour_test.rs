//! Behaviour that only exists in the PostgreSQL stores: transactional
//! enqueue, the append-only ledger schema and cross-handle run locking.
//!
//! Needs a Docker daemon: `cargo test -p payrecon-postgres -- --ignored`.

mod common;

use std::time::Duration;

use payrecon_postgres::PostgresOutboxStore;
use payrecon_testing::fixtures::{at, external_ref, ledger_capture, outbox_message};
use payrecon_types::{
    DateRange, ErrorClass, LedgerError, LedgerStore, OutboxStatus, OutboxStore, RunError,
    RunStore, RunTrigger, WorkerId,
};
use rust_decimal_macros::dec;
use serde_json::json;

use crate::common::fresh_database;

fn any_range() -> DateRange {
    DateRange::new(at(2026, 1, 5, 0), at(2026, 1, 6, 0)).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn enqueue_with_commits_with_the_business_transaction() {
    let database = fresh_database().await;
    let outbox = database.outbox();

    let mut tx = database.pool().begin().await.unwrap();
    let id = PostgresOutboxStore::enqueue_with(
        &mut *tx,
        outbox_message("PaymentCaptured", json!({ "external_ref": "TX100" })),
    )
    .await
    .unwrap();
    assert_eq!(outbox.get(id).await.unwrap(), None, "invisible before commit");

    tx.commit().await.unwrap();

    let stored = outbox.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn enqueue_with_rolls_back_with_the_business_transaction() {
    let database = fresh_database().await;
    let outbox = database.outbox();

    let mut tx = database.pool().begin().await.unwrap();
    let id = PostgresOutboxStore::enqueue_with(
        &mut *tx,
        outbox_message("PaymentCaptured", json!({ "external_ref": "TX100" })),
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(outbox.get(id).await.unwrap(), None);
    let worker = WorkerId::try_new("dispatcher-1").unwrap();
    let claimed = outbox
        .claim_batch(10, &worker, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn ledger_rows_cannot_be_updated_or_deleted() {
    let database = fresh_database().await;
    let ledger = database.ledger();
    let id = ledger
        .record_transaction(ledger_capture("TX100", dec!(100.00), at(2026, 1, 5, 9)))
        .await
        .unwrap();

    let update = sqlx::query(
        "UPDATE payrecon_ledger_postings SET amount = amount * 2 WHERE transaction_id = $1",
    )
    .bind(id.into_inner())
    .execute(database.pool())
    .await;
    assert!(update.is_err(), "postings are append-only");

    let delete = sqlx::query("DELETE FROM payrecon_ledger_transactions WHERE id = $1")
        .bind(id.into_inner())
        .execute(database.pool())
        .await;
    assert!(delete.is_err(), "transactions are append-only");

    let kept = ledger
        .find_by_external_ref(&payrecon_testing::fixtures::external_ref("TX100"))
        .await
        .unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].postings[0].amount, dec!(100.00));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn unbalanced_postings_are_rejected_at_commit() {
    let database = fresh_database().await;
    let id = uuid::Uuid::now_v7();

    let mut tx = database.pool().begin().await.unwrap();
    sqlx::query(
        "INSERT INTO payrecon_ledger_transactions (id, external_ref, kind, status, occurred_at)
         VALUES ($1, 'TX900', 'capture', 'settled', now())",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO payrecon_ledger_postings (transaction_id, line, account, amount, currency)
         VALUES ($1, 0, 'paytr:clearing', 10, 'TRY')",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .unwrap();

    assert!(tx.commit().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn constraint_violations_are_not_retried() {
    let database = fresh_database().await;
    sqlx::query(
        "ALTER TABLE payrecon_ledger_postings
         ADD CONSTRAINT payrecon_test_amount_cap CHECK (abs(amount) < 1000)",
    )
    .execute(database.pool())
    .await
    .unwrap();

    let error = database
        .ledger()
        .record_transaction(ledger_capture("TX901", dec!(5000.00), at(2026, 1, 5, 9)))
        .await
        .unwrap_err();

    assert!(
        matches!(&error, LedgerError::Rejected { detail, .. } if detail.contains("23514")),
        "unexpected error: {error:?}"
    );
    assert_eq!(error.class(), ErrorClass::Fatal);
    assert!(database
        .ledger()
        .find_by_external_ref(&external_ref("TX901"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Docker"]
async fn run_lock_holds_across_store_handles() {
    let database = fresh_database().await;
    let first_process = database.runs();
    let second_process = database.runs();

    let (left, right) = tokio::join!(
        first_process.try_begin(any_range(), RunTrigger::Scheduled, Duration::from_secs(3600)),
        second_process.try_begin(any_range(), RunTrigger::Manual, Duration::from_secs(3600)),
    );

    let (winner, loser) = match (left, right) {
        (Ok(run), Err(error)) | (Err(error), Ok(run)) => (run, error),
        other => panic!("exactly one run must start, observed {other:?}"),
    };
    assert!(matches!(loser, RunError::LockContention { active } if active == winner.id));
}

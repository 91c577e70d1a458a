//! Reconciliation worker runs: locking, gateway retries and failure recording.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use payrecon::{
    DateRange, GatewayError, LedgerStore, MaxRetries, ReconciliationEngine, ReconciliationPolicy,
    ReconciliationWorker, RetryPolicy, RunError, RunStatus, RunStore, RunTrigger, TriggerError,
    WorkerConfig, WorkerError,
};
use payrecon_memory::{InMemoryLedgerStore, InMemoryOutboxStore, InMemoryRunStore};
use payrecon_testing::chaos::{ChaosConfig, ChaosStoreExt};
use payrecon_testing::fixtures::{
    account, at, gateway_sale, ledger_capture, ADJUSTMENTS, CLEARING, SUSPENSE,
};
use payrecon_testing::ScriptedFetcher;
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

type Worker<L> =
    ReconciliationWorker<ScriptedFetcher, L, InMemoryOutboxStore, InMemoryRunStore>;

fn settlement_day() -> DateRange {
    let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
    DateRange::days(day, day).unwrap()
}

fn worker_config(max_retries: u32) -> WorkerConfig {
    WorkerConfig {
        interval: Duration::from_secs(60 * 60),
        lookback_days: 1,
        run_on_start: false,
        stale_run_after: Duration::from_secs(60 * 60),
        gateway_retry: RetryPolicy {
            max_retries: MaxRetries::try_new(max_retries).unwrap(),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        },
    }
}

fn build<L: LedgerStore>(
    fetcher: Arc<ScriptedFetcher>,
    ledger: L,
    config: WorkerConfig,
) -> (Worker<L>, Arc<InMemoryRunStore>) {
    let runs = Arc::new(InMemoryRunStore::new());
    let engine = ReconciliationEngine::new(
        Arc::new(ledger),
        Arc::new(InMemoryOutboxStore::new()),
        Arc::clone(&runs),
        ReconciliationPolicy::new(account(CLEARING), account(ADJUSTMENTS), account(SUSPENSE)),
    );
    (
        ReconciliationWorker::new(fetcher, engine, Arc::clone(&runs), config),
        runs,
    )
}

async fn ledger_with_tx100() -> InMemoryLedgerStore {
    let ledger = InMemoryLedgerStore::new();
    let _ = ledger
        .record_transaction(ledger_capture("TX100", dec!(100.00), at(2026, 1, 5, 9)))
        .await
        .unwrap();
    ledger
}

fn unavailable() -> GatewayError {
    GatewayError::Unavailable {
        detail: "HTTP 503 from report endpoint".to_owned(),
    }
}

#[tokio::test]
async fn agreeing_report_completes_the_run() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![gateway_sale(
        "TX100",
        dec!(100.00),
        at(2026, 1, 5, 10),
    )]));
    let (worker, runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(2));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.run.counts.matched, 1);
    assert_eq!(report.run.attempts, 1);
    assert!(report.run.finished_at.is_some());
    assert_eq!(fetcher.requested_ranges(), vec![settlement_day()]);
    assert_eq!(runs.latest().await.unwrap(), Some(report.run));
}

#[tokio::test]
async fn discrepancies_complete_the_run_with_review_status() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![
        gateway_sale("TX100", dec!(100.00), at(2026, 1, 5, 10)),
        gateway_sale("TX200", dec!(50.00), at(2026, 1, 5, 14)),
    ]));
    let (worker, _runs) = build(fetcher, ledger_with_tx100().await, worker_config(2));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::CompletedWithDiscrepancies);
    assert_eq!(report.run.counts.matched, 1);
    assert_eq!(report.run.counts.unmatched, 1);
    assert_eq!(report.discrepancies.len(), 1);
    assert_eq!(report.enqueued, 2);
}

#[tokio::test]
async fn unavailable_gateway_is_retried_within_the_run() {
    let fetcher = Arc::new(
        ScriptedFetcher::new(vec![gateway_sale("TX100", dec!(100.00), at(2026, 1, 5, 10))])
            .then_respond(Err(unavailable()))
            .then_respond(Err(unavailable())),
    );
    let (worker, _runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(2));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.run.attempts, 3);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn gateway_outage_beyond_the_cap_fails_the_run() {
    let fetcher = Arc::new(ScriptedFetcher::failing(unavailable()));
    let (worker, runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(2));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.run.attempts, 3);
    assert_eq!(fetcher.calls(), 3);
    assert!(report
        .run
        .error
        .as_deref()
        .is_some_and(|error| error.contains("unavailable")));

    // The failed run released the lock.
    let next = runs
        .try_begin(settlement_day(), RunTrigger::Manual, Duration::from_secs(60))
        .await;
    assert!(next.is_ok());
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let fetcher = Arc::new(ScriptedFetcher::failing(GatewayError::Auth {
        detail: "paytr_token mismatch".to_owned(),
    }));
    let (worker, _runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(5));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.run.attempts, 1);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn overlapping_trigger_is_skipped_with_lock_contention() {
    let fetcher = Arc::new(
        ScriptedFetcher::new(vec![gateway_sale("TX100", dec!(100.00), at(2026, 1, 5, 10))])
            .with_delay(Duration::from_millis(100)),
    );
    let (worker, _runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(2));

    let (first, second) = tokio::join!(
        worker.run_once(settlement_day(), RunTrigger::Scheduled),
        worker.run_once(settlement_day(), RunTrigger::Manual),
    );

    let first = first.unwrap();
    assert_eq!(first.run.status, RunStatus::Completed);
    let second = second.unwrap_err();
    assert!(second.is_lock_contention());
    assert!(matches!(
        second,
        WorkerError::Run(RunError::LockContention { active }) if active == first.run.id
    ));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn engine_failure_fails_the_run_and_keeps_it_diagnosable() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![gateway_sale(
        "TX100",
        dec!(95.00),
        at(2026, 1, 5, 10),
    )]));
    let ledger = InMemoryLedgerStore::new()
        .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));
    let (worker, runs) = build(fetcher, ledger, worker_config(2));

    let report = worker
        .run_once(settlement_day(), RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    assert!(report.run.error.is_some());
    let stored = runs.get(report.run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
}

#[tokio::test]
async fn manual_trigger_waits_one_deep() {
    let fetcher = Arc::new(ScriptedFetcher::new(Vec::new()));
    let (worker, _runs) = build(fetcher, InMemoryLedgerStore::new(), worker_config(2));
    let handle = worker.handle();

    assert_eq!(handle.trigger(settlement_day()), Ok(()));
    assert_eq!(handle.trigger(settlement_day()), Err(TriggerError::Busy));

    drop(worker);
    assert_eq!(handle.trigger(settlement_day()), Err(TriggerError::Stopped));
}

#[tokio::test]
async fn run_loop_executes_manual_triggers_until_shutdown() {
    let fetcher = Arc::new(ScriptedFetcher::new(vec![gateway_sale(
        "TX100",
        dec!(100.00),
        at(2026, 1, 5, 10),
    )]));
    let (worker, runs) = build(Arc::clone(&fetcher), ledger_with_tx100().await, worker_config(2));
    let worker = Arc::new(worker);
    let handle = worker.handle();
    let shutdown = CancellationToken::new();
    let running = {
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    handle.trigger(settlement_day()).unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(run) = runs.latest().await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(finished.trigger, RunTrigger::Manual);
    assert_eq!(finished.status, RunStatus::Completed);

    shutdown.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(1), running).await;
    assert!(stopped.is_ok(), "worker loop stops after cancellation");
}

//! Reconciliation worker: the scheduled driver around the report fetcher and
//! the reconciliation engine.
//!
//! State machine per run: `Idle -> Running -> {Completed |
//! CompletedWithDiscrepancies | Failed}`. Only one run may be `Running`; the
//! run store enforces it. A trigger that finds a run in progress is skipped,
//! never queued.

use crate::config::WorkerConfig;
use crate::reconcile::{ReconcileError, ReconciliationEngine};
use chrono::Utc;
use payrecon_types::{
    DateRange, DateRangeError, Discrepancy, ErrorClass, GatewayError, GatewayTransactionRecord,
    LedgerStore, OutboxStore, ReconciliationRun, RunCounts, RunError, RunStatus, RunStore,
    RunTrigger, SettlementReportFetcher,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Error type returned by [`ReconciliationWorker::run_once`] when no run
/// could be started or its outcome could not be recorded.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("cannot compute reconciliation range: {0}")]
    Range(#[from] DateRangeError),
}

impl WorkerError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Run(error) => error.class(),
            Self::Range(_) => ErrorClass::Fatal,
        }
    }

    /// Another run holds the run lock.
    pub const fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Run(RunError::LockContention { .. }))
    }
}

/// Returned by [`WorkerHandle::trigger`] when a manual run cannot be accepted.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerError {
    /// A manual run is already waiting to start.
    #[error("a manual reconciliation run is already pending")]
    Busy,
    /// The worker loop has stopped.
    #[error("the reconciliation worker is not running")]
    Stopped,
}

/// Result of one executed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Final state of the run.
    pub run: ReconciliationRun,
    pub discrepancies: Vec<Discrepancy>,
    /// Outbox messages enqueued as follow-ups.
    pub enqueued: usize,
}

/// Requests manual runs from a running [`ReconciliationWorker`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<DateRange>,
}

impl WorkerHandle {
    /// Ask the worker loop to reconcile `range` as soon as it is idle.
    ///
    /// At most one manual request waits at a time; further requests are
    /// rejected rather than queued.
    pub fn trigger(&self, range: DateRange) -> Result<(), TriggerError> {
        self.sender.try_send(range).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => TriggerError::Busy,
            mpsc::error::TrySendError::Closed(_) => TriggerError::Stopped,
        })
    }
}

enum FetchFailure {
    /// The gateway stayed unavailable for every allowed attempt, or failed
    /// with a non-retryable error.
    Gateway(GatewayError),
    /// Shutdown was requested while waiting between attempts.
    Cancelled,
}

/// Scheduled driver of the reconciliation engine.
///
/// Holds its own stores, fetcher and configuration; constructed once at
/// start-up and driven by [`ReconciliationWorker::run`] until the shutdown
/// token is cancelled.
pub struct ReconciliationWorker<F, L, O, R> {
    fetcher: Arc<F>,
    engine: ReconciliationEngine<L, O, R>,
    runs: Arc<R>,
    config: WorkerConfig,
    sender: mpsc::Sender<DateRange>,
    triggers: Mutex<mpsc::Receiver<DateRange>>,
}

impl<F, L, O, R> ReconciliationWorker<F, L, O, R>
where
    F: SettlementReportFetcher,
    L: LedgerStore,
    O: OutboxStore,
    R: RunStore,
{
    pub fn new(
        fetcher: Arc<F>,
        engine: ReconciliationEngine<L, O, R>,
        runs: Arc<R>,
        config: WorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            fetcher,
            engine,
            runs,
            config,
            sender,
            triggers: Mutex::new(receiver),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            sender: self.sender.clone(),
        }
    }

    /// The range a scheduled run started now would cover.
    pub fn scheduled_range(&self) -> Result<DateRange, DateRangeError> {
        DateRange::lookback(Utc::now().date_naive(), self.config.lookback_days)
    }

    /// Execute one run for `range`.
    ///
    /// Returns [`WorkerError::Run`] with [`RunError::LockContention`] when
    /// another run is active. Gateway and engine failures do not surface as
    /// errors: the run is recorded as `Failed` and returned in the report.
    pub async fn run_once(
        &self,
        range: DateRange,
        trigger: RunTrigger,
    ) -> Result<RunReport, WorkerError> {
        self.run_once_until(range, trigger, &CancellationToken::new())
            .await
    }

    #[instrument(
        name = "reconciliation.run",
        skip(self, shutdown),
        fields(range = %range, trigger = trigger.as_str())
    )]
    async fn run_once_until(
        &self,
        range: DateRange,
        trigger: RunTrigger,
        shutdown: &CancellationToken,
    ) -> Result<RunReport, WorkerError> {
        let run = self
            .runs
            .try_begin(range, trigger, self.config.stale_run_after)
            .await?;
        info!(run_id = %run.id, "[reconciliation.start] run started");

        let (records, attempts) = match self.fetch_with_retry(range, shutdown).await {
            Ok(fetched) => fetched,
            Err((failure, attempts)) => {
                let reason = match failure {
                    FetchFailure::Gateway(error) => {
                        error!(
                            run_id = %run.id,
                            error = %error,
                            class = ?error.class(),
                            attempts,
                            "[reconciliation.fetch] settlement report unavailable"
                        );
                        error.to_string()
                    }
                    FetchFailure::Cancelled => {
                        warn!(run_id = %run.id, "[reconciliation.fetch] cancelled by shutdown");
                        "cancelled by shutdown before the report was fetched".to_owned()
                    }
                };
                let run = self
                    .runs
                    .fail(run.id, RunCounts::default(), attempts, &reason)
                    .await?;
                return Ok(RunReport {
                    run,
                    discrepancies: Vec::new(),
                    enqueued: 0,
                });
            }
        };

        match self
            .engine
            .reconcile(run.id, range, Utc::now(), &records)
            .await
        {
            Ok(outcome) => {
                let status = if outcome.needs_review() {
                    RunStatus::CompletedWithDiscrepancies
                } else {
                    RunStatus::Completed
                };
                let run = self
                    .runs
                    .complete(run.id, outcome.counts, attempts, status)
                    .await?;
                info!(
                    run_id = %run.id,
                    status = %run.status,
                    matched = run.counts.matched,
                    unmatched = run.counts.unmatched,
                    adjusted = run.counts.adjusted,
                    ignored = run.counts.ignored,
                    "[reconciliation.finish] run finished"
                );
                Ok(RunReport {
                    run,
                    enqueued: outcome.enqueued.len(),
                    discrepancies: outcome.discrepancies,
                })
            }
            Err(engine_error) => self.fail_after_engine_error(run.id, attempts, &engine_error).await,
        }
    }

    async fn fail_after_engine_error(
        &self,
        run_id: payrecon_types::RunId,
        attempts: u32,
        engine_error: &ReconcileError,
    ) -> Result<RunReport, WorkerError> {
        error!(
            run_id = %run_id,
            error = %engine_error,
            class = ?engine_error.class(),
            "[reconciliation.fail] run failed; recorded discrepancies are kept"
        );
        let discrepancies = self.runs.discrepancies(run_id).await?;
        let counts = partial_counts(&discrepancies);
        let run = self
            .runs
            .fail(run_id, counts, attempts, &engine_error.to_string())
            .await?;
        Ok(RunReport {
            run,
            discrepancies,
            enqueued: 0,
        })
    }

    /// Fetch the report, retrying `Unavailable` with backoff up to the
    /// configured cap. Returns the records and the number of attempts used.
    async fn fetch_with_retry(
        &self,
        range: DateRange,
        shutdown: &CancellationToken,
    ) -> Result<(Vec<GatewayTransactionRecord>, u32), (FetchFailure, u32)> {
        let policy = &self.config.gateway_retry;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.fetcher.fetch_settlement_report(range).await {
                Ok(records) => return Ok((records, attempts)),
                Err(error @ GatewayError::Unavailable { .. }) => {
                    if policy.is_exhausted(attempts) {
                        return Err((FetchFailure::Gateway(error), attempts));
                    }
                    let delay = policy.delay_for(attempts - 1);
                    warn!(
                        error = %error,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "[reconciliation.fetch] gateway unavailable, retrying"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => return Err((FetchFailure::Cancelled, attempts)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return Err((FetchFailure::Gateway(error), attempts)),
            }
        }
    }

    /// Run on the configured interval and on manual triggers until `shutdown`
    /// is cancelled.
    ///
    /// Ticks that fall due while a run is executing are skipped. A run in
    /// progress when shutdown is requested is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut triggers = self.triggers.lock().await;
        let start = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.config.interval
        };
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.interval.as_secs(),
            lookback_days = self.config.lookback_days,
            "[reconciliation.worker] started"
        );

        loop {
            let (range, trigger) = tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.scheduled_range() {
                    Ok(range) => (range, RunTrigger::Scheduled),
                    Err(error) => {
                        error!(error = %error, "[reconciliation.worker] invalid scheduled range");
                        continue;
                    }
                },
                Some(range) = triggers.recv() => (range, RunTrigger::Manual),
            };

            match self.run_once_until(range, trigger, &shutdown).await {
                Ok(_) => {}
                Err(error) if error.is_lock_contention() => {
                    warn!(
                        error = %error,
                        trigger = trigger.as_str(),
                        "[reconciliation.skip] another run is active; trigger skipped"
                    );
                }
                Err(error) => {
                    error!(
                        error = %error,
                        class = ?error.class(),
                        "[reconciliation.worker] run could not be recorded"
                    );
                }
            }
        }

        info!("[reconciliation.worker] stopped");
    }
}

fn partial_counts(discrepancies: &[Discrepancy]) -> RunCounts {
    let mut counts = RunCounts::default();
    for discrepancy in discrepancies {
        match discrepancy.resolution {
            payrecon_types::Resolution::AutoCorrected => counts.adjusted += 1,
            payrecon_types::Resolution::PendingReview => counts.unmatched += 1,
            payrecon_types::Resolution::Ignored => counts.ignored += 1,
        }
    }
    counts
}

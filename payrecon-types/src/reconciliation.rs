//! Reconciliation run bookkeeping: date ranges, runs, discrepancies and the
//! run store that doubles as the single-run lock.

use crate::errors::{ErrorClass, Operation};
use crate::ids::{DiscrepancyId, ExternalRef, RunId};
use crate::ledger::SettlementStatus;
use crate::money::Currency;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Half-open `[start, end)` interval of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Returned when a range would be empty or inverted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("date range start {start} must be before end {end}")]
pub struct DateRangeError {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, DateRangeError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(DateRangeError { start, end })
        }
    }

    /// Whole UTC days `[first, last]`, inclusive of `last`.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Result<Self, DateRangeError> {
        let start = first.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = last
            .succ_opt()
            .map_or(DateTime::<Utc>::MAX_UTC, |next| {
                next.and_time(chrono::NaiveTime::MIN).and_utc()
            });
        Self::new(start, end)
    }

    /// The `lookback_days` whole days that end just before `today` begins.
    pub fn lookback(today: NaiveDate, lookback_days: u32) -> Result<Self, DateRangeError> {
        let end = today.and_time(chrono::NaiveTime::MIN).and_utc();
        let start = end
            .checked_sub_signed(TimeDelta::days(i64::from(lookback_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::new(start, end)
    }

    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Split into consecutive sub-ranges no longer than `max_window`.
    ///
    /// A zero window is treated as one second.
    pub fn windows(&self, max_window: Duration) -> Vec<Self> {
        let step = TimeDelta::from_std(max_window.max(Duration::from_secs(1)))
            .unwrap_or(TimeDelta::MAX);
        let mut windows = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor
                .checked_add_signed(step)
                .map_or(self.end, |next| next.min(self.end));
            windows.push(Self {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        windows
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Lifecycle of a reconciliation run. Only `Running` is mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithDiscrepancies,
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithDiscrepancies => "completed_with_discrepancies",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "completed_with_discrepancies" => Some(Self::CompletedWithDiscrepancies),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Per-run tallies of external references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// References whose amount and status agree on both sides.
    pub matched: u64,
    /// Discrepancies left for review.
    pub unmatched: u64,
    /// Discrepancies resolved by an automatic correction.
    pub adjusted: u64,
    /// Discrepancies recorded but not actionable.
    pub ignored: u64,
}

/// One reconciliation run. Immutable once it leaves `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub range: DateRange,
    pub status: RunStatus,
    pub trigger: RunTrigger,
    pub counts: RunCounts,
    /// Gateway fetch attempts used.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    /// Reported by the processor but absent from the ledger.
    MissingInLedger,
    /// Present in the ledger but not reported after the grace period.
    MissingInGateway,
    AmountMismatch,
    StatusMismatch,
}

impl DiscrepancyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingInLedger => "missing_in_ledger",
            Self::MissingInGateway => "missing_in_gateway",
            Self::AmountMismatch => "amount_mismatch",
            Self::StatusMismatch => "status_mismatch",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missing_in_ledger" => Some(Self::MissingInLedger),
            "missing_in_gateway" => Some(Self::MissingInGateway),
            "amount_mismatch" => Some(Self::AmountMismatch),
            "status_mismatch" => Some(Self::StatusMismatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    AutoCorrected,
    PendingReview,
    Ignored,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoCorrected => "auto_corrected",
            Self::PendingReview => "pending_review",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_corrected" => Some(Self::AutoCorrected),
            "pending_review" => Some(Self::PendingReview),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }
}

/// A disagreement between the ledger and the processor for one reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: DiscrepancyId,
    pub run_id: RunId,
    pub external_ref: ExternalRef,
    pub kind: DiscrepancyKind,
    pub resolution: Resolution,
    pub currency: Currency,
    /// Net amount the ledger expects; `None` when missing in the ledger.
    pub expected_amount: Option<Decimal>,
    /// Net amount the processor reports; `None` when missing in the gateway.
    pub reported_amount: Option<Decimal>,
    pub expected_status: Option<SettlementStatus>,
    pub reported_status: Option<SettlementStatus>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Error type returned by run store operations.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RunError {
    /// Another run currently holds the run lock.
    #[error("reconciliation run {active} is already running")]
    LockContention { active: RunId },

    #[error("reconciliation run {id} not found")]
    NotFound { id: RunId },

    /// The run already finished and can no longer change.
    #[error("reconciliation run {id} is {status}, not running")]
    NotRunning { id: RunId, status: RunStatus },

    #[error("corrupt run row: {detail}")]
    CorruptRow { detail: String },

    /// The database refused the statement: a constraint, trigger or schema
    /// error. Retrying the same write cannot succeed.
    #[error("{operation} rejected by the database: {detail}")]
    Rejected { operation: Operation, detail: String },

    /// Infrastructure failure in the backing store.
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },
}

impl RunError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::LockContention { .. } => ErrorClass::LockContention,
            Self::StoreFailure { .. } => ErrorClass::TransientInfrastructure,
            Self::NotFound { .. }
            | Self::NotRunning { .. }
            | Self::CorruptRow { .. }
            | Self::Rejected { .. } => ErrorClass::Fatal,
        }
    }
}

/// Persistence for reconciliation runs and their discrepancies.
///
/// [`RunStore::try_begin`] is the mutual-exclusion point of the worker: at
/// most one run is `Running` at any time across every process sharing the
/// store.
pub trait RunStore: Send + Sync {
    /// Atomically start a run unless one is already running.
    ///
    /// A `Running` run started more than `stale_after` ago is considered
    /// abandoned by a crashed worker; it is marked `Failed` first and the new
    /// run proceeds.
    fn try_begin(
        &self,
        range: DateRange,
        trigger: RunTrigger,
        stale_after: Duration,
    ) -> impl Future<Output = Result<ReconciliationRun, RunError>> + Send;

    /// Persist one discrepancy immediately so it survives a later failure.
    fn record_discrepancy(
        &self,
        discrepancy: &Discrepancy,
    ) -> impl Future<Output = Result<(), RunError>> + Send;

    /// `Running -> Completed | CompletedWithDiscrepancies`.
    fn complete(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        status: RunStatus,
    ) -> impl Future<Output = Result<ReconciliationRun, RunError>> + Send;

    /// `Running -> Failed`, keeping whatever was recorded so far.
    fn fail(
        &self,
        id: RunId,
        counts: RunCounts,
        attempts: u32,
        error: &str,
    ) -> impl Future<Output = Result<ReconciliationRun, RunError>> + Send;

    fn get(
        &self,
        id: RunId,
    ) -> impl Future<Output = Result<Option<ReconciliationRun>, RunError>> + Send;

    /// Discrepancies of a run ordered by external reference.
    fn discrepancies(
        &self,
        id: RunId,
    ) -> impl Future<Output = Result<Vec<Discrepancy>, RunError>> + Send;

    /// Most recently started run.
    fn latest(&self) -> impl Future<Output = Result<Option<ReconciliationRun>, RunError>> + Send;
}

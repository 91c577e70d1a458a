//! Error classification shared by every layer.
//!
//! Each error enum in this crate (and in the adapters) maps onto one
//! `ErrorClass`. Retry and escalation decisions are made on the class, so a
//! new adapter only has to classify its failures correctly to get the right
//! recovery behaviour from the dispatcher and the reconciliation worker.

/// Recovery category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Database or network blip. Retry locally with backoff.
    TransientInfrastructure,
    /// Bug or rejection inside a specific outbox handler. Retry up to the
    /// cap, then quarantine that message only.
    HandlerLogic,
    /// Payment gateway rejected our credentials. Requires an operator; never
    /// retried blindly.
    GatewayAuth,
    /// Postings that do not balance. Rejected without partial commit.
    ImbalancedPosting,
    /// Another dispatcher or worker holds the claim or run lock. Back off and
    /// try later; not an alarm condition.
    LockContention,
    /// Configuration or data error that no retry can fix.
    Fatal,
}

impl ErrorClass {
    /// Whether retrying the same operation later can succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TransientInfrastructure | Self::HandlerLogic | Self::LockContention
        )
    }
}

/// Identifies the store operation that failed.
///
/// Used by the `StoreFailure` variants to provide strongly-typed
/// identification of which operation encountered an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Inserting a new outbox message.
    Enqueue,
    /// Claiming a batch of outbox messages.
    ClaimBatch,
    /// Settling the outcome of a claimed message.
    MarkOutcome,
    /// Reading outbox messages for operators.
    ReadOutbox,
    /// Requeueing or archiving outbox messages.
    MaintainOutbox,
    /// Appending ledger transactions.
    RecordTransaction,
    /// Reading ledger transactions.
    ReadLedger,
    /// Creating or finishing a reconciliation run.
    WriteRun,
    /// Reading reconciliation runs or discrepancies.
    ReadRun,
    /// Beginning a database transaction.
    BeginTransaction,
    /// Committing a database transaction.
    CommitTransaction,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueue => write!(f, "enqueue"),
            Self::ClaimBatch => write!(f, "claim_batch"),
            Self::MarkOutcome => write!(f, "mark_outcome"),
            Self::ReadOutbox => write!(f, "read_outbox"),
            Self::MaintainOutbox => write!(f, "maintain_outbox"),
            Self::RecordTransaction => write!(f, "record_transaction"),
            Self::ReadLedger => write!(f, "read_ledger"),
            Self::WriteRun => write!(f, "write_run"),
            Self::ReadRun => write!(f, "read_run"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
        }
    }
}

use crate::errors::{ErrorClass, Operation};
use crate::ids::{MessageId, MessageType, PartitionKey, WorkerId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Delivery state of an outbox message.
///
/// Transitions are monotonic: `Pending -> Processing -> {Delivered |
/// Pending (retry) | Failed (exhausted)}`. `Delivered` is final. `Failed`
/// only leaves through an explicit operator requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Waiting for its `next_attempt_at`.
    Pending,
    /// Leased to a dispatcher until `next_attempt_at`.
    Processing,
    /// Handler succeeded. Final.
    Delivered,
    /// Retries exhausted or handler reported a fatal error.
    Failed,
}

impl OutboxStatus {
    /// Stable lower-case name used for persistence.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Inverse of [`OutboxStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted outbox message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub message_type: MessageType,
    pub payload: Value,
    pub partition_key: Option<PartitionKey>,
    pub status: OutboxStatus,
    /// Number of failed delivery attempts so far.
    pub retry_count: u32,
    /// Earliest next attempt while `Pending`; lease expiry while
    /// `Processing`.
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Deserialize the payload into a typed event body.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Caller-side value passed to [`OutboxStore::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxMessage {
    pub message_type: MessageType,
    pub payload: Value,
    pub partition_key: Option<PartitionKey>,
    /// Delay delivery until this instant. `None` means immediately.
    pub available_at: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    pub const fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
            partition_key: None,
            available_at: None,
        }
    }

    /// Serialize `payload` as JSON.
    pub fn json<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self, OutboxError> {
        let payload =
            serde_json::to_value(payload).map_err(|error| OutboxError::SerializationFailed {
                message_type: message_type.clone(),
                detail: error.to_string(),
            })?;
        Ok(Self::new(message_type, payload))
    }

    /// Deliver this message only after every older message with the same key.
    pub fn with_partition_key(mut self, key: PartitionKey) -> Self {
        self.partition_key = Some(key);
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// Error type returned by outbox store operations.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum OutboxError {
    /// No message exists with the given id.
    #[error("outbox message {id} not found")]
    NotFound { id: MessageId },

    /// The message is no longer `Processing` under this worker's lease.
    ///
    /// The lease expired and another dispatcher reclaimed the message, or the
    /// outcome was already recorded.
    #[error("outbox message {id} is no longer claimed by {worker}")]
    ClaimLost { id: MessageId, worker: WorkerId },

    /// Requested operator transition is not allowed from the current status.
    #[error("outbox message {id} cannot be changed while {status}")]
    InvalidTransition { id: MessageId, status: OutboxStatus },

    /// Payload could not be serialized before enqueueing.
    #[error("failed to serialize {message_type} payload: {detail}")]
    SerializationFailed {
        message_type: MessageType,
        detail: String,
    },

    /// Stored row could not be mapped back into an outbox message.
    #[error("corrupt outbox row: {detail}")]
    CorruptRow { detail: String },

    /// The database refused the statement: a constraint, trigger or schema
    /// error. Retrying the same write cannot succeed.
    #[error("{operation} rejected by the database: {detail}")]
    Rejected { operation: Operation, detail: String },

    /// Infrastructure failure in the backing store.
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },
}

impl OutboxError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ClaimLost { .. } => ErrorClass::LockContention,
            Self::StoreFailure { .. } => ErrorClass::TransientInfrastructure,
            Self::NotFound { .. }
            | Self::InvalidTransition { .. }
            | Self::SerializationFailed { .. }
            | Self::CorruptRow { .. }
            | Self::Rejected { .. } => ErrorClass::Fatal,
        }
    }
}

/// Durable queue of pending domain events.
///
/// Implementations must make [`OutboxStore::claim_batch`] safe under
/// concurrent dispatchers: every row is claimed by at most one worker at a
/// time, enforced by an atomic compare-and-swap on `status`. The outcome
/// operations (`mark_*`) only succeed for the worker currently holding the
/// lease and return [`OutboxError::ClaimLost`] otherwise.
///
/// Implementations include:
/// - `payrecon-postgres`: `FOR UPDATE SKIP LOCKED` claims, transactional enqueue
/// - `payrecon-memory`: mutex-guarded map for tests
pub trait OutboxStore: Send + Sync {
    /// Append a message in the `Pending` state and return its id.
    fn enqueue(
        &self,
        message: NewOutboxMessage,
    ) -> impl Future<Output = Result<MessageId, OutboxError>> + Send;

    /// Lease up to `max` eligible messages to `worker` for `lease`.
    ///
    /// Eligible messages are `Pending` with `next_attempt_at <= now`, or
    /// `Processing` with an expired lease. Oldest ids come first. A message
    /// with a partition key is only eligible when no older message with the
    /// same key is `Pending` or `Processing`, and at most one message per key
    /// is returned.
    fn claim_batch(
        &self,
        max: usize,
        worker: &WorkerId,
        lease: Duration,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send;

    /// `Processing -> Delivered`.
    fn mark_delivered(
        &self,
        id: MessageId,
        worker: &WorkerId,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// `Processing -> Pending` with `retry_count + 1` and a new
    /// `next_attempt_at`.
    fn mark_failed(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// `Processing -> Failed` with `retry_count + 1`; surfaced to operators.
    fn mark_exhausted(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
    ) -> impl Future<Output = Result<(), OutboxError>> + Send;

    fn get(
        &self,
        id: MessageId,
    ) -> impl Future<Output = Result<Option<OutboxMessage>, OutboxError>> + Send;

    /// Failed messages, oldest first.
    fn list_failed(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxMessage>, OutboxError>> + Send;

    /// Operator action: `Failed -> Pending`, retry count reset, due now.
    /// `last_error` is kept for the audit trail.
    fn requeue(&self, id: MessageId) -> impl Future<Output = Result<(), OutboxError>> + Send;

    /// Move delivered messages processed before `older_than` out of the live
    /// queue. Archived messages are retained, never deleted. Returns how many
    /// were archived.
    fn archive_delivered(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, OutboxError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_type(name: &str) -> MessageType {
        MessageType::try_new(name).unwrap()
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Delivered,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("archived"), None);
    }

    #[test]
    fn json_constructor_serializes_payload() {
        #[derive(Serialize)]
        struct Created<'a> {
            external_ref: &'a str,
        }

        let message =
            NewOutboxMessage::json(message_type("PaymentCaptured"), &Created { external_ref: "TX1" })
                .unwrap();

        assert_eq!(message.payload, json!({ "external_ref": "TX1" }));
        assert_eq!(message.partition_key, None);
        assert_eq!(message.available_at, None);
    }

    #[test]
    fn claim_lost_is_lock_contention_and_store_failure_is_transient() {
        let id = MessageId::try_new(1).unwrap();
        let worker = WorkerId::try_new("w1").unwrap();

        assert_eq!(
            OutboxError::ClaimLost { id, worker }.class(),
            ErrorClass::LockContention
        );
        assert_eq!(
            OutboxError::StoreFailure {
                operation: Operation::ClaimBatch
            }
            .class(),
            ErrorClass::TransientInfrastructure
        );
        assert_eq!(OutboxError::NotFound { id }.class(), ErrorClass::Fatal);
    }
}

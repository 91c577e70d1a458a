use chrono::{DateTime, Utc};
use payrecon_types::{
    time, MessageId, NewOutboxMessage, Operation, OutboxError, OutboxMessage, OutboxStatus,
    OutboxStore, PartitionKey, WorkerId,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct OutboxState {
    last_id: i64,
    live: BTreeMap<MessageId, OutboxMessage>,
    archived: Vec<OutboxMessage>,
}

/// Thread-safe in-memory outbox.
///
/// Claims and outcome updates run under one mutex, which gives the same
/// compare-and-swap guarantees the PostgreSQL store gets from row locks.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<OutboxState>>,
}

impl InMemoryOutboxStore {
    /// Create a new empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in the live queue, in any status.
    pub fn live_len(&self) -> usize {
        self.state.lock().map_or(0, |state| state.live.len())
    }

    fn lock(&self, operation: Operation) -> Result<MutexGuard<'_, OutboxState>, OutboxError> {
        self.state
            .lock()
            .map_err(|_| OutboxError::StoreFailure { operation })
    }
}

fn holding<'a>(
    state: &'a mut OutboxState,
    id: MessageId,
    worker: &WorkerId,
) -> Result<&'a mut OutboxMessage, OutboxError> {
    let message = state
        .live
        .get_mut(&id)
        .ok_or(OutboxError::NotFound { id })?;
    if message.status == OutboxStatus::Processing && message.claimed_by.as_ref() == Some(worker) {
        Ok(message)
    } else {
        Err(OutboxError::ClaimLost {
            id,
            worker: worker.clone(),
        })
    }
}

impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<MessageId, OutboxError> {
        let mut state = self.lock(Operation::Enqueue)?;
        let id = MessageId::try_new(state.last_id + 1).map_err(|_| OutboxError::StoreFailure {
            operation: Operation::Enqueue,
        })?;
        state.last_id += 1;

        let now = Utc::now();
        let stored = OutboxMessage {
            id,
            message_type: message.message_type,
            payload: message.payload,
            partition_key: message.partition_key,
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: message.available_at.unwrap_or(now),
            claimed_by: None,
            created_at: now,
            processed_at: None,
            last_error: None,
        };
        let _ = state.live.insert(id, stored);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        max: usize,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let mut state = self.lock(Operation::ClaimBatch)?;
        let now = Utc::now();
        let lease_until = time::add_duration(now, lease);

        // Keys with an older message still in flight or waiting.
        let mut blocked: HashSet<PartitionKey> = HashSet::new();
        let mut claimed = Vec::new();

        for message in state.live.values_mut() {
            if claimed.len() >= max {
                break;
            }
            if !matches!(
                message.status,
                OutboxStatus::Pending | OutboxStatus::Processing
            ) {
                continue;
            }

            let due = message.next_attempt_at <= now;
            let first_of_key = message
                .partition_key
                .as_ref()
                .map_or(true, |key| blocked.insert(key.clone()));

            if due && first_of_key {
                message.status = OutboxStatus::Processing;
                message.claimed_by = Some(worker.clone());
                message.next_attempt_at = lease_until;
                claimed.push(message.clone());
            }
        }

        if !claimed.is_empty() {
            debug!(worker = %worker, claimed = claimed.len(), "[outbox.claim] claimed batch");
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: MessageId, worker: &WorkerId) -> Result<(), OutboxError> {
        let mut state = self.lock(Operation::MarkOutcome)?;
        let message = holding(&mut state, id, worker)?;
        message.status = OutboxStatus::Delivered;
        message.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let mut state = self.lock(Operation::MarkOutcome)?;
        let message = holding(&mut state, id, worker)?;
        message.status = OutboxStatus::Pending;
        message.retry_count = message.retry_count.saturating_add(1);
        message.next_attempt_at = next_attempt_at;
        message.claimed_by = None;
        message.last_error = Some(error.to_owned());
        Ok(())
    }

    async fn mark_exhausted(
        &self,
        id: MessageId,
        worker: &WorkerId,
        error: &str,
    ) -> Result<(), OutboxError> {
        let mut state = self.lock(Operation::MarkOutcome)?;
        let message = holding(&mut state, id, worker)?;
        message.status = OutboxStatus::Failed;
        message.retry_count = message.retry_count.saturating_add(1);
        message.claimed_by = None;
        message.last_error = Some(error.to_owned());
        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let state = self.lock(Operation::ReadOutbox)?;
        Ok(state
            .live
            .get(&id)
            .or_else(|| state.archived.iter().find(|message| message.id == id))
            .cloned())
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let state = self.lock(Operation::ReadOutbox)?;
        Ok(state
            .live
            .values()
            .filter(|message| message.status == OutboxStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(&self, id: MessageId) -> Result<(), OutboxError> {
        let mut state = self.lock(Operation::MaintainOutbox)?;
        let message = state
            .live
            .get_mut(&id)
            .ok_or(OutboxError::NotFound { id })?;
        if message.status != OutboxStatus::Failed {
            return Err(OutboxError::InvalidTransition {
                id,
                status: message.status,
            });
        }
        message.status = OutboxStatus::Pending;
        message.retry_count = 0;
        message.next_attempt_at = Utc::now();
        message.claimed_by = None;
        Ok(())
    }

    async fn archive_delivered(&self, older_than: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut state = self.lock(Operation::MaintainOutbox)?;
        let expired: Vec<MessageId> = state
            .live
            .values()
            .filter(|message| {
                message.status == OutboxStatus::Delivered
                    && message.processed_at.is_some_and(|at| at < older_than)
            })
            .map(|message| message.id)
            .collect();

        for id in &expired {
            if let Some(message) = state.live.remove(id) {
                state.archived.push(message);
            }
        }
        Ok(expired.len() as u64)
    }
}

//! Scripted outbox handlers for dispatcher tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use payrecon_types::{HandlerError, MessageId, OutboxHandler, OutboxMessage};

/// Records every delivery it sees and always succeeds.
///
/// Clones share the same record, so a test can keep one clone and register
/// another.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    deliveries: Arc<Mutex<Vec<MessageId>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message ids in the order they were handled, duplicates included.
    pub fn deliveries(&self) -> Vec<MessageId> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_for(&self, id: MessageId) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|delivered| **delivered == id)
            .count()
    }

    fn record(&self, id: MessageId) {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }
}

#[async_trait]
impl OutboxHandler for RecordingHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        self.record(message.id);
        Ok(())
    }
}

/// Fails each message with a retryable error a fixed number of times, then
/// succeeds.
#[derive(Debug, Clone)]
pub struct FailNTimesHandler {
    failures: u32,
    attempts: Arc<Mutex<HashMap<MessageId, u32>>>,
    delivered: RecordingHandler,
}

impl FailNTimesHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::default(),
            delivered: RecordingHandler::new(),
        }
    }

    pub fn attempts_for(&self, id: MessageId) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Successful deliveries only.
    pub const fn delivered(&self) -> &RecordingHandler {
        &self.delivered
    }
}

#[async_trait]
impl OutboxHandler for FailNTimesHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let attempt = attempts.entry(message.id).or_insert(0);
            *attempt += 1;
            *attempt
        };

        if attempt <= self.failures {
            return Err(HandlerError::retryable(format!(
                "scripted failure {attempt} of {}",
                self.failures
            )));
        }
        self.delivered.record(message.id);
        Ok(())
    }
}

/// Always fails with the same error.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    error: HandlerError,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn new(error: HandlerError) -> Self {
        Self {
            error,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for FailingHandler {
    async fn handle(&self, _message: &OutboxMessage) -> Result<(), HandlerError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Panics on every invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanickingHandler;

#[async_trait]
impl OutboxHandler for PanickingHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        panic!("scripted panic while handling message {}", message.id)
    }
}

/// Sleeps before succeeding, for timeout and lease-expiry scenarios.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    delay: Duration,
    delivered: RecordingHandler,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            delivered: RecordingHandler::new(),
        }
    }

    /// Invocations that ran to completion.
    pub const fn delivered(&self) -> &RecordingHandler {
        &self.delivered
    }
}

#[async_trait]
impl OutboxHandler for SlowHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        tokio::time::sleep(self.delay).await;
        self.delivered.record(message.id);
        Ok(())
    }
}

//! Outbox dispatcher.
//!
//! Drains claimed batches from an [`OutboxStore`] and delivers each message
//! to the handler registered for its type. Delivery is at-least-once:
//!
//! - a message is settled (`Delivered`, retried, or exhausted) only after its
//!   handler returned, timed out, or panicked;
//! - a dispatcher that dies mid-batch leaves its messages `Processing` until
//!   the lease expires, after which any dispatcher reclaims them;
//! - settling is a compare-and-swap on the lease holder, so a slow dispatcher
//!   whose lease expired cannot overwrite the outcome recorded by the new
//!   holder.

use crate::config::DispatcherConfig;
use crate::registry::HandlerRegistry;
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use payrecon_types::{
    time, HandlerError, OutboxError, OutboxMessage, OutboxStore, WorkerId,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub claimed: usize,
    pub delivered: usize,
    /// Failed attempts scheduled for another try.
    pub retried: usize,
    /// Messages quarantined as `Failed`.
    pub exhausted: usize,
    /// Outcomes rejected because the lease had moved to another worker.
    pub claims_lost: usize,
    /// Outcomes that could not be written; the lease will expire and the
    /// message is delivered again.
    pub store_errors: usize,
}

impl DispatchStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Exhausted => self.exhausted += 1,
            Outcome::ClaimLost => self.claims_lost += 1,
            Outcome::StoreError => self.store_errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    Exhausted,
    ClaimLost,
    StoreError,
}

/// Polls an outbox store and delivers messages to registered handlers.
///
/// Several dispatchers may run against the same store; each must have its own
/// [`WorkerId`].
pub struct OutboxDispatcher<S> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    worker_id: WorkerId,
}

impl<S> OutboxDispatcher<S>
where
    S: OutboxStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            worker_id,
        }
    }

    pub const fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim one batch and settle every message in it.
    ///
    /// Only the claim itself can fail; per-message store failures are counted
    /// in [`DispatchStats::store_errors`] and left to lease expiry.
    #[instrument(name = "outbox.dispatch", skip(self), fields(worker = %self.worker_id))]
    pub async fn dispatch_once(&self) -> Result<DispatchStats, OutboxError> {
        let batch = self
            .store
            .claim_batch(
                self.config.batch_size.into(),
                &self.worker_id,
                self.config.lease,
            )
            .await?;

        let mut stats = DispatchStats {
            claimed: batch.len(),
            ..DispatchStats::default()
        };
        if batch.is_empty() {
            return Ok(stats);
        }
        debug!(claimed = batch.len(), "[outbox.claim] claimed batch");

        let mut waiting = batch.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for message in waiting.by_ref().take(self.config.concurrency.into()) {
            in_flight.push(self.process(message));
        }
        while let Some(outcome) = in_flight.next().await {
            stats.record(outcome);
            if let Some(message) = waiting.next() {
                in_flight.push(self.process(message));
            }
        }

        info!(
            claimed = stats.claimed,
            delivered = stats.delivered,
            retried = stats.retried,
            exhausted = stats.exhausted,
            claims_lost = stats.claims_lost,
            store_errors = stats.store_errors,
            "[outbox.dispatch] batch settled"
        );
        Ok(stats)
    }

    /// Dispatch until `shutdown` is cancelled.
    ///
    /// After an empty claim the loop sleeps for `poll_interval`, doubling up
    /// to `max_idle_backoff` while the outbox stays empty. Cancellation is
    /// observed between batches: the in-flight batch is always settled first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.worker_id, "[outbox.dispatcher] started");
        let mut idle = self.config.poll_interval;

        while !shutdown.is_cancelled() {
            let pause = match self.dispatch_once().await {
                Ok(stats) if stats.claimed > 0 => {
                    idle = self.config.poll_interval;
                    continue;
                }
                Ok(_) => {
                    let pause = idle;
                    idle = next_idle(idle, self.config.max_idle_backoff);
                    pause
                }
                Err(error) => {
                    error!(
                        error = %error,
                        class = ?error.class(),
                        "[outbox.dispatcher] claim failed"
                    );
                    idle = next_idle(idle, self.config.max_idle_backoff);
                    idle
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        info!(worker = %self.worker_id, "[outbox.dispatcher] stopped");
    }

    #[instrument(
        name = "outbox.process",
        skip(self, message),
        fields(
            message_id = %message.id,
            message_type = %message.message_type,
            retry_count = message.retry_count
        )
    )]
    async fn process(&self, message: OutboxMessage) -> Outcome {
        let result = self.invoke(&message).await;

        match result {
            Ok(()) => self.settle_delivered(&message).await,
            Err(handler_error) => self.settle_failure(&message, &handler_error).await,
        }
    }

    async fn invoke(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        let Some(handler) = self.registry.get(&message.message_type) else {
            return Err(HandlerError::retryable(format!(
                "no handler registered for message type {}",
                message.message_type
            )));
        };

        let guarded = AssertUnwindSafe(handler.handle(message)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(HandlerError::retryable(format!(
                "handler timed out after {:?}",
                self.config.handler_timeout
            ))),
        }
    }

    async fn settle_delivered(&self, message: &OutboxMessage) -> Outcome {
        match self.store.mark_delivered(message.id, &self.worker_id).await {
            Ok(()) => {
                debug!("[outbox.deliver] delivered");
                Outcome::Delivered
            }
            Err(store_error) => self.settle_error(&store_error),
        }
    }

    async fn settle_failure(&self, message: &OutboxMessage, failure: &HandlerError) -> Outcome {
        let failures = message.retry_count.saturating_add(1);
        let detail = failure.to_string();

        if !failure.is_retryable() || self.config.retry.is_exhausted(failures) {
            error!(
                error = %detail,
                failures,
                "[outbox.exhausted] message quarantined"
            );
            return match self
                .store
                .mark_exhausted(message.id, &self.worker_id, &detail)
                .await
            {
                Ok(()) => Outcome::Exhausted,
                Err(store_error) => self.settle_error(&store_error),
            };
        }

        let delay = self.config.retry.delay_for(message.retry_count);
        let next_attempt_at = time::add_duration(Utc::now(), delay);
        warn!(
            error = %detail,
            failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "[outbox.retry] delivery failed, retry scheduled"
        );
        match self
            .store
            .mark_failed(message.id, &self.worker_id, &detail, next_attempt_at)
            .await
        {
            Ok(()) => Outcome::Retried,
            Err(store_error) => self.settle_error(&store_error),
        }
    }

    fn settle_error(&self, store_error: &OutboxError) -> Outcome {
        if matches!(store_error, OutboxError::ClaimLost { .. }) {
            warn!(
                worker = %self.worker_id,
                "[outbox.claim_lost] lease moved to another dispatcher; outcome discarded"
            );
            Outcome::ClaimLost
        } else {
            error!(
                error = %store_error,
                class = ?store_error.class(),
                "[outbox.settle] could not record outcome; message will be redelivered after lease expiry"
            );
            Outcome::StoreError
        }
    }
}

fn next_idle(current: Duration, ceiling: Duration) -> Duration {
    current.saturating_mul(2).min(ceiling)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

use std::time::Duration;

use async_trait::async_trait;
use payrecon::messages::WebhookDelivery;
use payrecon::{HandlerError, OutboxHandler, OutboxMessage};
use reqwest::StatusCode;
use tracing::debug;

/// Header carrying the outbox message id, so receivers can drop redeliveries.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const EVENT_HEADER: &str = "X-PayRecon-Event";

/// Delivers `WebhookDelivery` messages as JSON `POST` requests.
///
/// Transport failures, timeouts, 5xx and 429 responses are retryable. Any
/// other non-2xx response means the receiver rejected the event, so the
/// message is quarantined.
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// Outcome of a delivery that reached the receiver.
pub fn classify_status(status: StatusCode) -> Result<(), HandlerError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(HandlerError::retryable(format!("receiver answered {status}")))
    } else {
        Err(HandlerError::fatal(format!("receiver rejected the event: {status}")))
    }
}

#[async_trait]
impl OutboxHandler for WebhookHandler {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError> {
        let delivery: WebhookDelivery = message
            .payload_as()
            .map_err(|error| HandlerError::fatal(format!("malformed payload: {error}")))?;

        let response = self
            .client
            .post(&delivery.url)
            .header(IDEMPOTENCY_KEY_HEADER, message.id.to_string())
            .header(EVENT_HEADER, &delivery.event)
            .json(&delivery.body)
            .send()
            .await
            .map_err(|error| {
                if error.is_builder() {
                    HandlerError::fatal(format!("invalid webhook request: {error}"))
                } else {
                    HandlerError::retryable(format!("webhook transport failure: {error}"))
                }
            })?;

        let status = response.status();
        debug!(
            message_id = %message.id,
            event = %delivery.event,
            status = %status,
            "[webhook.deliver] receiver answered"
        );
        classify_status(status)
    }
}

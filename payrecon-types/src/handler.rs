use crate::errors::ErrorClass;
use crate::outbox::OutboxMessage;
use async_trait::async_trait;

/// Outcome of a failed handler invocation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Try again later with backoff, up to the retry cap.
    #[error("retryable handler failure: {detail}")]
    Retryable { detail: String },

    /// Retrying cannot help; the message is quarantined immediately.
    #[error("fatal handler failure: {detail}")]
    Fatal { detail: String },
}

impl HandlerError {
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::Retryable {
            detail: detail.into(),
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal {
            detail: detail.into(),
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Retryable { .. } => ErrorClass::HandlerLogic,
            Self::Fatal { .. } => ErrorClass::Fatal,
        }
    }
}

/// Side effect triggered by an outbox message of one type.
///
/// Delivery is at-least-once: the same message can be handed to a handler
/// more than once (lease expiry, crash after the side effect but before the
/// outcome was recorded), so implementations must be idempotent.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(&self, message: &OutboxMessage) -> Result<(), HandlerError>;
}

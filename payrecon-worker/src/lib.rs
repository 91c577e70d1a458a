//! Background-worker host for PayRecon.
//!
//! Reads [`Settings`] from the environment, connects the PostgreSQL stores
//! and runs the outbox dispatcher next to the scheduled reconciliation
//! worker until shutdown.

#![forbid(unsafe_code)]

pub mod app;
mod settings;
mod webhook;

pub use settings::{load_dotenv, Environment, LogFormat, Secret, Settings};
pub use webhook::{classify_status, WebhookHandler, EVENT_HEADER, IDEMPOTENCY_KEY_HEADER};

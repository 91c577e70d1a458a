#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # PayRecon
//!
//! A transactional outbox and payment-reconciliation core for a marketplace
//! that settles card payments through an external processor.
//!
//! ## Overview
//!
//! Two cooperating subsystems:
//!
//! - **Outbox**: domain events are written to an [`OutboxStore`] in the same
//!   database transaction as the business change. An [`OutboxDispatcher`]
//!   leases batches of due messages, hands each to the [`OutboxHandler`]
//!   registered for its type, and records the outcome. Failures are retried
//!   with exponential backoff and jitter; exhausted messages are quarantined
//!   as `Failed` for operators.
//! - **Reconciliation**: a [`ReconciliationWorker`] periodically fetches the
//!   processor's settlement report through a [`SettlementReportFetcher`] and
//!   lets the [`ReconciliationEngine`] diff it against the double-entry
//!   ledger. Discrepancies are persisted; small amount differences are
//!   auto-corrected by reversal plus corrected copy; everything else is
//!   routed to review through the outbox.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use payrecon::{
//!     DispatcherConfig, HandlerRegistry, OutboxDispatcher, WorkerId,
//!     messages::reconciliation_alert_type, handlers::AlertLogHandler,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let registry = HandlerRegistry::new()
//!     .with_handler(reconciliation_alert_type()?, AlertLogHandler);
//! let dispatcher = OutboxDispatcher::new(
//!     Arc::new(store),
//!     registry,
//!     DispatcherConfig::default(),
//!     WorkerId::unique("dispatcher")?,
//! );
//! dispatcher.run(CancellationToken::new()).await;
//! ```
//!
//! ## Storage backends
//!
//! - `payrecon-postgres`: production stores on `PostgreSQL`
//! - `payrecon-memory`: in-memory stores for tests and development

mod config;
mod dispatcher;
pub mod handlers;
pub mod messages;
mod reconcile;
mod registry;
mod retry;
mod worker;

pub use config::{
    BatchSize, BatchSizeError, Concurrency, ConcurrencyError, ConfigError, DispatcherConfig,
    MaxRetries, MaxRetriesError, ReconciliationPolicy, WorkerConfig,
};
pub use dispatcher::{DispatchStats, OutboxDispatcher};
pub use payrecon_types::*;
pub use reconcile::{
    diff, Action, DiffEntry, DiffReport, ReconcileError, ReconciliationEngine,
    ReconciliationOutcome,
};
pub use registry::HandlerRegistry;
pub use retry::RetryPolicy;
pub use worker::{ReconciliationWorker, RunReport, TriggerError, WorkerError, WorkerHandle};

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared vocabulary types and traits for the PayRecon outbox and
//! reconciliation core.
//!
//! This crate provides the foundational types that are shared between the
//! `payrecon` core crate and the storage / gateway adapters such as
//! `payrecon-memory`, `payrecon-postgres` and `payrecon-paytr`. Keeping them
//! in a separate crate lets adapters depend on the contracts without pulling
//! in the dispatcher and reconciliation machinery.
//!
//! # Overview
//!
//! This crate contains:
//! - Port traits: `OutboxStore`, `LedgerStore`, `RunStore`, `OutboxHandler`,
//!   `SettlementReportFetcher`
//! - Domain types: `OutboxMessage`, `LedgerTransaction`, `ReconciliationRun`,
//!   `Discrepancy`, `GatewayTransactionRecord`, `Money`
//! - Validated identifiers: `MessageId`, `WorkerId`, `ExternalRef`, ...
//! - Errors: `OutboxError`, `LedgerError`, `RunError`, `GatewayError`,
//!   `HandlerError`, all classified by `ErrorClass`

mod errors;
mod gateway;
mod handler;
mod ids;
mod ledger;
mod money;
mod outbox;
mod reconciliation;
pub mod time;

pub use errors::{ErrorClass, Operation};
pub use gateway::{
    GatewayError, GatewayRecordKind, GatewayTransactionRecord, SettlementReportFetcher,
};
pub use handler::{HandlerError, OutboxHandler};
pub use ids::{
    AccountCode, AccountCodeError, DiscrepancyId, ExternalRef, ExternalRefError, MessageId,
    MessageIdError, MessageType, MessageTypeError, PartitionKey, PartitionKeyError, RunId,
    TransactionId, WorkerId, WorkerIdError,
};
pub use ledger::{
    check_balance, EntryKind, Imbalance, LedgerError, LedgerPosting, LedgerStore, LedgerTransaction,
    NewLedgerTransaction, SettlementStatus,
};
pub use money::{Currency, CurrencyError, Money};
pub use outbox::{NewOutboxMessage, OutboxError, OutboxMessage, OutboxStatus, OutboxStore};
pub use reconciliation::{
    DateRange, DateRangeError, Discrepancy, DiscrepancyKind, Resolution, ReconciliationRun,
    RunCounts, RunError, RunStatus, RunStore, RunTrigger,
};

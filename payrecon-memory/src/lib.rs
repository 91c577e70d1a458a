//! In-memory stores for PayRecon
//!
//! This crate provides in-memory implementations of the `OutboxStore`,
//! `LedgerStore` and `RunStore` traits from `payrecon-types`, useful for
//! testing and single-process development setups where persistence is not
//! required. Each store is a cheap handle around shared state: clones see the
//! same data.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod ledger;
mod outbox;
mod runs;

pub use ledger::InMemoryLedgerStore;
pub use outbox::InMemoryOutboxStore;
pub use runs::InMemoryRunStore;

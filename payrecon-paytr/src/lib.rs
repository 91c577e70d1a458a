//! PayTR settlement report fetcher for PayRecon.
//!
//! [`PaytrReportFetcher`] implements
//! [`SettlementReportFetcher`](payrecon_types::SettlementReportFetcher) on
//! top of the `islem-dokumu` report API. Requests are signed with the
//! merchant key and salt (see [`report_token`]); responses are parsed
//! tolerantly into [`GatewayTransactionRecord`](payrecon_types::GatewayTransactionRecord)s
//! with local report times converted to UTC.

#![forbid(unsafe_code)]

mod client;
mod config;
pub mod report;
mod token;

pub use client::{assemble, PaytrReportFetcher, REPORT_PATH};
pub use config::{PaytrConfig, PaytrSetupError};
pub use token::report_token;

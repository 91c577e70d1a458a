use crate::errors::ErrorClass;
use crate::ids::ExternalRef;
use crate::ledger::SettlementStatus;
use crate::money::Currency;
use crate::reconciliation::DateRange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GatewayRecordKind {
    Sale,
    Refund,
}

/// One line of a processor settlement report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayTransactionRecord {
    pub external_ref: ExternalRef,
    pub kind: GatewayRecordKind,
    /// Always positive; the sign comes from `kind`.
    pub amount: Decimal,
    pub currency: Currency,
    pub status: SettlementStatus,
    pub settled_at: DateTime<Utc>,
}

impl GatewayTransactionRecord {
    /// Sales count positive, refunds negative.
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            GatewayRecordKind::Sale => self.amount.abs(),
            GatewayRecordKind::Refund => -self.amount.abs(),
        }
    }

    /// Deterministic report order: reference, then time, then kind and amount.
    pub fn sort_key(&self) -> (&ExternalRef, DateTime<Utc>, GatewayRecordKind, Decimal) {
        (&self.external_ref, self.settled_at, self.kind, self.amount)
    }
}

/// Error type returned by settlement report fetchers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout, throttling or a server-side error.
    #[error("payment gateway unavailable: {detail}")]
    Unavailable { detail: String },

    /// Credentials or merchant configuration were rejected.
    #[error("payment gateway rejected credentials: {detail}")]
    Auth { detail: String },

    /// The processor understood the request and refused it.
    #[error("payment gateway rejected the report request: {detail}")]
    Rejected { detail: String },

    /// The response could not be interpreted.
    #[error("malformed payment gateway response: {detail}")]
    Malformed { detail: String },
}

impl GatewayError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { .. } => ErrorClass::TransientInfrastructure,
            Self::Auth { .. } => ErrorClass::GatewayAuth,
            Self::Rejected { .. } | Self::Malformed { .. } => ErrorClass::Fatal,
        }
    }
}

/// Retrieves settlement reports from an external payment processor.
///
/// Implementations reassemble paginated or windowed responses into one list
/// sorted by [`GatewayTransactionRecord::sort_key`].
pub trait SettlementReportFetcher: Send + Sync {
    fn fetch_settlement_report(
        &self,
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<GatewayTransactionRecord>, GatewayError>> + Send;
}

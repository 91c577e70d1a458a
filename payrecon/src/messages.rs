//! Outbox message types emitted by the reconciliation engine.

use chrono::{DateTime, Utc};
use payrecon_types::{
    Currency, DiscrepancyId, DiscrepancyKind, ExternalRef, MessageType, MessageTypeError, RunId,
    SettlementStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Type tag of [`CreateMissingLedgerEntry`] messages.
pub const CREATE_MISSING_LEDGER_ENTRY: &str = "CreateMissingLedgerEntry";
/// Type tag of [`ReconciliationAlert`] messages.
pub const RECONCILIATION_ALERT: &str = "ReconciliationAlert";
/// Type tag of outbound webhook deliveries.
pub const WEBHOOK_DELIVERY: &str = "WebhookDelivery";

pub fn create_missing_ledger_entry_type() -> Result<MessageType, MessageTypeError> {
    MessageType::try_new(CREATE_MISSING_LEDGER_ENTRY)
}

pub fn reconciliation_alert_type() -> Result<MessageType, MessageTypeError> {
    MessageType::try_new(RECONCILIATION_ALERT)
}

pub fn webhook_delivery_type() -> Result<MessageType, MessageTypeError> {
    MessageType::try_new(WEBHOOK_DELIVERY)
}

/// The processor settled a payment the ledger never recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMissingLedgerEntry {
    pub run_id: RunId,
    pub discrepancy_id: DiscrepancyId,
    pub external_ref: ExternalRef,
    /// Net reported amount (sales minus refunds).
    pub amount: Decimal,
    pub currency: Currency,
    pub status: SettlementStatus,
    pub settled_at: DateTime<Utc>,
}

/// A discrepancy that needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub run_id: RunId,
    pub discrepancy_id: DiscrepancyId,
    pub external_ref: ExternalRef,
    pub kind: DiscrepancyKind,
    pub currency: Currency,
    pub expected_amount: Option<Decimal>,
    pub reported_amount: Option<Decimal>,
    pub note: Option<String>,
}

/// Body of a `WebhookDelivery` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub url: String,
    pub event: String,
    pub body: serde_json::Value,
}

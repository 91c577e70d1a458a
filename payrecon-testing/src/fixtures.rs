//! Builders for ledger entries and processor report lines.
//!
//! Fixtures panic on invalid literals; they are meant for tests only.

use chrono::{DateTime, TimeZone, Utc};
use payrecon_types::{
    AccountCode, Currency, EntryKind, ExternalRef, GatewayRecordKind, GatewayTransactionRecord,
    LedgerPosting, MessageType, NewLedgerTransaction, NewOutboxMessage, PartitionKey,
    SettlementStatus,
};
use rust_decimal::Decimal;

pub const CLEARING: &str = "paytr:clearing";
pub const REVENUE: &str = "platform:revenue";
pub const ADJUSTMENTS: &str = "paytr:adjustments";
pub const SUSPENSE: &str = "paytr:suspense";

pub fn account(code: &str) -> AccountCode {
    AccountCode::try_new(code).expect("valid account code")
}

pub fn external_ref(value: &str) -> ExternalRef {
    ExternalRef::try_new(value).expect("valid external reference")
}

pub fn lira() -> Currency {
    Currency::try_new("TRY").expect("valid currency")
}

pub fn message_type(value: &str) -> MessageType {
    MessageType::try_new(value).expect("valid message type")
}

pub fn partition_key(value: &str) -> PartitionKey {
    PartitionKey::try_new(value).expect("valid partition key")
}

/// Midnight UTC of the given day plus `hour` hours.
pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// A settled sale: clearing debited, revenue credited.
pub fn ledger_capture(
    reference: &str,
    amount: Decimal,
    occurred_at: DateTime<Utc>,
) -> NewLedgerTransaction {
    NewLedgerTransaction::new(
        external_ref(reference),
        EntryKind::Capture,
        SettlementStatus::Settled,
        occurred_at,
    )
    .with_posting(LedgerPosting::debit(account(CLEARING), amount, lira()))
    .with_posting(LedgerPosting::credit(account(REVENUE), amount, lira()))
}

/// A refund: clearing credited, revenue debited.
pub fn ledger_refund(
    reference: &str,
    amount: Decimal,
    occurred_at: DateTime<Utc>,
) -> NewLedgerTransaction {
    NewLedgerTransaction::new(
        external_ref(reference),
        EntryKind::Refund,
        SettlementStatus::Refunded,
        occurred_at,
    )
    .with_posting(LedgerPosting::credit(account(CLEARING), amount, lira()))
    .with_posting(LedgerPosting::debit(account(REVENUE), amount, lira()))
}

pub fn gateway_sale(
    reference: &str,
    amount: Decimal,
    settled_at: DateTime<Utc>,
) -> GatewayTransactionRecord {
    GatewayTransactionRecord {
        external_ref: external_ref(reference),
        kind: GatewayRecordKind::Sale,
        amount,
        currency: lira(),
        status: SettlementStatus::Settled,
        settled_at,
    }
}

pub fn gateway_refund(
    reference: &str,
    amount: Decimal,
    settled_at: DateTime<Utc>,
) -> GatewayTransactionRecord {
    GatewayTransactionRecord {
        external_ref: external_ref(reference),
        kind: GatewayRecordKind::Refund,
        amount,
        currency: lira(),
        status: SettlementStatus::Refunded,
        settled_at,
    }
}

/// An outbox message of the given type carrying a small JSON body.
pub fn outbox_message(message_type_name: &str, body: serde_json::Value) -> NewOutboxMessage {
    NewOutboxMessage::new(message_type(message_type_name), body)
}

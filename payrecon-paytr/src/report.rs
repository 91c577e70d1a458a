//! Parsing of `islem-dokumu` (transaction statement) responses.
//!
//! The report API is loosely typed: amounts arrive as strings or numbers,
//! with either decimal separator, and times are local wall-clock strings.
//! Parsing accepts all of these and rejects a record only when a required
//! field is missing, unreadable or an amount whose separators are ambiguous.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use payrecon_types::{
    Currency, ExternalRef, GatewayError, GatewayRecordKind, GatewayTransactionRecord,
    SettlementStatus,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;

/// Wall-clock format of the `start_date`, `end_date` and `islem_tarihi` fields.
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const REFERENCE_FIELDS: &[&str] = &["merchant_oid", "siparis_no"];
const KIND_FIELDS: &[&str] = &["islem_tipi", "type"];
const AMOUNT_FIELDS: &[&str] = &["islem_tutari", "amount"];
const CURRENCY_FIELDS: &[&str] = &["para_birimi", "currency"];
const TIME_FIELDS: &[&str] = &["islem_tarihi", "date"];
const STATUS_FIELDS: &[&str] = &["islem_durumu", "status"];

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    err_msg: Option<String>,
}

/// Parse one report response body into gateway records.
///
/// A `failed` response that only says no transactions were found yields an
/// empty list.
pub fn parse_report(
    body: &str,
    offset: FixedOffset,
) -> Result<Vec<GatewayTransactionRecord>, GatewayError> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|error| malformed(format!(
        "response is not a report envelope: {error}"
    )))?;

    match envelope.status.trim() {
        "success" => {}
        "failed" | "error" => {
            let message = envelope.err_msg.unwrap_or_default();
            return match classify_failure(&message) {
                Failure::NoRecords => Ok(Vec::new()),
                Failure::Auth => Err(GatewayError::Auth { detail: message }),
                Failure::Other => Err(GatewayError::Rejected { detail: message }),
            };
        }
        other => return Err(malformed(format!("unexpected response status {other:?}"))),
    }

    let items = match envelope.data {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => map.into_iter().map(|(_, item)| item).collect(),
        Some(other) => return Err(malformed(format!("report data is not a list: {other}"))),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(fields) => parse_record(fields, offset)
                .map_err(|detail| malformed(format!("record {index}: {detail}"))),
            _ => Err(malformed(format!("record {index} is not an object"))),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    NoRecords,
    Auth,
    Other,
}

fn classify_failure(message: &str) -> Failure {
    let message = message.to_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

    // "Mağaza bulunamadı" is a credential failure, not an empty day.
    if mentions(&["token", "merchant", "mağaza", "magaza", "yetki", "unauthorized"]) {
        Failure::Auth
    } else if mentions(&["bulunamad", "no record", "kayıt yok", "kayit yok"]) {
        Failure::NoRecords
    } else {
        Failure::Other
    }
}

fn malformed(detail: String) -> GatewayError {
    GatewayError::Malformed { detail }
}

/// First non-blank value among `names`, numbers rendered as text.
fn field(record: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match record.get(*name)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn required(record: &Map<String, Value>, names: &[&str]) -> Result<String, String> {
    field(record, names).ok_or_else(|| format!("missing {}", names[0]))
}

fn parse_record(
    record: &Map<String, Value>,
    offset: FixedOffset,
) -> Result<GatewayTransactionRecord, String> {
    let reference = required(record, REFERENCE_FIELDS)?;
    let kind = parse_kind(&required(record, KIND_FIELDS)?)?;
    let amount = parse_amount(&required(record, AMOUNT_FIELDS)?)?;
    let currency = parse_currency(field(record, CURRENCY_FIELDS).as_deref())?;
    let settled_at = parse_local_time(&required(record, TIME_FIELDS)?, offset)?;

    let failed = field(record, STATUS_FIELDS).is_some_and(|status| is_failed(&status));
    let status = match (failed, kind) {
        (true, _) => SettlementStatus::Failed,
        (false, GatewayRecordKind::Sale) => SettlementStatus::Settled,
        (false, GatewayRecordKind::Refund) => SettlementStatus::Refunded,
    };

    Ok(GatewayTransactionRecord {
        external_ref: ExternalRef::try_new(reference).map_err(|error| error.to_string())?,
        kind,
        amount,
        currency,
        status,
        settled_at,
    })
}

fn parse_kind(value: &str) -> Result<GatewayRecordKind, String> {
    // Lowercasing a dotted capital I leaves a combining dot behind.
    let normalized = value.trim().to_lowercase().replace('\u{307}', "");
    match normalized.as_str() {
        "s" | "satis" | "satış" | "sale" => Ok(GatewayRecordKind::Sale),
        "i" | "iade" | "refund" => Ok(GatewayRecordKind::Refund),
        _ => Err(format!("unknown transaction type {value:?}")),
    }
}

fn is_failed(status: &str) -> bool {
    matches!(
        status.trim().to_lowercase().as_str(),
        "failed" | "fail" | "basarisiz" | "başarısız"
    )
}

/// Accepts `1234.50`, `1234,50`, `1.234,50` and whole numbers. The sign is
/// dropped.
///
/// The decimal part has one or two digits. Dots may group thousands only
/// before a decimal comma, so `1.234` and `1,234.50` are rejected.
fn parse_amount(value: &str) -> Result<Decimal, String> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let unsigned = compact
        .strip_prefix(|c: char| c == '-' || c == '+')
        .unwrap_or(&compact);
    let normalized = normalize_amount(unsigned)
        .ok_or_else(|| format!("ambiguous or unreadable amount {value:?}"))?;
    Decimal::from_str(&normalized)
        .map(|amount| amount.abs())
        .map_err(|error| format!("unreadable amount {value:?}: {error}"))
}

fn all_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

fn normalize_amount(text: &str) -> Option<String> {
    let Some(split) = text.rfind(|c: char| c == '.' || c == ',') else {
        return all_digits(text).then(|| text.to_owned());
    };
    let (whole, fraction) = (&text[..split], &text[split + 1..]);
    if fraction.len() > 2 || !all_digits(fraction) {
        return None;
    }

    let whole = if all_digits(whole) {
        whole.to_owned()
    } else if text[split..].starts_with(',') {
        ungroup_thousands(whole)?
    } else {
        return None;
    };
    Some(format!("{whole}.{fraction}"))
}

/// `1.234.567` to `1234567`; `None` unless every group after the first has
/// exactly three digits.
fn ungroup_thousands(whole: &str) -> Option<String> {
    let mut groups = whole.split('.');
    let first = groups.next()?;
    if first.len() > 3 || !all_digits(first) {
        return None;
    }
    let mut digits = first.to_owned();
    for group in groups {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
        digits.push_str(group);
    }
    Some(digits)
}

fn parse_currency(value: Option<&str>) -> Result<Currency, String> {
    let code = match value.map(str::trim) {
        None => "TRY",
        Some(code) if code.eq_ignore_ascii_case("TL") => "TRY",
        Some(code) => code,
    };
    Currency::try_new(code).map_err(|error| error.to_string())
}

/// Local wall-clock time at `offset`, or an RFC 3339 timestamp.
pub fn parse_local_time(value: &str, offset: FixedOffset) -> Result<DateTime<Utc>, String> {
    if let Ok(local) = NaiveDateTime::parse_from_str(value, LOCAL_TIME_FORMAT) {
        return local
            .and_local_timezone(offset)
            .single()
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| format!("ambiguous local time {value:?}"));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|error| format!("unreadable time {value:?}: {error}"))
}

/// Render an instant as report wall-clock time at `offset`.
pub fn format_local_time(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format(LOCAL_TIME_FORMAT).to_string()
}

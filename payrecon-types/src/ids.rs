//! Validated identifiers.
//!
//! String identifiers are trimmed, non-empty and bounded. UUID identifiers are
//! time-ordered (v7) so that ids generated later sort later.

use nutype::nutype;
use uuid::Uuid;

/// Outbox message identifier.
///
/// Assigned by the store at insert time from a monotonic sequence, so a
/// smaller id always means an older message. Ids start at 1.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Serialize,
        Deserialize,
        TryFrom
    )
)]
pub struct MessageId(i64);

/// Ledger transaction identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Reconciliation run identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Discrepancy identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize
))]
pub struct DiscrepancyId(Uuid);

impl DiscrepancyId {
    /// Generate a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identity of a dispatcher instance holding outbox leases.
///
/// Two live dispatchers must never share a worker id; the claim
/// compare-and-swap relies on it.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct WorkerId(String);

impl WorkerId {
    /// A worker id unique to this process, built from a prefix and a UUIDv7.
    pub fn unique(prefix: &str) -> Result<Self, WorkerIdError> {
        Self::try_new(format!("{prefix}-{}", Uuid::now_v7()))
    }
}

/// Event kind tag used to route an outbox message to its handler.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct MessageType(String);

/// Aggregate key whose messages must be delivered in enqueue order.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct PartitionKey(String);

/// Payment reference shared by the ledger and the payment processor
/// (PayTR `merchant_oid`).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ExternalRef(String);

/// Chart-of-accounts code, e.g. `paytr:clearing` or `seller:42:payable`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AccountCode(String);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn message_id_rejects_zero_and_negative_values() {
        assert!(MessageId::try_new(0).is_err());
        assert!(MessageId::try_new(-7).is_err());
        assert_eq!(MessageId::try_new(1).unwrap().into_inner(), 1);
    }

    #[test]
    fn external_ref_is_trimmed() {
        let reference = ExternalRef::try_new("  TX100 ").unwrap();
        assert_eq!(reference.as_ref(), "TX100");
    }

    #[test]
    fn blank_strings_are_rejected() {
        assert!(ExternalRef::try_new("   ").is_err());
        assert!(WorkerId::try_new("").is_err());
        assert!(MessageType::try_new("\t").is_err());
    }

    #[test]
    fn unique_worker_ids_differ() {
        let first = WorkerId::unique("dispatcher").unwrap();
        let second = WorkerId::unique("dispatcher").unwrap();

        assert_ne!(first, second);
        assert!(first.as_ref().starts_with("dispatcher-"));
    }

    #[test]
    fn generated_uuids_are_distinct() {
        let first = RunId::generate();
        let second = RunId::generate();

        assert_ne!(first, second);
    }

    proptest! {
        #[test]
        fn account_codes_round_trip_through_serde(code in "[a-z]{1,10}:[a-z0-9]{1,10}") {
            let account = AccountCode::try_new(code.clone()).unwrap();
            let json = serde_json::to_string(&account).unwrap();
            let decoded: AccountCode = serde_json::from_str(&json).unwrap();

            prop_assert_eq!(decoded.as_ref(), code.as_str());
        }

        #[test]
        fn message_ids_preserve_ordering(a in 1i64..i64::MAX, b in 1i64..i64::MAX) {
            let left = MessageId::try_new(a).unwrap();
            let right = MessageId::try_new(b).unwrap();

            prop_assert_eq!(left.cmp(&right), a.cmp(&b));
        }
    }
}

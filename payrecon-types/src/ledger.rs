use crate::errors::{ErrorClass, Operation};
use crate::ids::{AccountCode, DiscrepancyId, ExternalRef, TransactionId};
use crate::money::Currency;
use crate::reconciliation::DateRange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

/// Business reason a ledger transaction was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryKind {
    Capture,
    Refund,
    /// Posted by reconciliation or an operator.
    Adjustment,
    /// Exact negation of an earlier transaction.
    Reversal,
}

impl EntryKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
            Self::Reversal => "reversal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "capture" => Some(Self::Capture),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            "reversal" => Some(Self::Reversal),
            _ => None,
        }
    }
}

/// Settlement state of a payment, as seen by the ledger or the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SettlementStatus {
    Settled,
    Refunded,
    Failed,
}

impl SettlementStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "settled" => Some(Self::Settled),
            "refunded" => Some(Self::Refunded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One debit or credit line. Debits are positive, credits negative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub account: AccountCode,
    pub amount: Decimal,
    pub currency: Currency,
}

impl LedgerPosting {
    pub const fn new(account: AccountCode, amount: Decimal, currency: Currency) -> Self {
        Self {
            account,
            amount,
            currency,
        }
    }

    /// Debit `amount` (sign is ignored) to `account`.
    pub fn debit(account: AccountCode, amount: Decimal, currency: Currency) -> Self {
        Self::new(account, amount.abs(), currency)
    }

    /// Credit `amount` (sign is ignored) to `account`.
    pub fn credit(account: AccountCode, amount: Decimal, currency: Currency) -> Self {
        Self::new(account, -amount.abs(), currency)
    }

    /// The same line with the sign flipped.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self::new(self.account.clone(), -self.amount, self.currency.clone())
    }
}

/// Why a posting set was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Imbalance {
    NoPostings,
    ZeroAmount { account: AccountCode },
    NonZeroSum { currency: Currency, sum: Decimal },
}

impl std::fmt::Display for Imbalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPostings => write!(f, "transaction has no postings"),
            Self::ZeroAmount { account } => write!(f, "zero-amount posting to {account}"),
            Self::NonZeroSum { currency, sum } => {
                write!(f, "postings in {currency} sum to {sum}, not zero")
            }
        }
    }
}

/// Verify the double-entry invariant: at least one posting, no zero lines,
/// and a zero sum per currency.
pub fn check_balance(postings: &[LedgerPosting]) -> Result<(), LedgerError> {
    if postings.is_empty() {
        return Err(LedgerError::Imbalanced {
            reason: Imbalance::NoPostings,
        });
    }

    let mut sums: BTreeMap<&Currency, Decimal> = BTreeMap::new();
    for posting in postings {
        if posting.amount.is_zero() {
            return Err(LedgerError::Imbalanced {
                reason: Imbalance::ZeroAmount {
                    account: posting.account.clone(),
                },
            });
        }
        *sums.entry(&posting.currency).or_default() += posting.amount;
    }

    match sums.into_iter().find(|(_, sum)| !sum.is_zero()) {
        Some((currency, sum)) => Err(LedgerError::Imbalanced {
            reason: Imbalance::NonZeroSum {
                currency: currency.clone(),
                sum,
            },
        }),
        None => Ok(()),
    }
}

/// Caller-side value passed to [`LedgerStore::record_transaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLedgerTransaction {
    pub external_ref: ExternalRef,
    pub kind: EntryKind,
    pub status: SettlementStatus,
    pub occurred_at: DateTime<Utc>,
    pub postings: Vec<LedgerPosting>,
    pub reverses: Option<TransactionId>,
    pub discrepancy: Option<DiscrepancyId>,
}

impl NewLedgerTransaction {
    pub const fn new(
        external_ref: ExternalRef,
        kind: EntryKind,
        status: SettlementStatus,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_ref,
            kind,
            status,
            occurred_at,
            postings: Vec::new(),
            reverses: None,
            discrepancy: None,
        }
    }

    #[must_use]
    pub fn with_posting(mut self, posting: LedgerPosting) -> Self {
        self.postings.push(posting);
        self
    }

    /// Link the transaction to the reconciliation discrepancy that caused it.
    #[must_use]
    pub fn for_discrepancy(mut self, discrepancy: DiscrepancyId) -> Self {
        self.discrepancy = Some(discrepancy);
        self
    }

    /// An exact reversal of `original`: same reference, status and
    /// occurrence time, every posting negated.
    pub fn reversal_of(original: &LedgerTransaction) -> Self {
        Self {
            external_ref: original.external_ref.clone(),
            kind: EntryKind::Reversal,
            status: original.status,
            occurred_at: original.occurred_at,
            postings: original.postings.iter().map(LedgerPosting::negated).collect(),
            reverses: Some(original.id),
            discrepancy: None,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        check_balance(&self.postings)
    }
}

/// A persisted, immutable ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub external_ref: ExternalRef,
    pub kind: EntryKind,
    pub status: SettlementStatus,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub postings: Vec<LedgerPosting>,
    pub reverses: Option<TransactionId>,
    pub discrepancy: Option<DiscrepancyId>,
}

impl LedgerTransaction {
    /// Materialize a validated request with its store-assigned metadata.
    pub fn from_new(
        id: TransactionId,
        recorded_at: DateTime<Utc>,
        transaction: NewLedgerTransaction,
    ) -> Self {
        Self {
            id,
            external_ref: transaction.external_ref,
            kind: transaction.kind,
            status: transaction.status,
            occurred_at: transaction.occurred_at,
            recorded_at,
            postings: transaction.postings,
            reverses: transaction.reverses,
            discrepancy: transaction.discrepancy,
        }
    }

    /// Net amount per currency posted to `account` by this transaction.
    pub fn net_on(&self, account: &AccountCode) -> BTreeMap<Currency, Decimal> {
        let mut net = BTreeMap::new();
        for posting in self.postings.iter().filter(|p| &p.account == account) {
            *net.entry(posting.currency.clone()).or_default() += posting.amount;
        }
        net
    }

    /// Ordering key used to find the latest transaction of a reference.
    pub fn chronology(&self) -> (DateTime<Utc>, DateTime<Utc>, TransactionId) {
        (self.occurred_at, self.recorded_at, self.id)
    }
}

/// Error type returned by ledger store operations.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum LedgerError {
    /// Postings violate the double-entry invariant. Nothing was written.
    #[error("imbalanced posting set: {reason}")]
    Imbalanced { reason: Imbalance },

    /// A reversal points at a transaction that does not exist.
    #[error("reversal target {id} not found")]
    ReversalTargetNotFound { id: TransactionId },

    /// A reversal points at a transaction of another external reference.
    #[error("reversal of {id} must use external reference {expected}")]
    ReversalReferenceMismatch {
        id: TransactionId,
        expected: ExternalRef,
    },

    /// The transaction has already been reversed once.
    #[error("transaction {id} is already reversed")]
    AlreadyReversed { id: TransactionId },

    /// Stored row could not be mapped back into a transaction.
    #[error("corrupt ledger row: {detail}")]
    CorruptRow { detail: String },

    /// The database refused the statement: a constraint, trigger or schema
    /// error. Retrying the same write cannot succeed.
    #[error("{operation} rejected by the database: {detail}")]
    Rejected { operation: Operation, detail: String },

    /// Infrastructure failure in the backing store.
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },
}

impl LedgerError {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Imbalanced { .. } => ErrorClass::ImbalancedPosting,
            Self::StoreFailure { .. } => ErrorClass::TransientInfrastructure,
            Self::ReversalTargetNotFound { .. }
            | Self::ReversalReferenceMismatch { .. }
            | Self::AlreadyReversed { .. }
            | Self::CorruptRow { .. }
            | Self::Rejected { .. } => ErrorClass::Fatal,
        }
    }
}

/// Append-only double-entry ledger.
///
/// There is deliberately no update or delete operation. Corrections are
/// recorded as new transactions, typically a reversal plus a corrected copy
/// written together through [`LedgerStore::record_batch`].
pub trait LedgerStore: Send + Sync {
    /// Validate and append one transaction.
    ///
    /// Fails with [`LedgerError::Imbalanced`] when the postings are empty,
    /// contain a zero line, or do not sum to zero per currency.
    fn record_transaction(
        &self,
        transaction: NewLedgerTransaction,
    ) -> impl Future<Output = Result<TransactionId, LedgerError>> + Send;

    /// Append several transactions atomically: all are written or none.
    fn record_batch(
        &self,
        transactions: Vec<NewLedgerTransaction>,
    ) -> impl Future<Output = Result<Vec<TransactionId>, LedgerError>> + Send;

    /// Transactions whose `occurred_at` falls in the half-open range, in
    /// chronological order.
    fn transactions_in_range(
        &self,
        range: DateRange,
    ) -> impl Future<Output = Result<Vec<LedgerTransaction>, LedgerError>> + Send;

    /// Every transaction of an external reference, in chronological order.
    /// Empty when the reference is unknown.
    fn find_by_external_ref(
        &self,
        external_ref: &ExternalRef,
    ) -> impl Future<Output = Result<Vec<LedgerTransaction>, LedgerError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn account(code: &str) -> AccountCode {
        AccountCode::try_new(code).unwrap()
    }

    fn lira() -> Currency {
        Currency::try_new("TRY").unwrap()
    }

    #[test]
    fn balanced_capture_passes() {
        let postings = vec![
            LedgerPosting::debit(account("paytr:clearing"), dec!(100.00), lira()),
            LedgerPosting::credit(account("seller:1:payable"), dec!(90.00), lira()),
            LedgerPosting::credit(account("platform:commission"), dec!(10.00), lira()),
        ];

        assert_eq!(check_balance(&postings), Ok(()));
    }

    #[test]
    fn empty_posting_set_is_rejected() {
        assert_eq!(
            check_balance(&[]),
            Err(LedgerError::Imbalanced {
                reason: Imbalance::NoPostings
            })
        );
    }

    #[test]
    fn zero_amount_line_is_rejected() {
        let postings = vec![
            LedgerPosting::new(account("a"), dec!(0), lira()),
            LedgerPosting::debit(account("b"), dec!(1), lira()),
            LedgerPosting::credit(account("c"), dec!(1), lira()),
        ];

        assert!(matches!(
            check_balance(&postings),
            Err(LedgerError::Imbalanced {
                reason: Imbalance::ZeroAmount { .. }
            })
        ));
    }

    #[test]
    fn balance_is_checked_per_currency() {
        // Each currency is unbalanced even though the raw numbers cancel out.
        let postings = vec![
            LedgerPosting::debit(account("a"), dec!(5), lira()),
            LedgerPosting::credit(account("b"), dec!(5), Currency::try_new("USD").unwrap()),
        ];

        let error = check_balance(&postings).unwrap_err();
        assert_eq!(error.class(), ErrorClass::ImbalancedPosting);
    }

    #[test]
    fn reversal_negates_every_posting() {
        let original = LedgerTransaction {
            id: TransactionId::generate(),
            external_ref: ExternalRef::try_new("TX100").unwrap(),
            kind: EntryKind::Capture,
            status: SettlementStatus::Settled,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            postings: vec![
                LedgerPosting::debit(account("clearing"), dec!(100.00), lira()),
                LedgerPosting::credit(account("revenue"), dec!(100.00), lira()),
            ],
            reverses: None,
            discrepancy: None,
        };

        let reversal = NewLedgerTransaction::reversal_of(&original);

        assert_eq!(reversal.kind, EntryKind::Reversal);
        assert_eq!(reversal.reverses, Some(original.id));
        assert_eq!(reversal.postings[0].amount, dec!(-100.00));
        assert_eq!(reversal.postings[1].amount, dec!(100.00));
        assert_eq!(reversal.validate(), Ok(()));
    }

    #[test]
    fn net_on_sums_only_the_requested_account() {
        let transaction = LedgerTransaction::from_new(
            TransactionId::generate(),
            Utc::now(),
            NewLedgerTransaction::new(
                ExternalRef::try_new("TX1").unwrap(),
                EntryKind::Capture,
                SettlementStatus::Settled,
                Utc::now(),
            )
            .with_posting(LedgerPosting::debit(account("clearing"), dec!(60), lira()))
            .with_posting(LedgerPosting::debit(account("clearing"), dec!(40), lira()))
            .with_posting(LedgerPosting::credit(account("revenue"), dec!(100), lira())),
        );

        let net = transaction.net_on(&account("clearing"));
        assert_eq!(net.get(&lira()), Some(&dec!(100)));
    }

    proptest! {
        #[test]
        fn balanced_sets_always_pass(amounts in prop::collection::vec(1i64..1_000_000, 1..8)) {
            let mut postings: Vec<LedgerPosting> = amounts
                .iter()
                .enumerate()
                .map(|(i, cents)| {
                    LedgerPosting::debit(account(&format!("debit:{i}")), Decimal::new(*cents, 2), lira())
                })
                .collect();
            let total: Decimal = postings.iter().map(|p| p.amount).sum();
            postings.push(LedgerPosting::credit(account("credit"), total, lira()));

            prop_assert_eq!(check_balance(&postings), Ok(()));
        }

        #[test]
        fn unbalanced_sets_always_fail(
            amounts in prop::collection::vec(1i64..1_000_000, 1..8),
            skew in prop_oneof![-1_000i64..-1, 1i64..1_000],
        ) {
            let mut postings: Vec<LedgerPosting> = amounts
                .iter()
                .enumerate()
                .map(|(i, cents)| {
                    LedgerPosting::debit(account(&format!("debit:{i}")), Decimal::new(*cents, 2), lira())
                })
                .collect();
            let total: Decimal = postings.iter().map(|p| p.amount).sum();
            postings.push(LedgerPosting::new(
                account("credit"),
                Decimal::new(skew, 2) - total,
                lira(),
            ));

            let rejected = matches!(check_balance(&postings), Err(LedgerError::Imbalanced { .. }));
            prop_assert!(rejected);
        }
    }
}

use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn is_iso_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

/// ISO 4217 style currency code such as `TRY` or `USD`.
///
/// Input is trimmed and upper-cased before validation, so `" try"` is
/// accepted as `TRY`.
#[nutype(
    sanitize(trim, uppercase),
    validate(predicate = is_iso_currency_code),
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
        Deserialize,
        TryFrom
    )
)]
pub struct Currency(String);

/// A decimal amount in a single currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    /// Signed amount; scale is preserved as given.
    pub amount: Decimal,
    /// Currency the amount is denominated in.
    pub currency: Currency,
}

impl Money {
    /// Build a money value.
    pub const fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Whether the amount is exactly zero, regardless of scale.
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Value primitives and the immutable journal data model shared by every
//! other crate in the posting kernel: [`Money`], [`Currency`], [`Payload`],
//! and the `journal_*` / `subledger_*` row shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};

pub type LegalEntityId = String;
pub type AccountCode = String;
pub type JournalEntryId = String;
pub type JournalLineId = String;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("currency mismatch: {lhs} vs {rhs}")]
    CurrencyMismatch { lhs: String, rhs: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// ISO-4217 currency with the decimal precision the kernel quantises at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub decimal_places: u32,
}

impl Currency {
    pub fn new(code: impl Into<String>, decimal_places: u32) -> Self {
        Self {
            code: code.into(),
            decimal_places,
        }
    }

    pub fn usd() -> Self {
        Self::new("USD", 2)
    }

    pub fn eur() -> Self {
        Self::new("EUR", 2)
    }

    /// Half of one currency unit at this currency's precision, e.g. 0.005
    /// for a 2-decimal currency. The rounding-line tolerance (I5) is
    /// exactly this value.
    pub fn rounding_tolerance(&self) -> Decimal {
        let one = Decimal::ONE;
        let unit = one.checked_div(Decimal::from(10u64.pow(self.decimal_places)));
        match unit {
            Some(unit) => unit / Decimal::TWO,
            None => Decimal::ZERO,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// A decimal amount denominated in a [`Currency`]. Never backed by a binary
/// float; `rust_decimal::Decimal` carries enough significant digits for
/// allocation ratios and tax rates without losing precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    fn require_same_currency(&self, other: &Money) -> CoreResult<()> {
        if self.currency != other.currency {
            return Err(CoreError::CurrencyMismatch {
                lhs: self.currency.code.clone(),
                rhs: other.currency.code.clone(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Money) -> CoreResult<Money> {
        self.require_same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, self.currency.clone()))
    }

    pub fn checked_sub(&self, other: &Money) -> CoreResult<Money> {
        self.require_same_currency(other)?;
        Ok(Money::new(self.amount - other.amount, self.currency.clone()))
    }

    pub fn abs_diff(&self, other: &Money) -> CoreResult<Decimal> {
        self.require_same_currency(other)?;
        Ok((self.amount - other.amount).abs())
    }

    /// Rounds to the currency's configured precision, half-up away from zero.
    pub fn quantize(&self) -> Money {
        let rounded = self
            .amount
            .round_dp_with_strategy(self.currency.decimal_places, RoundingStrategy::MidpointAwayFromZero);
        Money::new(rounded, self.currency.clone())
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount.is_sign_positive() && !self.amount.is_zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency.code)
    }
}

/// An opaque event payload value. Modelled as a closed enum of primitives so
/// the guard-expression interpreter and `source=from_context(field)` line
/// mappings can read it without reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Str(String),
    Number(Decimal),
    Bool(bool),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
    Null,
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PayloadValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            PayloadValue::Number(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PayloadValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PayloadValue]> {
        match self {
            PayloadValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PayloadValue>> {
        match self {
            PayloadValue::Map(fields) => Some(fields),
            _ => None,
        }
    }
}

/// A keyed-by-string event payload, read only through explicit field lookups
/// or the restricted guard evaluator. No ad-hoc type sniffing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload(pub BTreeMap<String, PayloadValue>);

impl Payload {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(mut self, key: impl Into<String>, value: PayloadValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    /// Field access for the guard evaluator. Only top-level field names are
    /// resolved; nested access goes through `as_map()` on the parent value.
    pub fn resolve_path(&self, path: &str) -> Option<&PayloadValue> {
        self.0.get(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostingSide {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Draft,
    Posted,
    Rejected,
}

/// An immutable double-entry journal entry. Once `status` is `Posted` the
/// coordinator never mutates this row again; `hash_self` chains it into the
/// audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalEntryId,
    pub legal_entity: LegalEntityId,
    pub entry_number: u64,
    pub status: EntryStatus,
    pub effective_date: NaiveDate,
    pub currency: Currency,
    pub source_event_id: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub hash_prev: String,
    pub hash_self: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLine {
    pub id: JournalLineId,
    pub entry_id: JournalEntryId,
    pub sequence_in_entry: u32,
    pub account_code: AccountCode,
    pub side: PostingSide,
    pub amount: Money,
    pub dimensions: BTreeMap<String, String>,
    pub is_rounding: bool,
}

/// A projection of a [`JournalLine`] onto a secondary ledger (AP/AR/Cash/
/// Inventory), keyed by a subledger dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubledgerEntry {
    pub id: String,
    pub line_id: JournalLineId,
    pub subledger: String,
    pub subledger_key: String,
    pub amount: Money,
    pub side: PostingSide,
}

/// Checks I1: for every currency present among `lines`, debits equal
/// credits. Returns the per-currency (debit, credit) totals so callers can
/// report the exact imbalance.
pub fn balance_totals(lines: &[JournalLine]) -> BTreeMap<String, (Decimal, Decimal)> {
    let mut totals: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
    for line in lines {
        let entry = totals
            .entry(line.amount.currency.code.clone())
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        match line.side {
            PostingSide::Debit => entry.0 += line.amount.amount,
            PostingSide::Credit => entry.1 += line.amount.amount,
        }
    }
    totals
}

pub fn is_balanced(lines: &[JournalLine]) -> bool {
    balance_totals(lines)
        .values()
        .all(|(debits, credits)| debits == credits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub period_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: PeriodStatus,
    pub allows_adjustments: bool,
}

impl FiscalPeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }
}

/// Canonical, deterministic serialization used wherever the kernel must hash
/// a value reproducibly (the audit chain, engine fingerprints). `BTreeMap`
/// key ordering plus `serde_json`'s stable field order for structs gives a
/// byte-identical encoding across runs for identical values (I7).
pub fn canonical_json<T: Serialize>(value: &T) -> CoreResult<String> {
    serde_json::to_string(value).map_err(|err| CoreError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd_money(amount: Decimal) -> Money {
        Money::new(amount, Currency::usd())
    }

    fn line(side: PostingSide, amount: Decimal, is_rounding: bool) -> JournalLine {
        JournalLine {
            id: "ln-1".into(),
            entry_id: "je-1".into(),
            sequence_in_entry: 0,
            account_code: "1000".into(),
            side,
            amount: usd_money(amount),
            dimensions: BTreeMap::new(),
            is_rounding,
        }
    }

    #[test]
    fn money_rejects_mixed_currency_arithmetic() {
        let usd = Money::new(dec!(10.00), Currency::usd());
        let eur = Money::new(dec!(10.00), Currency::eur());
        assert!(matches!(
            usd.checked_add(&eur),
            Err(CoreError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn money_quantize_rounds_half_up_away_from_zero() {
        let m = Money::new(dec!(10.005), Currency::usd());
        assert_eq!(m.quantize().amount, dec!(10.01));
    }

    #[test]
    fn rounding_tolerance_is_half_a_minor_unit() {
        assert_eq!(Currency::usd().rounding_tolerance(), dec!(0.005));
    }

    #[test]
    fn balance_totals_detects_balanced_entry() {
        let lines = vec![
            line(PostingSide::Debit, dec!(100.00), false),
            line(PostingSide::Credit, dec!(100.00), false),
        ];
        assert!(is_balanced(&lines));
    }

    #[test]
    fn balance_totals_detects_imbalance() {
        let lines = vec![
            line(PostingSide::Debit, dec!(100.00), false),
            line(PostingSide::Credit, dec!(99.00), false),
        ];
        assert!(!is_balanced(&lines));
    }

    #[test]
    fn fiscal_period_contains_boundaries_inclusive() {
        let period = FiscalPeriod {
            period_code: "2025-01".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date"),
            end_date: NaiveDate::from_ymd_opt(2025, 1, 31).expect("valid date"),
            status: PeriodStatus::Open,
            allows_adjustments: false,
        };
        assert!(period.contains(NaiveDate::from_ymd_opt(2025, 1, 1).expect("valid date")));
        assert!(period.contains(NaiveDate::from_ymd_opt(2025, 1, 31).expect("valid date")));
        assert!(!period.contains(NaiveDate::from_ymd_opt(2025, 2, 1).expect("valid date")));
    }

    #[test]
    fn payload_resolves_known_field() {
        let payload = Payload::new().insert("amount", PayloadValue::Number(dec!(42)));
        assert_eq!(
            payload.resolve_path("amount").and_then(PayloadValue::as_decimal),
            Some(dec!(42))
        );
        assert!(payload.resolve_path("missing").is_none());
    }

    #[test]
    fn canonical_json_is_stable_across_calls() {
        let payload = Payload::new()
            .insert("b", PayloadValue::Bool(true))
            .insert("a", PayloadValue::Str("x".into()));
        let first = canonical_json(&payload).expect("serializes");
        let second = canonical_json(&payload).expect("serializes");
        assert_eq!(first, second);
    }
}

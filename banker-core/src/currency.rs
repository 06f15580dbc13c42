//! Exact integer money types
//!
//! All amounts are integer counts of micro-units (millionths of the major
//! currency unit), so arithmetic is exact and associative. Floating point
//! never enters the accounting path.

use crate::error::{Error, Result};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Micro-units per major currency unit
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CurrencyCode {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
    /// UAE Dirham
    AED,
    /// Indian Rupee
    INR,
}

impl CurrencyCode {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            CurrencyCode::USD => "USD",
            CurrencyCode::EUR => "EUR",
            CurrencyCode::GBP => "GBP",
            CurrencyCode::AED => "AED",
            CurrencyCode::INR => "INR",
        }
    }

    /// Parse from an ISO 4217 code
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(CurrencyCode::USD),
            "EUR" => Some(CurrencyCode::EUR),
            "GBP" => Some(CurrencyCode::GBP),
            "AED" => Some(CurrencyCode::AED),
            "INR" => Some(CurrencyCode::INR),
            _ => None,
        }
    }

    /// Wire key for pool entries, e.g. `"USD/1M"`
    pub fn wire_key(&self) -> String {
        format!("{}/1M", self.code())
    }

    /// Parse a wire key back into a currency code
    pub fn from_wire_key(s: &str) -> Option<Self> {
        s.strip_suffix("/1M").and_then(Self::from_code)
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for CurrencyCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_code(s).ok_or_else(|| Error::Config(format!("unknown currency: {s}")))
    }
}

/// A single-currency amount in micro-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    /// Currency of the amount
    pub currency: CurrencyCode,
    /// Count of micro-units, may be negative in deltas and adjustments
    pub micros: i64,
}

impl Amount {
    /// New amount in micro-units
    pub fn new(currency: CurrencyCode, micros: i64) -> Self {
        Self { currency, micros }
    }

    /// Zero in the given currency
    pub fn zero(currency: CurrencyCode) -> Self {
        Self::new(currency, 0)
    }

    /// Whole US dollars
    pub fn usd(units: i64) -> Self {
        Self::new(CurrencyCode::USD, units * MICROS_PER_UNIT)
    }

    /// Micro-US-dollars
    pub fn micro_usd(micros: i64) -> Self {
        Self::new(CurrencyCode::USD, micros)
    }

    /// Whole units of an arbitrary currency
    pub fn of(currency: CurrencyCode, units: i64) -> Self {
        Self::new(currency, units * MICROS_PER_UNIT)
    }

    /// True when the count is zero
    pub fn is_zero(&self) -> bool {
        self.micros == 0
    }

    /// True when the count is negative
    pub fn is_negative(&self) -> bool {
        self.micros < 0
    }

    /// Exact addition, rejecting mixed currencies
    pub fn checked_add(self, other: Amount) -> Result<Amount> {
        self.same_currency(other)?;
        Ok(Amount::new(self.currency, self.micros + other.micros))
    }

    /// Exact subtraction, rejecting mixed currencies
    pub fn checked_sub(self, other: Amount) -> Result<Amount> {
        self.same_currency(other)?;
        Ok(Amount::new(self.currency, self.micros - other.micros))
    }

    fn same_currency(self, other: Amount) -> Result<()> {
        if self.currency != other.currency {
            return Err(Error::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.micros, self.currency.wire_key())
    }
}

/// A multi-currency vector of micro-unit counts
///
/// Entries are kept sorted by currency and pruned when they reach zero, so
/// two pools holding the same money always compare equal. Counts may be
/// negative while computing deltas; the master balance fields themselves
/// stay non-negative (see `Account::check_invariants`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrencyPool {
    entries: BTreeMap<CurrencyCode, i64>,
}

impl CurrencyPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool holding a single amount
    pub fn from_amount(amount: Amount) -> Self {
        let mut pool = Self::new();
        pool.add(amount);
        pool
    }

    /// Count of micro-units in the given currency (zero when absent)
    pub fn get(&self, currency: CurrencyCode) -> i64 {
        self.entries.get(&currency).copied().unwrap_or(0)
    }

    /// Add a single amount
    pub fn add(&mut self, amount: Amount) {
        if amount.micros == 0 {
            return;
        }
        let entry = self.entries.entry(amount.currency).or_insert(0);
        *entry += amount.micros;
        if *entry == 0 {
            self.entries.remove(&amount.currency);
        }
    }

    /// Subtract a single amount
    pub fn sub(&mut self, amount: Amount) {
        self.add(Amount::new(amount.currency, -amount.micros));
    }

    /// Add every entry of another pool
    pub fn add_pool(&mut self, other: &CurrencyPool) {
        for (currency, micros) in other.iter() {
            self.add(Amount::new(currency, micros));
        }
    }

    /// Subtract every entry of another pool
    pub fn sub_pool(&mut self, other: &CurrencyPool) {
        for (currency, micros) in other.iter() {
            self.sub(Amount::new(currency, micros));
        }
    }

    /// Pointwise comparison: `self <= other` in every currency present in
    /// `other`; currencies missing on the left count as zero.
    pub fn le(&self, other: &CurrencyPool) -> bool {
        other
            .iter()
            .all(|(currency, micros)| self.get(currency) <= micros)
    }

    /// True when no entry is non-zero
    pub fn is_zero(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every entry is non-negative
    pub fn non_negative(&self) -> bool {
        self.entries.values().all(|&micros| micros >= 0)
    }

    /// Componentwise monotonic merge: raise each entry to at least
    /// `other`'s count
    ///
    /// This is the merge rule for the monotonic balance fields during a
    /// sync: both sides only ever add, so the larger value is the truth.
    pub fn max_merge(&mut self, other: &CurrencyPool) {
        for (currency, micros) in other.iter() {
            let current = self.get(currency);
            if micros > current {
                self.add(Amount::new(currency, micros - current));
            }
        }
    }

    /// Iterate over `(currency, micros)` entries
    pub fn iter(&self) -> impl Iterator<Item = (CurrencyCode, i64)> + '_ {
        self.entries.iter().map(|(&currency, &micros)| (currency, micros))
    }

    /// Number of non-zero entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the pool has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for CurrencyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (currency, micros)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", currency.wire_key(), micros)?;
        }
        write!(f, "}}")
    }
}

impl Serialize for CurrencyPool {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (currency, micros) in self.iter() {
            map.serialize_entry(&currency.wire_key(), &micros)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for CurrencyPool {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PoolVisitor;

        impl<'de> Visitor<'de> for PoolVisitor {
            type Value = CurrencyPool;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from \"<CODE>/1M\" to an integer micro-unit count")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut pool = CurrencyPool::new();
                while let Some((key, micros)) = access.next_entry::<String, i64>()? {
                    let currency = CurrencyCode::from_wire_key(&key)
                        .ok_or_else(|| de::Error::custom(format!("unknown pool key: {key}")))?;
                    pool.add(Amount::new(currency, micros));
                }
                Ok(pool)
            }
        }

        deserializer.deserialize_map(PoolVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_code_roundtrip() {
        assert_eq!(CurrencyCode::from_code("USD"), Some(CurrencyCode::USD));
        assert_eq!(CurrencyCode::from_code("XXX"), None);
        assert_eq!(CurrencyCode::USD.wire_key(), "USD/1M");
        assert_eq!(
            CurrencyCode::from_wire_key("EUR/1M"),
            Some(CurrencyCode::EUR)
        );
        assert_eq!(CurrencyCode::from_wire_key("EUR"), None);
    }

    #[test]
    fn test_amount_arithmetic() {
        let a = Amount::usd(10);
        let b = Amount::micro_usd(500_000);
        let sum = a.checked_add(b).unwrap();
        assert_eq!(sum.micros, 10_500_000);

        let diff = a.checked_sub(b).unwrap();
        assert_eq!(diff.micros, 9_500_000);
    }

    #[test]
    fn test_amount_currency_mismatch() {
        let usd = Amount::usd(1);
        let eur = Amount::of(CurrencyCode::EUR, 1);
        assert!(usd.checked_add(eur).is_err());
    }

    #[test]
    fn test_pool_add_sub_prunes_zero() {
        let mut pool = CurrencyPool::new();
        pool.add(Amount::usd(5));
        pool.sub(Amount::usd(5));
        assert!(pool.is_zero());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_pool_le() {
        let mut small = CurrencyPool::new();
        small.add(Amount::usd(1));
        let mut big = CurrencyPool::new();
        big.add(Amount::usd(2));
        big.add(Amount::of(CurrencyCode::EUR, 3));

        assert!(small.le(&big));
        assert!(!big.le(&small));

        // Currencies absent from the right operand are ignored
        let mut left = CurrencyPool::new();
        left.add(Amount::of(CurrencyCode::GBP, 100));
        assert!(left.le(&big));
    }

    #[test]
    fn test_pool_max_merge() {
        let mut a = CurrencyPool::new();
        a.add(Amount::usd(5));
        let mut b = CurrencyPool::new();
        b.add(Amount::usd(3));
        b.add(Amount::of(CurrencyCode::EUR, 7));

        a.max_merge(&b);
        assert_eq!(a.get(CurrencyCode::USD), 5 * MICROS_PER_UNIT);
        assert_eq!(a.get(CurrencyCode::EUR), 7 * MICROS_PER_UNIT);
    }

    #[test]
    fn test_pool_wire_format() {
        let mut pool = CurrencyPool::new();
        pool.add(Amount::usd(10));
        let json = serde_json::to_string(&pool).unwrap();
        assert_eq!(json, r#"{"USD/1M":10000000}"#);

        let back: CurrencyPool = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pool);

        let empty: CurrencyPool = serde_json::from_str("{}").unwrap();
        assert!(empty.is_zero());
        assert_eq!(serde_json::to_string(&empty).unwrap(), "{}");
    }
}

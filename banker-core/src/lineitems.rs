//! Categorical spend breakdowns

use crate::currency::{Amount, CurrencyPool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A breakdown of spend by categorical label
///
/// Labels are free-form strings chosen by the bidder (ad id, placement,
/// fee class). The breakdown is advisory: the `spent` balance field is
/// authoritative and a commit may carry an empty breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineItems {
    entries: BTreeMap<String, CurrencyPool>,
}

impl LineItems {
    /// Empty breakdown
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an amount under a label
    pub fn add(&mut self, label: impl Into<String>, amount: Amount) {
        if amount.is_zero() {
            return;
        }
        let label = label.into();
        let pool = self.entries.entry(label.clone()).or_default();
        pool.add(amount);
        if pool.is_zero() {
            self.entries.remove(&label);
        }
    }

    /// Merge another breakdown into this one, label by label
    pub fn add_items(&mut self, other: &LineItems) {
        for (label, pool) in &other.entries {
            for (currency, micros) in pool.iter() {
                self.add(label.clone(), Amount::new(currency, micros));
            }
        }
    }

    /// Subtract another breakdown (used when computing deltas)
    pub fn sub_items(&mut self, other: &LineItems) {
        for (label, pool) in &other.entries {
            for (currency, micros) in pool.iter() {
                self.add(label.clone(), Amount::new(currency, -micros));
            }
        }
    }

    /// Componentwise monotonic merge, label by label, same rule as the
    /// pool `max_merge`
    pub fn max_merge(&mut self, other: &LineItems) {
        for (label, pool) in &other.entries {
            self.entries
                .entry(label.clone())
                .or_default()
                .max_merge(pool);
        }
    }

    /// Pool for a single label (empty when absent)
    pub fn get(&self, label: &str) -> CurrencyPool {
        self.entries.get(label).cloned().unwrap_or_default()
    }

    /// Sum over all labels
    pub fn total(&self) -> CurrencyPool {
        let mut total = CurrencyPool::new();
        for pool in self.entries.values() {
            total.add_pool(pool);
        }
        total
    }

    /// True when there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(label, pool)` entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CurrencyPool)> {
        self.entries.iter().map(|(label, pool)| (label.as_str(), pool))
    }
}

impl fmt::Display for LineItems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (label, pool)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}: {pool}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CurrencyCode;

    #[test]
    fn test_add_and_total() {
        let mut items = LineItems::new();
        items.add("banner", Amount::usd(2));
        items.add("video", Amount::usd(3));
        items.add("banner", Amount::usd(1));

        assert_eq!(items.get("banner").get(CurrencyCode::USD), 3_000_000);
        assert_eq!(items.total().get(CurrencyCode::USD), 6_000_000);
    }

    #[test]
    fn test_sub_items_removes_empty_labels() {
        let mut items = LineItems::new();
        items.add("banner", Amount::usd(2));

        let mut other = LineItems::new();
        other.add("banner", Amount::usd(2));

        items.sub_items(&other);
        assert!(items.is_empty());
    }

    #[test]
    fn test_max_merge_keeps_larger_entries() {
        let mut items = LineItems::new();
        items.add("banner", Amount::usd(2));

        let mut other = LineItems::new();
        other.add("banner", Amount::usd(1));
        other.add("video", Amount::usd(3));

        items.max_merge(&other);
        assert_eq!(items.get("banner").get(CurrencyCode::USD), 2_000_000);
        assert_eq!(items.get("video").get(CurrencyCode::USD), 3_000_000);
    }

    #[test]
    fn test_wire_format() {
        let mut items = LineItems::new();
        items.add("banner", Amount::usd(1));
        let json = serde_json::to_string(&items).unwrap();
        assert_eq!(json, r#"{"banner":{"USD/1M":1000000}}"#);

        let empty = LineItems::new();
        assert_eq!(serde_json::to_string(&empty).unwrap(), "{}");
    }
}

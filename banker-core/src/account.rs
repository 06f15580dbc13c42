//! The ledger node and its balance algebra
//!
//! An `Account` is a closed vector of balance fields obeying one invariant:
//! money in equals money out, where `available` counts as an "out to the
//! account itself" term. Every mutation below preserves the invariant or
//! fails before touching state.

use crate::currency::{Amount, CurrencyPool};
use crate::error::{Error, Result};
use crate::lineitems::LineItems;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema metadata carried in the JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object type tag
    #[serde(rename = "objectType")]
    pub object_type: String,
    /// Schema version
    pub version: u32,
}

impl Default for ObjectMetadata {
    fn default() -> Self {
        Self {
            object_type: "Account".to_string(),
            version: 1,
        }
    }
}

/// Account type
///
/// `Budget` accounts take `setBudget` at the root of a subtree and never
/// authorize bids. `Spend` accounts are leaves whose shadows authorize
/// bids; they receive funds only through `allocatedIn`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Freshly constructed, not yet classified
    #[default]
    None,
    /// Interior node holding and routing budget
    Budget,
    /// Leaf node that spends
    Spend,
}

/// One ledger node
///
/// Fields are public: the published operations are the supported mutation
/// path, and code that pokes fields directly owns the burden of calling
/// [`Account::check_invariants`] afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Account {
    /// Schema metadata
    pub md: ObjectMetadata,

    /// Account type
    #[serde(rename = "type")]
    pub account_type: AccountType,

    /// Cumulative gross budget grants at the root of a subtree
    pub budget_increases: CurrencyPool,

    /// Cumulative gross budget withdrawals
    pub budget_decreases: CurrencyPool,

    /// Funds received from children by recuperation
    pub recycled_in: CurrencyPool,

    /// Funds returned to the parent by recuperation
    pub recycled_out: CurrencyPool,

    /// Funds received from the parent as available money
    pub allocated_in: CurrencyPool,

    /// Funds pushed down to children (or back up to the parent)
    pub allocated_out: CurrencyPool,

    /// In-flight bid authorizations
    pub commitments_made: CurrencyPool,

    /// Retired authorizations (committed or cancelled)
    pub commitments_retired: CurrencyPool,

    /// Bookkeeping corrections in
    pub adjustments_in: CurrencyPool,

    /// Bookkeeping corrections out
    pub adjustments_out: CurrencyPool,

    /// Final recorded spend
    pub spent: CurrencyPool,

    /// Derived current balance: funds neither spent, committed nor pushed
    /// to children
    pub available: CurrencyPool,

    /// Breakdown of `spent` by label
    pub line_items: LineItems,

    /// Breakdown of adjustments by label
    pub adjustment_line_items: LineItems,
}

impl Account {
    /// New empty account of the given type
    pub fn new(account_type: AccountType) -> Self {
        Self {
            account_type,
            ..Self::default()
        }
    }

    /// Net budget: `budgetIncreases - budgetDecreases`
    pub fn net_budget(&self) -> CurrencyPool {
        let mut net = self.budget_increases.clone();
        net.sub_pool(&self.budget_decreases);
        net
    }

    /// In-flight commitments: `commitmentsMade - commitmentsRetired`
    pub fn in_flight(&self) -> CurrencyPool {
        let mut net = self.commitments_made.clone();
        net.sub_pool(&self.commitments_retired);
        net
    }

    fn in_sum(&self) -> CurrencyPool {
        let mut sum = self.budget_increases.clone();
        sum.add_pool(&self.recycled_in);
        sum.add_pool(&self.allocated_in);
        sum.add_pool(&self.commitments_retired);
        sum.add_pool(&self.adjustments_in);
        sum
    }

    fn out_sum_without_available(&self) -> CurrencyPool {
        let mut sum = self.budget_decreases.clone();
        sum.add_pool(&self.recycled_out);
        sum.add_pool(&self.allocated_out);
        sum.add_pool(&self.commitments_made);
        sum.add_pool(&self.adjustments_out);
        sum.add_pool(&self.spent);
        sum
    }

    fn balance_fields(&self) -> [(&'static str, &CurrencyPool); 12] {
        [
            ("budgetIncreases", &self.budget_increases),
            ("budgetDecreases", &self.budget_decreases),
            ("recycledIn", &self.recycled_in),
            ("recycledOut", &self.recycled_out),
            ("allocatedIn", &self.allocated_in),
            ("allocatedOut", &self.allocated_out),
            ("commitmentsMade", &self.commitments_made),
            ("commitmentsRetired", &self.commitments_retired),
            ("adjustmentsIn", &self.adjustments_in),
            ("adjustmentsOut", &self.adjustments_out),
            ("spent", &self.spent),
            ("available", &self.available),
        ]
    }

    /// Verify the balance invariant and non-negativity of every field
    pub fn check_invariants(&self) -> Result<()> {
        for (field, pool) in self.balance_fields() {
            if !pool.non_negative() {
                return Err(self.violation(field, "negative balance"));
            }
        }

        let mut lhs = self.in_sum();
        let mut rhs = self.out_sum_without_available();
        rhs.add_pool(&self.available);
        if lhs != rhs {
            lhs.sub_pool(&rhs);
            return Err(self.violation("available", &format!("in - out imbalance {lhs}")));
        }
        Ok(())
    }

    fn violation(&self, field: &'static str, what: &str) -> Error {
        let detail = format!("{what}; state: {self}");
        tracing::error!(field, state = %self, "account invariant violated: {what}");
        Error::InvariantViolation {
            account: String::new(),
            field,
            detail,
        }
    }

    /// Recompute `available` from the invariant
    ///
    /// Used after a delta application: every other field has been updated
    /// additively and `available` is the closing term. Fails when the
    /// result would be negative.
    pub fn recompute_available(&mut self) -> Result<()> {
        let mut avail = self.in_sum();
        avail.sub_pool(&self.out_sum_without_available());
        if !avail.non_negative() {
            return Err(self.violation("available", "recomputed available is negative"));
        }
        self.available = avail;
        Ok(())
    }

    /// Set the net budget of this account to `budget`
    ///
    /// Raises go to `budgetIncreases`, cuts to `budgetDecreases`; a cut is
    /// bounded by `available`, and the lowest reachable net budget is the
    /// amount already allocated out, spent or committed.
    pub fn set_budget(&mut self, budget: Amount) -> Result<()> {
        let currency = budget.currency;
        let net =
            self.budget_increases.get(currency) - self.budget_decreases.get(currency);

        if budget.micros >= net {
            let raise = Amount::new(currency, budget.micros - net);
            self.budget_increases.add(raise);
            self.available.add(raise);
        } else {
            let cut = net - budget.micros;
            let avail = self.available.get(currency);
            if cut > avail {
                return Err(Error::BudgetExceedsAvailable {
                    requested: budget,
                    floor: Amount::new(currency, net - avail),
                    key: String::new(),
                });
            }
            let cut = Amount::new(currency, cut);
            self.budget_decreases.add(cut);
            self.available.sub(cut);
        }
        self.check_invariants()
    }

    /// Move funds across the parent boundary until `available == target`
    ///
    /// A raise debits the parent's `available` and credits this account
    /// through the `allocatedIn`/`allocatedOut` pair; a reduction runs the
    /// same pair in the opposite direction.
    pub fn set_available_from(&mut self, parent: &mut Account, target: Amount) -> Result<()> {
        let currency = target.currency;
        let have = self.available.get(currency);

        if target.micros > have {
            let needed = Amount::new(currency, target.micros - have);
            let parent_avail = parent.available.get(currency);
            if parent_avail < needed.micros {
                return Err(Error::InsufficientFunds {
                    requested: needed,
                    available: Amount::new(currency, parent_avail),
                    key: String::new(),
                });
            }
            parent.available.sub(needed);
            parent.allocated_out.add(needed);
            self.allocated_in.add(needed);
            self.available.add(needed);
        } else if target.micros < have {
            if target.micros < 0 {
                return Err(Error::InsufficientFunds {
                    requested: target,
                    available: Amount::new(currency, have),
                    key: String::new(),
                });
            }
            let surplus = Amount::new(currency, have - target.micros);
            self.available.sub(surplus);
            self.allocated_out.add(surplus);
            parent.allocated_in.add(surplus);
            parent.available.add(surplus);
        }

        self.check_invariants()?;
        parent.check_invariants()
    }

    /// Sweep the whole `available` balance up to the parent
    ///
    /// Idempotent when `available` is already zero. Returns the amounts
    /// moved.
    pub fn recuperate_to(&mut self, parent: &mut Account) -> Result<CurrencyPool> {
        let moved = std::mem::take(&mut self.available);
        self.recycled_out.add_pool(&moved);
        parent.recycled_in.add_pool(&moved);
        parent.available.add_pool(&moved);

        self.check_invariants()?;
        parent.check_invariants()?;
        Ok(moved)
    }

    /// Apply a bookkeeping correction outside the budget flow
    ///
    /// Positive amounts credit `adjustmentsIn` and `available`; negative
    /// amounts debit `available` and credit `adjustmentsOut`.
    pub fn add_adjustment(&mut self, amount: Amount, label: &str) -> Result<()> {
        if amount.micros >= 0 {
            self.adjustments_in.add(amount);
            self.available.add(amount);
        } else {
            let debit = Amount::new(amount.currency, -amount.micros);
            let avail = self.available.get(amount.currency);
            if avail < debit.micros {
                return Err(Error::InsufficientFunds {
                    requested: debit,
                    available: Amount::new(amount.currency, avail),
                    key: String::new(),
                });
            }
            self.available.sub(debit);
            self.adjustments_out.add(debit);
        }
        self.adjustment_line_items.add(label, amount);
        self.check_invariants()
    }

    /// Reserve `amount` against a future bid; false when `available` is
    /// short (a normal outcome, not an error)
    pub(crate) fn authorize(&mut self, amount: Amount) -> bool {
        if self.available.get(amount.currency) < amount.micros {
            return false;
        }
        self.commitments_made.add(amount);
        self.available.sub(amount);
        true
    }

    /// Retire an authorization, returning the full amount to `available`
    pub(crate) fn cancel(&mut self, amount: Amount) {
        self.commitments_retired.add(amount);
        self.available.add(amount);
    }

    /// Retire an authorization as spend; the unspent remainder returns to
    /// `available`
    pub(crate) fn commit(&mut self, authorized: Amount, paid: Amount, line_items: &LineItems) {
        self.commitments_retired.add(authorized);
        self.spent.add(paid);
        self.available
            .add(Amount::new(authorized.currency, authorized.micros - paid.micros));
        self.line_items.add_items(line_items);
    }

    /// Account for a bid handed off from another shadow
    ///
    /// The reserved amount arrives through `allocatedIn` (its counterpart
    /// is the unretired commitment on the detaching account), then the
    /// usual authorize-and-commit pair runs locally.
    pub(crate) fn commit_detached(
        &mut self,
        authorized: Amount,
        paid: Amount,
        line_items: &LineItems,
    ) {
        self.allocated_in.add(authorized);
        self.available.add(authorized);
        self.commitments_made.add(authorized);
        self.available.sub(authorized);
        self.commit(authorized, paid, line_items);
    }

    /// Raise every monotonic field to at least `other`'s value
    ///
    /// The monotonic fields only ever grow on both sides of a sync, so
    /// the componentwise maximum is the truth. `available` is excluded:
    /// it is recomputed from the invariant afterwards.
    pub(crate) fn max_monotonic(&mut self, other: &Account) {
        self.budget_increases.max_merge(&other.budget_increases);
        self.budget_decreases.max_merge(&other.budget_decreases);
        self.recycled_in.max_merge(&other.recycled_in);
        self.recycled_out.max_merge(&other.recycled_out);
        self.allocated_in.max_merge(&other.allocated_in);
        self.allocated_out.max_merge(&other.allocated_out);
        self.commitments_made.max_merge(&other.commitments_made);
        self.commitments_retired.max_merge(&other.commitments_retired);
        self.adjustments_in.max_merge(&other.adjustments_in);
        self.adjustments_out.max_merge(&other.adjustments_out);
        self.spent.max_merge(&other.spent);
        self.line_items.max_merge(&other.line_items);
        self.adjustment_line_items
            .max_merge(&other.adjustment_line_items);
    }

    /// Field-wise difference of the monotonic fields since `snapshot`
    pub fn delta_since(&self, snapshot: &Account) -> AccountDelta {
        fn diff(current: &CurrencyPool, old: &CurrencyPool) -> CurrencyPool {
            let mut delta = current.clone();
            delta.sub_pool(old);
            delta
        }

        let mut line_items = self.line_items.clone();
        line_items.sub_items(&snapshot.line_items);
        let mut adjustment_line_items = self.adjustment_line_items.clone();
        adjustment_line_items.sub_items(&snapshot.adjustment_line_items);

        AccountDelta {
            budget_increases: diff(&self.budget_increases, &snapshot.budget_increases),
            budget_decreases: diff(&self.budget_decreases, &snapshot.budget_decreases),
            recycled_in: diff(&self.recycled_in, &snapshot.recycled_in),
            recycled_out: diff(&self.recycled_out, &snapshot.recycled_out),
            allocated_in: diff(&self.allocated_in, &snapshot.allocated_in),
            allocated_out: diff(&self.allocated_out, &snapshot.allocated_out),
            commitments_made: diff(&self.commitments_made, &snapshot.commitments_made),
            commitments_retired: diff(&self.commitments_retired, &snapshot.commitments_retired),
            adjustments_in: diff(&self.adjustments_in, &snapshot.adjustments_in),
            adjustments_out: diff(&self.adjustments_out, &snapshot.adjustments_out),
            spent: diff(&self.spent, &snapshot.spent),
            line_items,
            adjustment_line_items,
        }
    }

    /// Grow every monotonic field by the delta, then recompute `available`
    /// from the invariant
    ///
    /// `available` is never merged directly: both sides may have added to
    /// the same fields since the snapshot and recomputation is the only
    /// rule that avoids double counting.
    pub fn apply_delta(&mut self, delta: &AccountDelta) -> Result<()> {
        if !delta.non_negative() {
            return Err(self.violation("delta", "delta has negative components"));
        }
        self.budget_increases.add_pool(&delta.budget_increases);
        self.budget_decreases.add_pool(&delta.budget_decreases);
        self.recycled_in.add_pool(&delta.recycled_in);
        self.recycled_out.add_pool(&delta.recycled_out);
        self.allocated_in.add_pool(&delta.allocated_in);
        self.allocated_out.add_pool(&delta.allocated_out);
        self.commitments_made.add_pool(&delta.commitments_made);
        self.commitments_retired.add_pool(&delta.commitments_retired);
        self.adjustments_in.add_pool(&delta.adjustments_in);
        self.adjustments_out.add_pool(&delta.adjustments_out);
        self.spent.add_pool(&delta.spent);
        self.line_items.add_items(&delta.line_items);
        self.adjustment_line_items
            .add_items(&delta.adjustment_line_items);

        self.recompute_available()?;
        self.check_invariants()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Account({:?}", self.account_type)?;
        for (field, pool) in self.balance_fields() {
            if !pool.is_zero() {
                write!(f, ", {field}={pool}")?;
            }
        }
        write!(f, ")")
    }
}

/// Field-wise difference between a shadow's current state and its last
/// synced snapshot
///
/// Carries every balance field except `available`, which the receiving
/// side recomputes from the invariant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountDelta {
    /// Delta of `budgetIncreases`
    pub budget_increases: CurrencyPool,
    /// Delta of `budgetDecreases`
    pub budget_decreases: CurrencyPool,
    /// Delta of `recycledIn`
    pub recycled_in: CurrencyPool,
    /// Delta of `recycledOut`
    pub recycled_out: CurrencyPool,
    /// Delta of `allocatedIn`
    pub allocated_in: CurrencyPool,
    /// Delta of `allocatedOut`
    pub allocated_out: CurrencyPool,
    /// Delta of `commitmentsMade`
    pub commitments_made: CurrencyPool,
    /// Delta of `commitmentsRetired`
    pub commitments_retired: CurrencyPool,
    /// Delta of `adjustmentsIn`
    pub adjustments_in: CurrencyPool,
    /// Delta of `adjustmentsOut`
    pub adjustments_out: CurrencyPool,
    /// Delta of `spent`
    pub spent: CurrencyPool,
    /// Delta of the spend breakdown
    pub line_items: LineItems,
    /// Delta of the adjustment breakdown
    pub adjustment_line_items: LineItems,
}

impl AccountDelta {
    /// True when every component is zero
    pub fn is_zero(&self) -> bool {
        self.budget_increases.is_zero()
            && self.budget_decreases.is_zero()
            && self.recycled_in.is_zero()
            && self.recycled_out.is_zero()
            && self.allocated_in.is_zero()
            && self.allocated_out.is_zero()
            && self.commitments_made.is_zero()
            && self.commitments_retired.is_zero()
            && self.adjustments_in.is_zero()
            && self.adjustments_out.is_zero()
            && self.spent.is_zero()
            && self.line_items.is_empty()
            && self.adjustment_line_items.is_empty()
    }

    /// True when no component has a negative entry
    pub fn non_negative(&self) -> bool {
        self.budget_increases.non_negative()
            && self.budget_decreases.non_negative()
            && self.recycled_in.non_negative()
            && self.recycled_out.non_negative()
            && self.allocated_in.non_negative()
            && self.allocated_out.non_negative()
            && self.commitments_made.non_negative()
            && self.commitments_retired.non_negative()
            && self.adjustments_in.non_negative()
            && self.adjustments_out.non_negative()
            && self.spent.non_negative()
    }
}

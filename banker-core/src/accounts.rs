//! The master account tree
//!
//! The tree is a flat ordered map from [`AccountKey`] to [`Account`]; the
//! parent relation is computed from key prefixes, so there are no cycles
//! and no ownership ambiguity. All mutators either move the paired
//! parent/child fields together or leave both sides untouched.

use crate::account::{Account, AccountDelta, AccountType};
use crate::currency::{Amount, CurrencyPool};
use crate::error::{Error, Result};
use crate::shadow::ShadowId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Ordered path of non-empty segments identifying an account
///
/// The textual form joins segments with `:`, e.g.
/// `campaign:strategy:spend`. Keys order lexicographically by segment,
/// which keeps every subtree contiguous in the master map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountKey(Vec<String>);

impl AccountKey {
    /// Build a key from segments, validating each one
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(Error::InvalidKey("key has no segments".to_string()));
        }
        for segment in &segments {
            Self::check_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// Length-1 key for the root of a campaign
    pub fn root(segment: impl Into<String>) -> Result<Self> {
        Self::new([segment.into()])
    }

    /// Parse the `a:b:c` textual form
    pub fn parse(s: &str) -> Result<Self> {
        Self::new(s.split(':'))
    }

    fn check_segment(segment: &str) -> Result<()> {
        if segment.is_empty() {
            return Err(Error::InvalidKey("empty key segment".to_string()));
        }
        if segment.contains(':') {
            return Err(Error::InvalidKey(format!(
                "key segment contains ':': {segment}"
            )));
        }
        Ok(())
    }

    /// The key with the last segment removed, `None` at a root
    pub fn parent(&self) -> Option<AccountKey> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(AccountKey(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Extend this key with a child segment
    pub fn child(&self, segment: impl Into<String>) -> Result<AccountKey> {
        let segment = segment.into();
        Self::check_segment(&segment)?;
        let mut segments = self.0.clone();
        segments.push(segment);
        Ok(AccountKey(segments))
    }

    /// Append a segment in place
    pub fn push(&mut self, segment: impl Into<String>) -> Result<()> {
        let segment = segment.into();
        Self::check_segment(&segment)?;
        self.0.push(segment);
        Ok(())
    }

    /// True for length-1 keys
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: keys have at least one segment
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True when `prefix` is an ancestor-or-self of this key
    pub fn starts_with(&self, prefix: &AccountKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

impl FromStr for AccountKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for AccountKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccountKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AccountKey::parse(&s).map_err(de::Error::custom)
    }
}

/// How `setAvailable` finds funds when the parent itself is short
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecycleMode {
    /// Fail fast with `InsufficientFunds`
    None,
    /// First recuperate the parent's children that are budget accounts
    Budget,
    /// Also recuperate the parent's spend children
    Spend,
}

/// Aggregated view of a subtree for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    /// Root key of the aggregated subtree
    pub key: AccountKey,
    /// Net budget summed over the subtree
    pub budget: CurrencyPool,
    /// Spend summed over the subtree
    pub spent: CurrencyPool,
    /// Available summed over the subtree
    pub available: CurrencyPool,
    /// In-flight commitments summed over the subtree
    pub in_flight: CurrencyPool,
    /// Summaries of direct children, keyed by the child's last segment
    pub children: BTreeMap<String, AccountSummary>,
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccountSummary({}: budget={}, spent={}, available={}, inFlight={})",
            self.key, self.budget, self.spent, self.available, self.in_flight
        )
    }
}

/// The master tree of accounts
#[derive(Debug, Default)]
pub struct Accounts {
    pub(crate) accounts: BTreeMap<AccountKey, Account>,
    pub(crate) shadow_seq: HashMap<ShadowId, u64>,
}

impl Accounts {
    /// Empty master
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &AccountKey) -> Result<&Account> {
        self.accounts
            .get(key)
            .ok_or_else(|| Error::AccountMissing { key: key.clone() })
    }

    /// True when an account exists at `key`
    pub fn exists(&self, key: &AccountKey) -> bool {
        self.accounts.contains_key(key)
    }

    /// All keys in lexicographic order
    pub fn keys(&self) -> Vec<AccountKey> {
        self.accounts.keys().cloned().collect()
    }

    /// Number of accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// True when the tree is empty
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Create a budget account at `key`, creating missing ancestors as
    /// budget accounts
    pub fn create_budget_account(&mut self, key: &AccountKey) -> Result<()> {
        self.create_account(key, AccountType::Budget)
    }

    /// Create a spend account at `key`, creating missing ancestors as
    /// budget accounts
    pub fn create_spend_account(&mut self, key: &AccountKey) -> Result<()> {
        self.create_account(key, AccountType::Spend)
    }

    fn create_account(&mut self, key: &AccountKey, account_type: AccountType) -> Result<()> {
        // Ancestors must exist as budget accounts
        for depth in 1..key.len() {
            let ancestor = AccountKey(key.segments()[..depth].to_vec());
            match self.accounts.get(&ancestor) {
                None => {
                    self.accounts
                        .insert(ancestor, Account::new(AccountType::Budget));
                }
                Some(existing) if existing.account_type == AccountType::Spend => {
                    return Err(Error::TypeMismatch {
                        key: ancestor,
                        expected: AccountType::Budget,
                        actual: AccountType::Spend,
                    });
                }
                Some(_) => {}
            }
        }

        match self.accounts.get(key) {
            Some(existing) if existing.account_type == account_type => Ok(()),
            Some(existing) => Err(Error::AccountExists {
                key: key.clone(),
                existing_type: existing.account_type,
            }),
            None => {
                tracing::debug!(key = %key, ?account_type, "creating account");
                self.accounts.insert(key.clone(), Account::new(account_type));
                Ok(())
            }
        }
    }

    /// Set the net budget at a root key
    pub fn set_budget(&mut self, key: &AccountKey, budget: Amount) -> Result<()> {
        if !key.is_root() {
            return Err(Error::InvalidKey(format!(
                "setBudget is only legal at a root key, got '{key}'"
            )));
        }
        let account = self.get(key)?;
        if account.account_type != AccountType::Budget {
            return Err(Error::TypeMismatch {
                key: key.clone(),
                expected: AccountType::Budget,
                actual: account.account_type,
            });
        }

        let mut account = account.clone();
        account.set_budget(budget).map_err(|e| e.for_account(key))?;
        self.accounts.insert(key.clone(), account);
        Ok(())
    }

    /// Ensure `available` at `key` equals `target`, moving funds across
    /// the parent boundary
    ///
    /// When the parent is short and `mode` allows it, the parent's other
    /// children are recuperated first (best effort: the sweep persists
    /// even when the operation still fails afterwards).
    pub fn set_available(
        &mut self,
        key: &AccountKey,
        target: Amount,
        mode: RecycleMode,
    ) -> Result<()> {
        let parent_key = key.parent().ok_or_else(|| {
            Error::InvalidKey(format!("setAvailable needs a parent, got root '{key}'"))
        })?;

        let have = self.get(key)?.available.get(target.currency);
        let needed = target.micros - have;

        if needed > 0 {
            let parent_avail = self.get(&parent_key)?.available.get(target.currency);
            if parent_avail < needed && mode != RecycleMode::None {
                self.sweep_children(&parent_key, key, mode)?;
            }
        }

        let mut child = self.get(key)?.clone();
        let mut parent = self.get(&parent_key)?.clone();
        child
            .set_available_from(&mut parent, target)
            .map_err(|e| e.for_account(key))?;
        self.accounts.insert(key.clone(), child);
        self.accounts.insert(parent_key, parent);
        Ok(())
    }

    /// Recuperate the parent's children to cover a shortfall
    fn sweep_children(
        &mut self,
        parent_key: &AccountKey,
        skip: &AccountKey,
        mode: RecycleMode,
    ) -> Result<()> {
        for child_key in self.children(parent_key) {
            if child_key == *skip {
                continue;
            }
            let child_type = self.get(&child_key)?.account_type;
            let sweep = match child_type {
                AccountType::Budget => true,
                AccountType::Spend => mode == RecycleMode::Spend,
                AccountType::None => false,
            };
            if sweep {
                let moved = self.recuperate(&child_key)?;
                if !moved.is_zero() {
                    tracing::debug!(child = %child_key, %moved, "recycled child funds");
                }
            }
        }
        Ok(())
    }

    /// Direct children of `key`, in lexicographic order
    pub fn children(&self, key: &AccountKey) -> Vec<AccountKey> {
        self.accounts
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(key))
            .filter(|(k, _)| k.len() == key.len() + 1)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Sweep `available` at `key` up to its parent
    pub fn recuperate(&mut self, key: &AccountKey) -> Result<CurrencyPool> {
        let parent_key = key.parent().ok_or_else(|| {
            Error::InvalidKey(format!("recuperate needs a parent, got root '{key}'"))
        })?;

        let mut child = self.get(key)?.clone();
        let mut parent = self.get(&parent_key)?.clone();
        let moved = child
            .recuperate_to(&mut parent)
            .map_err(|e| e.for_account(key))?;
        self.accounts.insert(key.clone(), child);
        self.accounts.insert(parent_key, parent);
        Ok(moved)
    }

    /// Apply a bookkeeping correction at `key`
    pub fn add_adjustment(&mut self, key: &AccountKey, amount: Amount, label: &str) -> Result<()> {
        let mut account = self.get(key)?.clone();
        account
            .add_adjustment(amount, label)
            .map_err(|e| e.for_account(key))?;
        self.accounts.insert(key.clone(), account);
        Ok(())
    }

    /// Current `available` at `key` (not the subtree sum)
    pub fn get_available(&self, key: &AccountKey) -> Result<CurrencyPool> {
        Ok(self.get(key)?.available.clone())
    }

    /// Clone of the ledger node at `key`
    pub fn get_account(&self, key: &AccountKey) -> Result<Account> {
        Ok(self.get(key)?.clone())
    }

    /// Aggregate the subtree rooted at `key`
    pub fn get_account_summary(&self, key: &AccountKey) -> Result<AccountSummary> {
        let account = self.get(key)?;

        let mut summary = AccountSummary {
            key: key.clone(),
            budget: account.net_budget(),
            spent: account.spent.clone(),
            available: account.available.clone(),
            in_flight: account.in_flight(),
            children: BTreeMap::new(),
        };

        for child_key in self.children(key) {
            let child = self.get_account_summary(&child_key)?;
            summary.budget.add_pool(&child.budget);
            summary.spent.add_pool(&child.spent);
            summary.available.add_pool(&child.available);
            summary.in_flight.add_pool(&child.in_flight);
            let label = child_key.segments()[child_key.len() - 1].clone();
            summary.children.insert(label, child);
        }

        Ok(summary)
    }

    /// Verify every per-account invariant plus the cross-account checks
    ///
    /// Cross-account: in-flight commitments never go negative, and each
    /// account's `recycledIn` equals the sum of its children's
    /// `recycledOut` (recycling only ever flows one level up).
    pub fn check_invariants(&self) -> Result<()> {
        for (key, account) in &self.accounts {
            account.check_invariants().map_err(|e| e.for_account(key))?;

            if !account.in_flight().non_negative() {
                return Err(Error::InvariantViolation {
                    account: key.to_string(),
                    field: "commitmentsRetired",
                    detail: format!("retired exceeds made: {account}"),
                });
            }

            let mut child_recycled = CurrencyPool::new();
            for child_key in self.children(key) {
                child_recycled.add_pool(&self.get(&child_key)?.recycled_out);
            }
            if child_recycled != account.recycled_in {
                return Err(Error::InvariantViolation {
                    account: key.to_string(),
                    field: "recycledIn",
                    detail: format!(
                        "recycledIn {} != children recycledOut {}",
                        account.recycled_in, child_recycled
                    ),
                });
            }
        }
        Ok(())
    }

    /// Current master state of `key`, for a shadow's `syncFrom`
    pub fn sync_state(&self, key: &AccountKey) -> Result<Account> {
        self.get_account(key)
    }

    /// Apply a shadow's delta atomically
    ///
    /// The shadow presents the last sequence number the master returned to
    /// it; anything else is rejected with `StaleSync` and no state change,
    /// which makes retried deliveries safe. On success the new master
    /// state and sequence number are returned for the shadow to install.
    pub fn sync_to(
        &mut self,
        shadow: ShadowId,
        key: &AccountKey,
        delta: &AccountDelta,
        client_seq: u64,
    ) -> Result<(Account, u64)> {
        let master_seq = self.shadow_seq.get(&shadow).copied().unwrap_or(0);
        if client_seq != master_seq {
            tracing::warn!(%shadow, key = %key, master_seq, client_seq, "rejecting stale sync");
            return Err(Error::StaleSync {
                master_seq,
                client_seq,
            });
        }

        let mut account = self.get(key)?.clone();
        account.apply_delta(delta).map_err(|e| e.for_account(key))?;
        self.accounts.insert(key.clone(), account.clone());

        let new_seq = master_seq + 1;
        self.shadow_seq.insert(shadow, new_seq);
        tracing::debug!(%shadow, key = %key, seq = new_seq, "applied shadow delta");
        Ok((account, new_seq))
    }
}

/// The master behind the coarse exclusive lock of the concurrency model
///
/// Bidder threads own their shadows outright; everything that touches the
/// master goes through this wrapper. Mutators take the write lock, reads
/// take the read lock.
#[derive(Debug, Clone, Default)]
pub struct SharedAccounts {
    inner: Arc<RwLock<Accounts>>,
}

impl SharedAccounts {
    /// Wrap an existing master
    pub fn new(accounts: Accounts) -> Self {
        Self {
            inner: Arc::new(RwLock::new(accounts)),
        }
    }

    /// Read guard on the master
    pub fn read(&self) -> RwLockReadGuard<'_, Accounts> {
        self.inner.read()
    }

    /// Write guard on the master
    pub fn write(&self) -> RwLockWriteGuard<'_, Accounts> {
        self.inner.write()
    }

    /// See [`Accounts::create_budget_account`]
    pub fn create_budget_account(&self, key: &AccountKey) -> Result<()> {
        self.write().create_budget_account(key)
    }

    /// See [`Accounts::create_spend_account`]
    pub fn create_spend_account(&self, key: &AccountKey) -> Result<()> {
        self.write().create_spend_account(key)
    }

    /// See [`Accounts::set_budget`]
    pub fn set_budget(&self, key: &AccountKey, budget: Amount) -> Result<()> {
        self.write().set_budget(key, budget)
    }

    /// See [`Accounts::set_available`]
    pub fn set_available(&self, key: &AccountKey, target: Amount, mode: RecycleMode) -> Result<()> {
        self.write().set_available(key, target, mode)
    }

    /// See [`Accounts::recuperate`]
    pub fn recuperate(&self, key: &AccountKey) -> Result<CurrencyPool> {
        self.write().recuperate(key)
    }

    /// See [`Accounts::get_available`]
    pub fn get_available(&self, key: &AccountKey) -> Result<CurrencyPool> {
        self.read().get_available(key)
    }

    /// See [`Accounts::get_account`]
    pub fn get_account(&self, key: &AccountKey) -> Result<Account> {
        self.read().get_account(key)
    }

    /// See [`Accounts::get_account_summary`]
    pub fn get_account_summary(&self, key: &AccountKey) -> Result<AccountSummary> {
        self.read().get_account_summary(key)
    }

    /// See [`Accounts::check_invariants`]
    pub fn check_invariants(&self) -> Result<()> {
        self.read().check_invariants()
    }
}

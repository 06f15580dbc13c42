//! Per-bidder shadow accounts
//!
//! A shadow mirrors one spend-capable master account so a bidder thread
//! can authorize and settle bids without touching the master. It keeps
//! the master state from the last sync (`snapshot`), the locally mutated
//! state (`current`) and the map of active authorizations; syncs exchange
//! the field-wise difference between the two account states.
//!
//! Shadows are owned by one thread and never lock. Only the sync calls
//! reach the master.

use crate::account::{Account, AccountDelta};
use crate::accounts::{AccountKey, Accounts, SharedAccounts};
use crate::currency::{Amount, CurrencyPool};
use crate::error::{Error, Result};
use crate::lineitems::LineItems;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

/// Identity of a shadow collection, used by the master's sequence map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShadowId(Uuid);

impl ShadowId {
    /// Fresh random identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShadowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShadowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an authorized bid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidState {
    /// Funds reserved, bid decision pending
    Authorized,
    /// Handed off to another shadow for the commit
    Detached,
    /// Spend recorded, terminal
    Committed,
    /// Reservation returned, terminal
    Cancelled,
}

/// An active authorization
#[derive(Debug, Clone)]
struct Bid {
    amount: Amount,
    state: BidState,
}

/// Local mirror of one master account
#[derive(Debug, Clone, Default)]
pub struct ShadowAccount {
    /// Master state at the last sync
    snapshot: Account,
    /// Locally mutated state
    current: Account,
    /// Active authorizations by bid id
    bids: HashMap<String, Bid>,
}

impl ShadowAccount {
    /// Empty shadow; both states are all zero until the first sync
    pub fn new() -> Self {
        Self::default()
    }

    /// Locally visible `available`
    pub fn available(&self) -> &CurrencyPool {
        &self.current.available
    }

    /// Clone of the locally mutated account state
    pub fn state(&self) -> Account {
        self.current.clone()
    }

    /// Number of entries in the bid map, authorized and detached
    pub fn active_bids(&self) -> usize {
        self.bids.len()
    }

    /// Number of bids this shadow still has to settle
    ///
    /// Detached bids are excluded: their commit happens on another
    /// shadow.
    pub fn authorized_bids(&self) -> usize {
        self.bids
            .values()
            .filter(|bid| bid.state == BidState::Authorized)
            .count()
    }

    /// Reserve `amount` for a bid
    ///
    /// Returns false without side effects when local `available` cannot
    /// cover the amount. The bid id must not be active.
    pub fn authorize_bid(&mut self, bid_id: &str, amount: Amount) -> Result<bool> {
        if self.bids.contains_key(bid_id) {
            return Err(Error::DuplicateBid {
                bid_id: bid_id.to_string(),
            });
        }
        if !self.current.authorize(amount) {
            return Ok(false);
        }
        self.bids.insert(
            bid_id.to_string(),
            Bid {
                amount,
                state: BidState::Authorized,
            },
        );
        Ok(true)
    }

    /// Cancel an authorized bid, returning its amount to `available`
    pub fn cancel_bid(&mut self, bid_id: &str) -> Result<Amount> {
        let bid = self.take_authorized(bid_id)?;
        self.current.cancel(bid.amount);
        tracing::debug!(bid_id, state = ?BidState::Cancelled, "bid retired");
        Ok(bid.amount)
    }

    /// Commit an authorized bid as spend
    ///
    /// `paid` must not exceed the authorized amount; the remainder goes
    /// back to `available`.
    pub fn commit_bid(&mut self, bid_id: &str, paid: Amount, line_items: &LineItems) -> Result<()> {
        let amount = match self.bids.get(bid_id) {
            None => {
                return Err(Error::UnknownBid {
                    bid_id: bid_id.to_string(),
                })
            }
            Some(bid) if bid.state != BidState::Authorized => {
                return Err(Error::WrongBidState {
                    bid_id: bid_id.to_string(),
                    state: bid.state,
                })
            }
            Some(bid) => bid.amount,
        };
        check_paid(bid_id, amount, paid)?;

        self.bids.remove(bid_id);
        self.current.commit(amount, paid, line_items);
        tracing::debug!(bid_id, state = ?BidState::Committed, "bid retired");
        Ok(())
    }

    /// Relinquish an authorized bid so another shadow can commit it
    ///
    /// The amount stays inside this account's in-flight commitments and
    /// the entry stays behind as `Detached`: this shadow is no longer
    /// responsible for the settlement, and any further operation on the
    /// id is `WrongBidState`.
    pub fn detach_bid(&mut self, bid_id: &str) -> Result<Amount> {
        let bid = self.bids.get_mut(bid_id).ok_or_else(|| Error::UnknownBid {
            bid_id: bid_id.to_string(),
        })?;
        if bid.state != BidState::Authorized {
            return Err(Error::WrongBidState {
                bid_id: bid_id.to_string(),
                state: bid.state,
            });
        }
        bid.state = BidState::Detached;
        Ok(bid.amount)
    }

    /// Account for a bid detached from another shadow
    pub fn commit_detached_bid(
        &mut self,
        authorized: Amount,
        paid: Amount,
        line_items: &LineItems,
    ) -> Result<()> {
        check_paid("(detached)", authorized, paid)?;
        self.current.commit_detached(authorized, paid, line_items);
        Ok(())
    }

    fn take_authorized(&mut self, bid_id: &str) -> Result<Bid> {
        let bid = self.bids.remove(bid_id).ok_or_else(|| Error::UnknownBid {
            bid_id: bid_id.to_string(),
        })?;
        if bid.state != BidState::Authorized {
            let state = bid.state;
            self.bids.insert(bid_id.to_string(), bid);
            return Err(Error::WrongBidState {
                bid_id: bid_id.to_string(),
                state,
            });
        }
        Ok(bid)
    }

    /// Unshipped local changes since the last sync
    pub fn delta(&self) -> AccountDelta {
        self.current.delta_since(&self.snapshot)
    }

    /// Merge a fresh master state into the local one
    ///
    /// The new snapshot is the componentwise maximum of the master state
    /// and the old snapshot over the monotonic fields, so a re-delivered
    /// older master state never rolls the shadow back. The local delta is
    /// replayed on top; `available` is recomputed from the invariant,
    /// never merged.
    pub fn sync_from(&mut self, master: &Account) -> Result<()> {
        let local = self.delta();
        let mut base = master.clone();
        base.max_monotonic(&self.snapshot);
        base.recompute_available()?;
        self.current = base.clone();
        self.snapshot = base;
        self.current.apply_delta(&local)?;
        Ok(())
    }

    /// Install the master state returned by a successful `syncTo`
    ///
    /// All local deltas were just shipped, so both states collapse onto
    /// the master value.
    pub fn install_synced(&mut self, master: Account) {
        self.snapshot = master.clone();
        self.current = master;
    }

    /// Verify local invariants
    ///
    /// Beyond the per-account checks, the active authorizations can never
    /// exceed the in-flight commitments.
    pub fn check_invariants(&self) -> Result<()> {
        self.snapshot.check_invariants()?;
        self.current.check_invariants()?;

        let mut reserved = CurrencyPool::new();
        for bid in self.bids.values() {
            reserved.add(bid.amount);
        }
        let in_flight = self.current.in_flight();
        let covered = reserved
            .iter()
            .all(|(currency, micros)| micros <= in_flight.get(currency));
        if !covered {
            return Err(Error::InvariantViolation {
                account: String::new(),
                field: "commitmentsMade",
                detail: format!(
                    "active bids {} exceed in-flight {}",
                    reserved,
                    self.current.in_flight()
                ),
            });
        }
        Ok(())
    }
}

fn check_paid(bid_id: &str, authorized: Amount, paid: Amount) -> Result<()> {
    if authorized.currency != paid.currency {
        return Err(Error::CurrencyMismatch {
            left: authorized.currency,
            right: paid.currency,
        });
    }
    if paid.micros > authorized.micros || paid.micros < 0 {
        return Err(Error::CommitExceedsAuthorization {
            bid_id: bid_id.to_string(),
            authorized,
            paid,
        });
    }
    Ok(())
}

/// The collection of shadows owned by one bidder thread
#[derive(Debug, Default)]
pub struct ShadowAccounts {
    id: ShadowId,
    last_master_seq: u64,
    shadows: BTreeMap<AccountKey, ShadowAccount>,
}

impl ShadowAccounts {
    /// Fresh collection with a random identity
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity presented to the master's sequence map
    pub fn id(&self) -> ShadowId {
        self.id
    }

    /// Create an empty shadow for `key`
    pub fn activate_account(&mut self, key: &AccountKey) {
        self.shadows.entry(key.clone()).or_default();
    }

    /// True when a shadow exists for `key`
    pub fn is_active(&self, key: &AccountKey) -> bool {
        self.shadows.contains_key(key)
    }

    /// Drop the shadow for `key`
    ///
    /// Requires a final `syncTo` first: unshipped deltas or bids this
    /// shadow still has to settle would silently lose money. Detached
    /// entries do not block: their settlement belongs to another shadow.
    pub fn deactivate_account(&mut self, key: &AccountKey) -> Result<()> {
        let shadow = self.get(key)?;
        if !shadow.delta().is_zero() || shadow.authorized_bids() > 0 {
            return Err(Error::Concurrency(format!(
                "shadow '{key}' has unshipped deltas or live bids"
            )));
        }
        self.shadows.remove(key);
        Ok(())
    }

    fn get(&self, key: &AccountKey) -> Result<&ShadowAccount> {
        self.shadows
            .get(key)
            .ok_or_else(|| Error::AccountMissing { key: key.clone() })
    }

    fn get_mut(&mut self, key: &AccountKey) -> Result<&mut ShadowAccount> {
        self.shadows
            .get_mut(key)
            .ok_or_else(|| Error::AccountMissing { key: key.clone() })
    }

    /// See [`ShadowAccount::available`]
    pub fn available(&self, key: &AccountKey) -> Result<CurrencyPool> {
        Ok(self.get(key)?.available().clone())
    }

    /// See [`ShadowAccount::authorize_bid`]
    pub fn authorize_bid(&mut self, key: &AccountKey, bid_id: &str, amount: Amount) -> Result<bool> {
        self.get_mut(key)?.authorize_bid(bid_id, amount)
    }

    /// See [`ShadowAccount::cancel_bid`]
    pub fn cancel_bid(&mut self, key: &AccountKey, bid_id: &str) -> Result<Amount> {
        self.get_mut(key)?.cancel_bid(bid_id)
    }

    /// See [`ShadowAccount::commit_bid`]
    pub fn commit_bid(
        &mut self,
        key: &AccountKey,
        bid_id: &str,
        paid: Amount,
        line_items: &LineItems,
    ) -> Result<()> {
        self.get_mut(key)?.commit_bid(bid_id, paid, line_items)
    }

    /// See [`ShadowAccount::detach_bid`]
    pub fn detach_bid(&mut self, key: &AccountKey, bid_id: &str) -> Result<Amount> {
        self.get_mut(key)?.detach_bid(bid_id)
    }

    /// See [`ShadowAccount::commit_detached_bid`]
    pub fn commit_detached_bid(
        &mut self,
        key: &AccountKey,
        authorized: Amount,
        paid: Amount,
        line_items: &LineItems,
    ) -> Result<()> {
        self.get_mut(key)?
            .commit_detached_bid(authorized, paid, line_items)
    }

    /// Pull fresh master state into every active shadow
    pub fn sync_from(&mut self, master: &Accounts) -> Result<()> {
        for (key, shadow) in &mut self.shadows {
            let state = master.sync_state(key)?;
            shadow.sync_from(&state)?;
        }
        Ok(())
    }

    /// Ship every non-zero local delta to the master
    ///
    /// Each application advances this collection's sequence number, so a
    /// redelivered delta is rejected as `StaleSync` instead of being
    /// double counted.
    pub fn sync_to(&mut self, master: &mut Accounts) -> Result<()> {
        for (key, shadow) in &mut self.shadows {
            let delta = shadow.delta();
            if delta.is_zero() {
                continue;
            }
            let (state, seq) = master.sync_to(self.id, key, &delta, self.last_master_seq)?;
            self.last_master_seq = seq;
            shadow.install_synced(state);
        }
        Ok(())
    }

    /// `syncTo` then `syncFrom` in one step
    pub fn sync(&mut self, master: &mut Accounts) -> Result<()> {
        self.sync_to(master)?;
        self.sync_from(master)
    }

    /// See [`ShadowAccounts::sync_from`], against the shared master
    pub fn sync_from_shared(&mut self, master: &SharedAccounts) -> Result<()> {
        self.sync_from(&master.read())
    }

    /// See [`ShadowAccounts::sync_to`], against the shared master
    pub fn sync_to_shared(&mut self, master: &SharedAccounts) -> Result<()> {
        self.sync_to(&mut master.write())
    }

    /// Full sync against the shared master in one critical section
    pub fn sync_shared(&mut self, master: &SharedAccounts) -> Result<()> {
        self.sync(&mut master.write())
    }

    /// Verify invariants of every active shadow
    pub fn check_invariants(&self) -> Result<()> {
        for (key, shadow) in &self.shadows {
            shadow.check_invariants().map_err(|e| e.for_account(key))?;
        }
        Ok(())
    }
}

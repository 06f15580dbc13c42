//! Property-based tests for banker invariants
//!
//! These tests use proptest to verify the critical invariants:
//! - Per-account balance: money in == money out + available, exactly
//! - Money conservation across master and shadows
//! - setBudget idempotence
//! - Bid round-trips reflect exactly the net spend on the master
//! - Detached hand-offs conserve money for any sync interleaving

use banker_core::{
    AccountKey, Accounts, Amount, CurrencyCode, CurrencyPool, Error, LineItems, RecycleMode,
    SharedAccounts, ShadowAccounts,
};
use proptest::prelude::*;

fn key(s: &str) -> AccountKey {
    AccountKey::parse(s).unwrap()
}

fn usd_pool(micros: i64) -> CurrencyPool {
    CurrencyPool::from_amount(Amount::micro_usd(micros))
}

/// Strategy for bid amounts: 1 micro to 1 USD
fn amount_strategy() -> impl Strategy<Value = Amount> {
    (1i64..1_000_000).prop_map(Amount::micro_usd)
}

/// Strategy for budget targets: 0 to 100 USD
fn budget_strategy() -> impl Strategy<Value = Amount> {
    (0i64..100_000_000).prop_map(Amount::micro_usd)
}

/// One shadow action: authorize then settle one way or the other
#[derive(Debug, Clone)]
enum BidAction {
    /// Commit the given fraction (per mille) of the authorized amount
    Commit { amount: Amount, per_mille: i64 },
    /// Cancel outright
    Cancel { amount: Amount },
}

fn bid_action_strategy() -> impl Strategy<Value = BidAction> {
    prop_oneof![
        (amount_strategy(), 0i64..=1000)
            .prop_map(|(amount, per_mille)| BidAction::Commit { amount, per_mille }),
        amount_strategy().prop_map(|amount| BidAction::Cancel { amount }),
    ]
}

/// Master with one budget root and one spend leaf holding `available`
fn spend_master(available: Amount) -> (Accounts, AccountKey) {
    let mut master = Accounts::new();
    let spend = key("campaign:spend");
    master.create_spend_account(&spend).unwrap();
    master
        .set_budget(&key("campaign"), Amount::usd(1_000))
        .unwrap();
    master
        .set_available(&spend, available, RecycleMode::None)
        .unwrap();
    (master, spend)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the per-account invariant survives any setBudget walk,
    /// including rejected steps
    #[test]
    fn prop_set_budget_walk_keeps_invariants(targets in prop::collection::vec(budget_strategy(), 1..20)) {
        let mut master = Accounts::new();
        let campaign = key("campaign");
        let spend = key("campaign:spend");
        master.create_spend_account(&spend).unwrap();

        for target in targets {
            // Rejections are normal outcomes; state must stay valid either way
            let _ = master.set_budget(&campaign, target);
            master.check_invariants().unwrap();
        }
    }

    /// Property: setBudget is idempotent
    #[test]
    fn prop_set_budget_idempotent(first in budget_strategy(), second in budget_strategy()) {
        let mut once = Accounts::new();
        once.create_budget_account(&key("campaign")).unwrap();
        once.set_budget(&key("campaign"), first).unwrap();
        once.set_budget(&key("campaign"), second).unwrap();

        let mut twice = Accounts::new();
        twice.create_budget_account(&key("campaign")).unwrap();
        twice.set_budget(&key("campaign"), first).unwrap();
        twice.set_budget(&key("campaign"), second).unwrap();
        twice.set_budget(&key("campaign"), second).unwrap();

        prop_assert_eq!(
            once.get_account(&key("campaign")).unwrap(),
            twice.get_account(&key("campaign")).unwrap()
        );
    }

    /// Property: any bid sequence with interleaved syncs leaves the master
    /// at exactly the net spend, with nothing in flight
    #[test]
    fn prop_bid_round_trip(
        actions in prop::collection::vec(bid_action_strategy(), 1..40),
        sync_every in 1usize..8,
    ) {
        let (mut master, spend) = spend_master(Amount::usd(100));

        let mut shadow = ShadowAccounts::new();
        shadow.activate_account(&spend);
        shadow.sync_from(&master).unwrap();

        let mut expected_spent = 0i64;
        for (i, action) in actions.iter().enumerate() {
            let bid_id = format!("bid-{i}");
            match action {
                BidAction::Commit { amount, per_mille } => {
                    if shadow.authorize_bid(&spend, &bid_id, *amount).unwrap() {
                        let paid = Amount::micro_usd(amount.micros * per_mille / 1000);
                        shadow
                            .commit_bid(&spend, &bid_id, paid, &LineItems::new())
                            .unwrap();
                        expected_spent += paid.micros;
                    }
                }
                BidAction::Cancel { amount } => {
                    if shadow.authorize_bid(&spend, &bid_id, *amount).unwrap() {
                        shadow.cancel_bid(&spend, &bid_id).unwrap();
                    }
                }
            }
            if i % sync_every == 0 {
                shadow.sync(&mut master).unwrap();
            }
            shadow.check_invariants().unwrap();
        }
        shadow.sync(&mut master).unwrap();

        let account = master.get_account(&spend).unwrap();
        prop_assert_eq!(&account.spent, &usd_pool(expected_spent));
        prop_assert!(account.in_flight().is_zero());
        master.check_invariants().unwrap();

        // Nothing spent or reserved means everything is still available
        let summary = master.get_account_summary(&key("campaign")).unwrap();
        let mut total = summary.available.clone();
        total.add_pool(&summary.spent);
        total.add_pool(&summary.in_flight);
        prop_assert_eq!(&total, &CurrencyPool::from_amount(Amount::usd(1_000)));
    }

    /// Property: a detached hand-off conserves money for either sync order
    #[test]
    fn prop_handoff_conservation(
        amount in amount_strategy(),
        per_mille in 0i64..=1000,
        commit_side_first in any::<bool>(),
    ) {
        let (mut master, bid_key) = spend_master(Amount::usd(100));
        let commit_key = key("campaign:commit");
        master.create_spend_account(&commit_key).unwrap();

        let mut bidder = ShadowAccounts::new();
        bidder.activate_account(&bid_key);
        bidder.sync_from(&master).unwrap();

        let mut committer = ShadowAccounts::new();
        committer.activate_account(&commit_key);
        committer.sync_from(&master).unwrap();

        prop_assert!(bidder.authorize_bid(&bid_key, "ad", amount).unwrap());
        let detached = bidder.detach_bid(&bid_key, "ad").unwrap();
        let paid = Amount::micro_usd(amount.micros * per_mille / 1000);
        committer
            .commit_detached_bid(&commit_key, detached, paid, &LineItems::new())
            .unwrap();

        if commit_side_first {
            committer.sync(&mut master).unwrap();
            bidder.sync(&mut master).unwrap();
        } else {
            bidder.sync(&mut master).unwrap();
            committer.sync(&mut master).unwrap();
        }

        master.check_invariants().unwrap();

        // The spend landed on the committing account; the reservation
        // stays in flight on the bidding account, matched by the
        // committing account's allocatedIn
        let commit_acc = master.get_account(&commit_key).unwrap();
        prop_assert_eq!(&commit_acc.spent, &usd_pool(paid.micros));
        prop_assert_eq!(&commit_acc.allocated_in, &usd_pool(amount.micros));

        let bid_acc = master.get_account(&bid_key).unwrap();
        prop_assert_eq!(&bid_acc.in_flight(), &usd_pool(amount.micros));
        prop_assert!(bid_acc.spent.is_zero());
    }

    /// Property: redelivered deltas never double-apply
    #[test]
    fn prop_stale_sync_is_idempotent(amount in amount_strategy()) {
        let (mut master, spend) = spend_master(Amount::usd(10));

        let mut shadow = ShadowAccounts::new();
        shadow.activate_account(&spend);
        shadow.sync_from(&master).unwrap();

        prop_assert!(shadow.authorize_bid(&spend, "ad", amount).unwrap());
        shadow
            .commit_bid(&spend, "ad", amount, &LineItems::new())
            .unwrap();

        let before = master.get_account(&spend).unwrap();
        shadow.sync_to(&mut master).unwrap();
        let after_first = master.get_account(&spend).unwrap();
        prop_assert_ne!(&before, &after_first);

        // A second identical delivery carries the stale sequence number
        let replay = after_first.delta_since(&before);
        let err = master
            .sync_to(shadow.id(), &spend, &replay, 0)
            .unwrap_err();
        let is_stale_sync = matches!(err, Error::StaleSync { .. });
        prop_assert!(is_stale_sync);
        prop_assert_eq!(&master.get_account(&spend).unwrap(), &after_first);
    }
}

mod integration_tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    /// The five-round bidding cycle: authorize, cancel, detach, commit on
    /// a separate spend shadow, recuperate, top back up
    #[test]
    fn test_five_round_bidding_cycle() {
        let mut master = Accounts::new();
        let budget = key("budget");
        let commitment = key("budget:commitment");
        let spend = key("budget:spend");

        master.create_budget_account(&budget).unwrap();
        master.create_spend_account(&commitment).unwrap();
        master.create_spend_account(&spend).unwrap();
        master.set_budget(&budget, Amount::usd(10)).unwrap();
        master
            .set_available(&commitment, Amount::usd(2), RecycleMode::Spend)
            .unwrap();
        assert_eq!(master.get_available(&budget).unwrap(), usd_pool(8_000_000));

        let mut shadow = ShadowAccounts::new();
        shadow.activate_account(&commitment);
        shadow.activate_account(&spend);

        for round in 1..=5u32 {
            shadow.sync_from(&master).unwrap();

            // Detached entries stay behind, so each round bids fresh ids
            let ad1 = format!("r{round}-ad1");
            let ad2 = format!("r{round}-ad2");
            let ad3 = format!("r{round}-ad3");
            let auth1 = shadow.authorize_bid(&commitment, &ad1, Amount::usd(1)).unwrap();
            let auth2 = shadow.authorize_bid(&commitment, &ad2, Amount::usd(1)).unwrap();
            let auth3 = shadow.authorize_bid(&commitment, &ad3, Amount::usd(1)).unwrap();
            assert!(auth1);
            assert!(auth2);
            assert!(!auth3);

            shadow.check_invariants().unwrap();

            let detached = shadow.detach_bid(&commitment, &ad1).unwrap();
            assert_eq!(detached, Amount::usd(1));

            shadow.cancel_bid(&commitment, &ad2).unwrap();

            shadow
                .commit_detached_bid(
                    &spend,
                    detached,
                    Amount::micro_usd(500_000),
                    &LineItems::new(),
                )
                .unwrap();

            shadow.sync_to(&mut master).unwrap();
            master.check_invariants().unwrap();

            master.recuperate(&spend).unwrap();
            master
                .set_available(&commitment, Amount::usd(2), RecycleMode::Spend)
                .unwrap();
            master.check_invariants().unwrap();

            shadow.sync_from(&master).unwrap();
            assert_eq!(master.get_available(&commitment).unwrap(), usd_pool(2_000_000));
            assert_eq!(shadow.available(&commitment).unwrap(), usd_pool(2_000_000));
            assert_eq!(master.get_available(&spend).unwrap(), usd_pool(0));
            assert_eq!(shadow.available(&spend).unwrap(), usd_pool(0));

            // Each round spends half a dollar and leaves one dollar in flight
            let summary = master.get_account_summary(&budget).unwrap();
            assert_eq!(summary.spent, usd_pool(500_000 * i64::from(round)));
            assert_eq!(summary.in_flight, usd_pool(1_000_000 * i64::from(round)));
        }

        assert_eq!(master.get_available(&budget).unwrap(), usd_pool(5_500_000));
    }

    /// Scenario: budget walk against the master, including the floor
    #[test]
    fn test_budget_walk_and_floor() {
        let mut master = Accounts::new();
        let campaign = key("campaign");
        let child = key("campaign:child");
        master.create_budget_account(&child).unwrap();

        master.set_budget(&campaign, Amount::usd(8)).unwrap();
        master.set_budget(&campaign, Amount::usd(7)).unwrap();
        master.set_budget(&campaign, Amount::usd(8)).unwrap();
        master.set_budget(&campaign, Amount::usd(13)).unwrap();

        let account = master.get_account(&campaign).unwrap();
        assert_eq!(account.available, usd_pool(13_000_000));
        assert_eq!(account.budget_increases, usd_pool(14_000_000));
        assert_eq!(account.budget_decreases, usd_pool(1_000_000));

        // Push 10 down; the budget can no longer drop below 10
        master
            .set_available(&child, Amount::usd(10), RecycleMode::None)
            .unwrap();
        let err = master.set_budget(&campaign, Amount::usd(9)).unwrap_err();
        assert!(matches!(err, Error::BudgetExceedsAvailable { .. }));

        master.set_budget(&campaign, Amount::usd(10)).unwrap();
        assert_eq!(master.get_available(&campaign).unwrap(), usd_pool(0));
        master.check_invariants().unwrap();
    }

    /// A shadow crash loses only its local reservations; the master stays
    /// conserved and a fresh shadow can pick the account back up
    #[test]
    fn test_shadow_restart_conservation() {
        let (mut master, spend) = spend_master(Amount::usd(10));

        let mut shadow = ShadowAccounts::new();
        shadow.activate_account(&spend);
        shadow.sync_from(&master).unwrap();
        assert!(shadow.authorize_bid(&spend, "a", Amount::usd(2)).unwrap());
        assert!(shadow.authorize_bid(&spend, "b", Amount::usd(1)).unwrap());
        shadow.sync_to(&mut master).unwrap();

        // Settles locally but crashes before shipping the delta
        shadow.commit_bid(&spend, "a", Amount::usd(2), &LineItems::new()).unwrap();
        drop(shadow);

        master.check_invariants().unwrap();
        let account = master.get_account(&spend).unwrap();
        assert_eq!(account.in_flight(), usd_pool(3_000_000));
        assert!(account.spent.is_zero());

        // A fresh shadow sees the master state and keeps bidding
        let mut shadow = ShadowAccounts::new();
        shadow.activate_account(&spend);
        shadow.sync_from(&master).unwrap();
        assert_eq!(shadow.available(&spend).unwrap(), usd_pool(7_000_000));

        assert!(shadow.authorize_bid(&spend, "c", Amount::usd(1)).unwrap());
        shadow.commit_bid(&spend, "c", Amount::usd(1), &LineItems::new()).unwrap();
        shadow.sync(&mut master).unwrap();

        master.check_invariants().unwrap();
        assert_eq!(master.get_account(&spend).unwrap().spent, usd_pool(1_000_000));
    }

    /// Scaled-down multi-threaded stress: topup threads, budget threads,
    /// bid threads and one commit thread hammer a shared master; money is
    /// conserved to the micro-unit
    #[test]
    fn test_multi_threaded_stress() {
        const N_TOPUP_THREADS: usize = 2;
        const N_BUDGET_THREADS: usize = 2;
        const N_BID_THREADS: usize = 2;
        const TOPUPS_PER_THREAD: usize = 200;
        const BUDGET_ADDS_PER_THREAD: usize = 5;
        const BIDS_PER_THREAD: usize = 1_000;

        let shared = SharedAccounts::default();
        let campaign = key("campaign");
        let strategy = key("campaign:strategy");

        shared.create_budget_account(&strategy).unwrap();
        shared.set_budget(&campaign, Amount::usd(10)).unwrap();
        shared
            .set_available(&strategy, Amount::usd(5), RecycleMode::Budget)
            .unwrap();

        let committed = Arc::new(AtomicI64::new(0));
        let detached_total = Arc::new(AtomicI64::new(0));
        let (detach_tx, detach_rx) = mpsc::channel::<Amount>();

        let mut handles = Vec::new();

        for _ in 0..N_TOPUP_THREADS {
            let shared = shared.clone();
            let strategy = strategy.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..TOPUPS_PER_THREAD {
                    // Running dry here is a normal outcome
                    let _ = shared.set_available(
                        &strategy,
                        Amount::micro_usd(100_000),
                        RecycleMode::Budget,
                    );
                }
            }));
        }

        for _ in 0..N_BUDGET_THREADS {
            let shared = shared.clone();
            let campaign = campaign.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..BUDGET_ADDS_PER_THREAD {
                    let summary = shared.get_account_summary(&campaign).unwrap();
                    let target = Amount::micro_usd(
                        summary.budget.get(CurrencyCode::USD) + 1_000_000,
                    );
                    // Lost races surface as rejected cuts; both are fine
                    let _ = shared.set_budget(&campaign, target);
                    thread::sleep(std::time::Duration::from_millis(5));
                }
            }));
        }

        for thread_num in 0..N_BID_THREADS {
            let shared = shared.clone();
            let strategy = strategy.clone();
            let committed = committed.clone();
            let detached_total = detached_total.clone();
            let detach_tx = detach_tx.clone();
            handles.push(thread::spawn(move || {
                let account = strategy.child(format!("bid{thread_num}")).unwrap();
                shared.create_spend_account(&account).unwrap();

                let mut shadow = ShadowAccounts::new();
                shadow.activate_account(&account);
                shadow.sync_from_shared(&shared).unwrap();

                for done in 0..BIDS_PER_THREAD {
                    // Every little bit, ship deltas and re-up
                    if done % 250 == 0 {
                        shadow.sync_to_shared(&shared).unwrap();
                        let _ = shared.set_available(
                            &account,
                            Amount::micro_usd(100_000),
                            RecycleMode::None,
                        );
                        shadow.sync_from_shared(&shared).unwrap();
                    }

                    // Detached ids stay reserved, so every bid gets its own
                    let item = format!("item{done}");
                    if !shadow
                        .authorize_bid(&account, &item, Amount::micro_usd(1))
                        .unwrap()
                    {
                        continue;
                    }

                    // Half commit locally, half hand off to the commit thread
                    if done % 2 == 0 {
                        shadow
                            .commit_bid(
                                &account,
                                &item,
                                Amount::micro_usd(1),
                                &LineItems::new(),
                            )
                            .unwrap();
                        committed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        let amount = shadow.detach_bid(&account, &item).unwrap();
                        detached_total.fetch_add(amount.micros, Ordering::SeqCst);
                        detach_tx.send(amount).unwrap();
                    }
                }

                shadow.sync_shared(&shared).unwrap();
            }));
        }
        drop(detach_tx);

        {
            let shared = shared.clone();
            let strategy = strategy.clone();
            let committed = committed.clone();
            handles.push(thread::spawn(move || {
                let account = strategy.child("commit0").unwrap();
                shared.create_spend_account(&account).unwrap();

                let mut shadow = ShadowAccounts::new();
                shadow.activate_account(&account);
                shadow.sync_from_shared(&shared).unwrap();

                let mut since_sync = 0usize;
                while let Ok(amount) = detach_rx.recv() {
                    shadow
                        .commit_detached_bid(
                            &account,
                            amount,
                            Amount::micro_usd(1),
                            &LineItems::new(),
                        )
                        .unwrap();
                    committed.fetch_add(1, Ordering::SeqCst);
                    since_sync += 1;
                    if since_sync >= 100 {
                        shadow.sync_to_shared(&shared).unwrap();
                        since_sync = 0;
                    }
                }
                shadow.sync_to_shared(&shared).unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        shared.check_invariants().unwrap();

        let summary = shared.get_account_summary(&campaign).unwrap();
        let committed = committed.load(Ordering::SeqCst);
        let detached = detached_total.load(Ordering::SeqCst);

        // Every committed bid paid exactly one micro
        assert_eq!(summary.spent.get(CurrencyCode::USD), committed);

        // Detached reservations stay in flight on the bid accounts
        assert_eq!(summary.in_flight.get(CurrencyCode::USD), detached);

        // Full conservation: what came in as budget either sits available
        // somewhere in the tree, was spent, or is held in flight (the
        // detached micros are double-entered as allocatedIn on the commit
        // account, so they come back out)
        let budget = summary.budget.get(CurrencyCode::USD);
        let available = summary.available.get(CurrencyCode::USD);
        let spent = summary.spent.get(CurrencyCode::USD);
        let in_flight = summary.in_flight.get(CurrencyCode::USD);
        assert_eq!(budget, available + spent + in_flight - detached);
    }
}

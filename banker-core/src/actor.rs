//! Actor-based service layer for the master
//!
//! All master mutations funnel through one task, which makes the master
//! linearizable by construction and keeps lock hold times away from the
//! RPC edge. The actor also owns the snapshot cadence: state is persisted
//! on a timer whenever something changed, and once more on shutdown.
//!
//! # Architecture
//!
//! ```text
//! bidder processes (remote shadows)
//!        │ sync deltas / admin ops
//!        ▼
//! BankerHandle (Clone) ── mpsc::channel (bounded) ──▶ BankerActor
//!                                                        │
//!                                            SharedAccounts (master tree)
//!                                                        │
//!                                            SnapshotStore (JSON on disk)
//! ```

use crate::account::{Account, AccountDelta};
use crate::accounts::{AccountKey, AccountSummary, RecycleMode, SharedAccounts};
use crate::currency::{Amount, CurrencyPool};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::persistence::SnapshotStore;
use crate::shadow::ShadowId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};

/// Message sent to the banker actor
#[derive(Debug)]
pub enum BankerMessage {
    /// Create a budget account
    CreateBudgetAccount {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Create a spend account
    CreateSpendAccount {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Set the net budget at a root key
    SetBudget {
        /// Root account key
        key: AccountKey,
        /// Target net budget
        budget: Amount,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Move funds so `available` hits a target
    SetAvailable {
        /// Account key
        key: AccountKey,
        /// Target available balance
        target: Amount,
        /// How to find funds when the parent is short
        mode: RecycleMode,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Sweep `available` up to the parent
    Recuperate {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<CurrencyPool>>,
    },

    /// Apply a bookkeeping correction
    AddAdjustment {
        /// Account key
        key: AccountKey,
        /// Signed correction amount
        amount: Amount,
        /// Breakdown label
        label: String,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Get one account
    GetAccount {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<Account>>,
    },

    /// Get `available` at one account
    GetAvailable {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<CurrencyPool>>,
    },

    /// Aggregate a subtree
    GetAccountSummary {
        /// Subtree root key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<AccountSummary>>,
    },

    /// Apply a shadow delta (the `syncToMaster` RPC)
    SyncTo {
        /// Shadow identity
        shadow: ShadowId,
        /// Account key
        key: AccountKey,
        /// Field-wise delta since the shadow's snapshot
        delta: AccountDelta,
        /// Last sequence number the shadow saw
        client_seq: u64,
        /// Response channel
        response: oneshot::Sender<Result<(Account, u64)>>,
    },

    /// Fetch master state for a shadow (the `syncFromMaster` RPC)
    SyncFrom {
        /// Account key
        key: AccountKey,
        /// Response channel
        response: oneshot::Sender<Result<Account>>,
    },

    /// Run the full invariant sweep
    CheckInvariants {
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Write a snapshot now
    Snapshot {
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes banker messages
pub struct BankerActor {
    /// Master state behind the coarse lock
    shared: SharedAccounts,

    /// Snapshot store
    store: SnapshotStore,

    /// Metrics collector
    metrics: Metrics,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<BankerMessage>,

    /// Periodic snapshot interval
    snapshot_interval: Duration,

    /// Periodic snapshots enabled
    snapshot_enabled: bool,

    /// State changed since the last snapshot
    dirty: bool,
}

impl BankerActor {
    /// Create new actor
    pub fn new(
        shared: SharedAccounts,
        store: SnapshotStore,
        metrics: Metrics,
        mailbox: mpsc::Receiver<BankerMessage>,
        snapshot_interval: Duration,
        snapshot_enabled: bool,
    ) -> Self {
        Self {
            shared,
            store,
            metrics,
            mailbox,
            snapshot_interval,
            snapshot_enabled,
            dirty: false,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut snapshot_timer = interval(self.snapshot_interval);
        snapshot_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.mailbox.recv() => {
                    match msg {
                        BankerMessage::Shutdown => {
                            if self.dirty {
                                if let Err(e) = self.write_snapshot() {
                                    tracing::error!("Error writing final snapshot: {}", e);
                                }
                            }
                            break;
                        }
                        _ => self.handle_message(msg),
                    }
                }

                _ = snapshot_timer.tick(), if self.snapshot_enabled && self.dirty => {
                    if let Err(e) = self.write_snapshot() {
                        tracing::error!("Error writing snapshot: {}", e);
                    }
                }

                else => {
                    if self.dirty {
                        let _ = self.write_snapshot();
                    }
                    break;
                }
            }
        }
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: BankerMessage) {
        match msg {
            BankerMessage::CreateBudgetAccount { key, response } => {
                let result = self.shared.write().create_budget_account(&key);
                self.after_mutation(&result);
                if result.is_ok() {
                    self.metrics.record_account_created();
                }
                let _ = response.send(result);
            }

            BankerMessage::CreateSpendAccount { key, response } => {
                let result = self.shared.write().create_spend_account(&key);
                self.after_mutation(&result);
                if result.is_ok() {
                    self.metrics.record_account_created();
                }
                let _ = response.send(result);
            }

            BankerMessage::SetBudget { key, budget, response } => {
                let result = self.shared.write().set_budget(&key, budget);
                self.after_mutation(&result);
                let _ = response.send(result);
            }

            BankerMessage::SetAvailable { key, target, mode, response } => {
                let result = self.shared.write().set_available(&key, target, mode);
                self.after_mutation(&result);
                let _ = response.send(result);
            }

            BankerMessage::Recuperate { key, response } => {
                let result = self.shared.write().recuperate(&key);
                self.after_mutation(&result);
                let _ = response.send(result);
            }

            BankerMessage::AddAdjustment { key, amount, label, response } => {
                let result = self.shared.write().add_adjustment(&key, amount, &label);
                self.after_mutation(&result);
                let _ = response.send(result);
            }

            BankerMessage::GetAccount { key, response } => {
                let _ = response.send(self.shared.read().get_account(&key));
            }

            BankerMessage::GetAvailable { key, response } => {
                let _ = response.send(self.shared.read().get_available(&key));
            }

            BankerMessage::GetAccountSummary { key, response } => {
                let _ = response.send(self.shared.read().get_account_summary(&key));
            }

            BankerMessage::SyncTo { shadow, key, delta, client_seq, response } => {
                let started = std::time::Instant::now();
                let result = self
                    .shared
                    .write()
                    .sync_to(shadow, &key, &delta, client_seq);
                match &result {
                    Ok(_) => self.metrics.record_sync(started.elapsed().as_secs_f64()),
                    Err(Error::StaleSync { .. }) => self.metrics.record_stale_sync(),
                    Err(_) => {}
                }
                self.after_mutation(&result);
                let _ = response.send(result);
            }

            BankerMessage::SyncFrom { key, response } => {
                let _ = response.send(self.shared.read().sync_state(&key));
            }

            BankerMessage::CheckInvariants { response } => {
                let result = self.shared.read().check_invariants();
                if result.is_err() {
                    self.metrics.record_invariant_violation();
                }
                let _ = response.send(result);
            }

            BankerMessage::Snapshot { response } => {
                let _ = response.send(self.write_snapshot());
            }

            BankerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn after_mutation<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.dirty = true;
                self.metrics
                    .update_account_count(self.shared.read().len() as i64);
            }
            Err(Error::InvariantViolation { .. }) => {
                self.metrics.record_invariant_violation();
            }
            Err(_) => {}
        }
    }

    fn write_snapshot(&mut self) -> Result<()> {
        self.store.save(&self.shared.read())?;
        self.metrics.record_snapshot();
        self.dirty = false;
        Ok(())
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct BankerHandle {
    sender: mpsc::Sender<BankerMessage>,
}

impl BankerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<BankerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> BankerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Create a budget account
    pub async fn create_budget_account(&self, key: AccountKey) -> Result<()> {
        self.request(|response| BankerMessage::CreateBudgetAccount { key, response })
            .await
    }

    /// Create a spend account
    pub async fn create_spend_account(&self, key: AccountKey) -> Result<()> {
        self.request(|response| BankerMessage::CreateSpendAccount { key, response })
            .await
    }

    /// Set the net budget at a root key
    pub async fn set_budget(&self, key: AccountKey, budget: Amount) -> Result<()> {
        self.request(|response| BankerMessage::SetBudget { key, budget, response })
            .await
    }

    /// Move funds so `available` hits a target
    pub async fn set_available(
        &self,
        key: AccountKey,
        target: Amount,
        mode: RecycleMode,
    ) -> Result<()> {
        self.request(|response| BankerMessage::SetAvailable { key, target, mode, response })
            .await
    }

    /// Sweep `available` up to the parent
    pub async fn recuperate(&self, key: AccountKey) -> Result<CurrencyPool> {
        self.request(|response| BankerMessage::Recuperate { key, response })
            .await
    }

    /// Apply a bookkeeping correction
    pub async fn add_adjustment(
        &self,
        key: AccountKey,
        amount: Amount,
        label: String,
    ) -> Result<()> {
        self.request(|response| BankerMessage::AddAdjustment { key, amount, label, response })
            .await
    }

    /// Get one account
    pub async fn get_account(&self, key: AccountKey) -> Result<Account> {
        self.request(|response| BankerMessage::GetAccount { key, response })
            .await
    }

    /// Get `available` at one account
    pub async fn get_available(&self, key: AccountKey) -> Result<CurrencyPool> {
        self.request(|response| BankerMessage::GetAvailable { key, response })
            .await
    }

    /// Aggregate a subtree
    pub async fn get_account_summary(&self, key: AccountKey) -> Result<AccountSummary> {
        self.request(|response| BankerMessage::GetAccountSummary { key, response })
            .await
    }

    /// Apply a shadow delta (the `syncToMaster` RPC)
    pub async fn sync_to(
        &self,
        shadow: ShadowId,
        key: AccountKey,
        delta: AccountDelta,
        client_seq: u64,
    ) -> Result<(Account, u64)> {
        self.request(|response| BankerMessage::SyncTo {
            shadow,
            key,
            delta,
            client_seq,
            response,
        })
        .await
    }

    /// Fetch master state for a shadow (the `syncFromMaster` RPC)
    pub async fn sync_from(&self, key: AccountKey) -> Result<Account> {
        self.request(|response| BankerMessage::SyncFrom { key, response })
            .await
    }

    /// Run the full invariant sweep
    pub async fn check_invariants(&self) -> Result<()> {
        self.request(|response| BankerMessage::CheckInvariants { response })
            .await
    }

    /// Write a snapshot now
    pub async fn save_snapshot(&self) -> Result<()> {
        self.request(|response| BankerMessage::Snapshot { response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(BankerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the banker actor
pub fn spawn_banker_actor(
    shared: SharedAccounts,
    store: SnapshotStore,
    metrics: Metrics,
    mailbox_depth: usize,
    snapshot_interval: Duration,
    snapshot_enabled: bool,
) -> BankerHandle {
    let (tx, rx) = mpsc::channel(mailbox_depth);
    let actor = BankerActor::new(shared, store, metrics, rx, snapshot_interval, snapshot_enabled);

    tokio::spawn(async move {
        actor.run().await;
    });

    BankerHandle::new(tx)
}

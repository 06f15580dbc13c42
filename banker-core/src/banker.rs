//! Main banker orchestration layer
//!
//! Ties configuration, persistence, metrics and the master actor together
//! into a high-level API for the service surface.
//!
//! # Example
//!
//! ```no_run
//! use banker_core::{Banker, Config};
//!
//! #[tokio::main]
//! async fn main() -> banker_core::Result<()> {
//!     let config = Config::default();
//!     let banker = Banker::open(config).await?;
//!
//!     // let key = "campaign".parse()?;
//!     // banker.create_budget_account(key).await?;
//!
//!     banker.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::account::{Account, AccountDelta};
use crate::accounts::{AccountKey, AccountSummary, RecycleMode, SharedAccounts};
use crate::actor::{spawn_banker_actor, BankerHandle};
use crate::config::Config;
use crate::currency::{Amount, CurrencyPool};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::persistence::SnapshotStore;
use crate::shadow::ShadowId;
use tokio::time::Duration;

/// Main banker interface
pub struct Banker {
    /// Actor handle for async operations
    handle: BankerHandle,

    /// Direct access to the master (for in-process shadows and reads)
    shared: SharedAccounts,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Banker {
    /// Open the banker with configuration
    ///
    /// Loads the latest snapshot when one exists and spawns the master
    /// actor.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SnapshotStore::new(&config);
        let accounts = store.load()?.unwrap_or_default();
        let shared = SharedAccounts::new(accounts);

        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("metrics setup failed: {e}")))?;
        metrics.update_account_count(shared.read().len() as i64);

        let handle = spawn_banker_actor(
            shared.clone(),
            store,
            metrics.clone(),
            config.sync.mailbox_depth,
            Duration::from_millis(config.snapshot.interval_ms),
            config.snapshot.enabled,
        );

        tracing::info!(
            service = %config.service_name,
            accounts = shared.read().len(),
            "banker opened"
        );

        Ok(Self {
            handle,
            shared,
            metrics,
            config,
        })
    }

    /// Clonable handle for the RPC surface
    pub fn handle(&self) -> BankerHandle {
        self.handle.clone()
    }

    /// The master behind its coarse lock, for in-process shadows
    pub fn shared_accounts(&self) -> SharedAccounts {
        self.shared.clone()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a budget account
    pub async fn create_budget_account(&self, key: AccountKey) -> Result<()> {
        self.handle.create_budget_account(key).await
    }

    /// Create a spend account
    pub async fn create_spend_account(&self, key: AccountKey) -> Result<()> {
        self.handle.create_spend_account(key).await
    }

    /// Set the net budget at a root key
    pub async fn set_budget(&self, key: AccountKey, budget: Amount) -> Result<()> {
        self.handle.set_budget(key, budget).await
    }

    /// Move funds so `available` hits a target
    pub async fn set_available(
        &self,
        key: AccountKey,
        target: Amount,
        mode: RecycleMode,
    ) -> Result<()> {
        self.handle.set_available(key, target, mode).await
    }

    /// Sweep `available` up to the parent
    pub async fn recuperate(&self, key: AccountKey) -> Result<CurrencyPool> {
        self.handle.recuperate(key).await
    }

    /// Apply a bookkeeping correction
    pub async fn add_adjustment(
        &self,
        key: AccountKey,
        amount: Amount,
        label: String,
    ) -> Result<()> {
        self.handle.add_adjustment(key, amount, label).await
    }

    /// Get one account
    pub async fn get_account(&self, key: AccountKey) -> Result<Account> {
        self.handle.get_account(key).await
    }

    /// Get `available` at one account
    pub async fn get_available(&self, key: AccountKey) -> Result<CurrencyPool> {
        self.handle.get_available(key).await
    }

    /// Aggregate a subtree
    pub async fn get_account_summary(&self, key: AccountKey) -> Result<AccountSummary> {
        self.handle.get_account_summary(key).await
    }

    /// Apply a shadow delta (the `syncToMaster` RPC)
    pub async fn sync_to(
        &self,
        shadow: ShadowId,
        key: AccountKey,
        delta: AccountDelta,
        client_seq: u64,
    ) -> Result<(Account, u64)> {
        self.handle.sync_to(shadow, key, delta, client_seq).await
    }

    /// Fetch master state for a shadow (the `syncFromMaster` RPC)
    pub async fn sync_from(&self, key: AccountKey) -> Result<Account> {
        self.handle.sync_from(key).await
    }

    /// Run the full invariant sweep
    pub async fn check_invariants(&self) -> Result<()> {
        self.handle.check_invariants().await
    }

    /// Write a snapshot now
    pub async fn save_snapshot(&self) -> Result<()> {
        self.handle.save_snapshot().await
    }

    /// Shutdown, writing a final snapshot when state changed
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}

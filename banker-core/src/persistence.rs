//! JSON snapshot persistence for the master state
//!
//! The backing store is deliberately simple: one JSON document holding
//! every account in the wire form plus the per-shadow sequence map. Writes
//! go to a temporary file first and rename into place, so a crash never
//! leaves a torn snapshot behind.

use crate::account::Account;
use crate::accounts::{AccountKey, Accounts};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::shadow::ShadowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Snapshot schema metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Object type tag
    #[serde(rename = "objectType")]
    pub object_type: String,
    /// Schema version
    pub version: u32,
}

impl Default for SnapshotMetadata {
    fn default() -> Self {
        Self {
            object_type: "Accounts".to_string(),
            version: 1,
        }
    }
}

/// On-disk form of the whole master state
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterSnapshot {
    /// Schema metadata
    #[serde(default)]
    pub md: SnapshotMetadata,
    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
    /// Every account in the wire form, keyed by the textual key
    pub accounts: BTreeMap<AccountKey, Account>,
    /// Per-shadow sequence numbers
    #[serde(default)]
    pub shadow_seq: HashMap<ShadowId, u64>,
}

impl MasterSnapshot {
    /// Capture the current master state
    pub fn capture(accounts: &Accounts) -> Self {
        Self {
            md: SnapshotMetadata::default(),
            saved_at: Utc::now(),
            accounts: accounts.accounts.clone(),
            shadow_seq: accounts.shadow_seq.clone(),
        }
    }

    /// Rebuild a master from the snapshot, verifying invariants
    pub fn restore(self) -> Result<Accounts> {
        if self.md.object_type != "Accounts" {
            return Err(Error::Config(format!(
                "snapshot has wrong object type: {}",
                self.md.object_type
            )));
        }
        let accounts = Accounts {
            accounts: self.accounts,
            shadow_seq: self.shadow_seq,
        };
        accounts.check_invariants()?;
        Ok(accounts)
    }
}

/// File-backed snapshot store
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store rooted at the configured data directory
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.data_dir.join(&config.snapshot.file_name),
        }
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Write a snapshot atomically
    pub fn save(&self, accounts: &Accounts) -> Result<()> {
        let snapshot = MasterSnapshot::capture(accounts);
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), accounts = snapshot.accounts.len(), "wrote snapshot");
        Ok(())
    }

    /// Load the latest snapshot, `None` when the file does not exist
    pub fn load(&self) -> Result<Option<Accounts>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: MasterSnapshot = serde_json::from_slice(&bytes)?;
        let accounts = snapshot.restore()?;
        tracing::info!(
            path = %self.path.display(),
            accounts = accounts.len(),
            "loaded snapshot"
        );
        Ok(Some(accounts))
    }
}

/// Serialize one account to its JSON wire form
pub fn account_to_json(account: &Account) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(account)?)
}

/// Parse one account from its JSON wire form, verifying invariants
pub fn account_from_json(value: serde_json::Value) -> Result<Account> {
    let account: Account = serde_json::from_value(value)?;
    account.check_invariants()?;
    Ok(account)
}

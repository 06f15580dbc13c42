//! Hierarchical budget banker for real-time bidding
//!
//! Tracks monetary authorization and spend across a tree of budget
//! accounts, and lets many bidder processes authorize bids at wire speed
//! without contending on the central ledger.
//!
//! # Architecture
//!
//! - **Master tree**: a flat map from [`AccountKey`] to [`Account`],
//!   guarded by one coarse lock and fronted by a single-writer actor
//! - **Shadows**: per-bidder mirrors that authorize and settle bids
//!   locally, then reconcile with the master through field-wise deltas
//! - **Exact money**: integer micro-unit amounts, no floating point
//!
//! # Invariants
//!
//! - Per account: money in equals money out plus `available`, exactly
//! - Globally: money is conserved across the master and every shadow
//! - Sync deltas apply at most once, fenced by per-shadow sequence numbers

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod account;
pub mod accounts;
pub mod actor;
pub mod banker;
pub mod config;
pub mod currency;
pub mod error;
pub mod lineitems;
pub mod metrics;
pub mod persistence;
pub mod shadow;

// Re-exports
pub use account::{Account, AccountDelta, AccountType};
pub use accounts::{AccountKey, AccountSummary, Accounts, RecycleMode, SharedAccounts};
pub use banker::Banker;
pub use config::Config;
pub use currency::{Amount, CurrencyCode, CurrencyPool};
pub use error::{Error, Result};
pub use lineitems::LineItems;
pub use shadow::{BidState, ShadowAccount, ShadowAccounts, ShadowId};

//! Error types for the banker

use crate::account::AccountType;
use crate::accounts::AccountKey;
use crate::currency::{Amount, CurrencyCode};
use crate::shadow::BidState;
use thiserror::Error;

/// Result type for banker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Banker errors
#[derive(Error, Debug)]
pub enum Error {
    /// Per-account balance invariant broken (bug-equivalent)
    #[error("invariant violation on account '{account}', field '{field}': {detail}")]
    InvariantViolation {
        /// Key of the offending account (empty when raised outside the tree)
        account: String,
        /// Balance field that failed the check
        field: &'static str,
        /// Full state dump of the offending account
        detail: String,
    },

    /// Normal rejection: the operation would drive `available` negative
    #[error("insufficient funds on '{key}': requested {requested}, available {available}")]
    InsufficientFunds {
        /// Amount the caller asked to move
        requested: Amount,
        /// Amount actually available
        available: Amount,
        /// Key of the account that lacked funds
        key: String,
    },

    /// Budget target below the floor imposed by funds already allocated out
    #[error("budget below allocated floor on '{key}': requested {requested}, floor {floor}")]
    BudgetExceedsAvailable {
        /// Requested net budget
        requested: Amount,
        /// Lowest net budget reachable without going negative
        floor: Amount,
        /// Key of the budget account
        key: String,
    },

    /// Account creation hit an existing account of a conflicting type
    #[error("account already exists: '{key}' with type {existing_type:?}")]
    AccountExists {
        /// Key of the existing account
        key: AccountKey,
        /// Type of the existing account
        existing_type: AccountType,
    },

    /// No account at the given key
    #[error("account missing: '{key}'")]
    AccountMissing {
        /// The missing key
        key: AccountKey,
    },

    /// Account exists but has the wrong type for the operation
    #[error("type mismatch on '{key}': expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// Key of the account
        key: AccountKey,
        /// Type the operation requires
        expected: AccountType,
        /// Type actually found
        actual: AccountType,
    },

    /// Malformed account key
    #[error("invalid account key: {0}")]
    InvalidKey(String),

    /// Bid id already active in this shadow
    #[error("duplicate bid: {bid_id}")]
    DuplicateBid {
        /// The offending bid id
        bid_id: String,
    },

    /// Bid id not present in this shadow
    #[error("unknown bid: {bid_id}")]
    UnknownBid {
        /// The missing bid id
        bid_id: String,
    },

    /// Bid is not in the state the operation requires
    #[error("wrong state {state:?} for bid {bid_id}")]
    WrongBidState {
        /// The offending bid id
        bid_id: String,
        /// State the bid was actually in
        state: BidState,
    },

    /// Commit amount larger than the authorized reservation
    #[error("commit of {paid} exceeds authorization {authorized} for bid {bid_id}")]
    CommitExceedsAuthorization {
        /// The offending bid id (or "(detached)" for handed-off bids)
        bid_id: String,
        /// Amount originally authorized
        authorized: Amount,
        /// Amount the caller tried to commit
        paid: Amount,
    },

    /// Out-of-order sync application, retry-correctable
    #[error("stale sync: master seq {master_seq}, client seq {client_seq}")]
    StaleSync {
        /// Sequence number the master holds for this shadow
        master_seq: u64,
        /// Sequence number the client presented
        client_seq: u64,
    },

    /// Arithmetic across two different currencies
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand
        left: CurrencyCode,
        /// Currency of the right operand
        right: CurrencyCode,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attach an account key to an error raised inside a key-less
    /// `Account` operation.
    pub(crate) fn for_account(self, key: &AccountKey) -> Error {
        match self {
            Error::InsufficientFunds {
                requested,
                available,
                key: k,
            } if k.is_empty() => Error::InsufficientFunds {
                requested,
                available,
                key: key.to_string(),
            },
            Error::BudgetExceedsAvailable {
                requested,
                floor,
                key: k,
            } if k.is_empty() => Error::BudgetExceedsAvailable {
                requested,
                floor,
                key: key.to_string(),
            },
            Error::InvariantViolation {
                account,
                field,
                detail,
            } if account.is_empty() => Error::InvariantViolation {
                account: key.to_string(),
                field,
                detail,
            },
            other => other,
        }
    }
}

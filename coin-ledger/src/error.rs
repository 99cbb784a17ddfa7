//! Error types for the ledger

use crate::types::{AccountId, Coins};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Debit rejected; nothing was mutated
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Coins the operation needed
        required: Coins,
        /// Balance observed at decision time
        available: Coins,
    },

    /// Account does not exist; provision it with `ensure_account`
    #[error("Account not found: {0}")]
    NotFound(AccountId),

    /// The metered external work failed
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Storage transiently unreachable or unusable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Amount violates an operation precondition
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed request (empty identifiers, unknown bundle, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Payment confirmation failed authenticity checks
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Business-level outcomes that are safe to show to the account holder
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Error::InsufficientBalance { .. }
                | Error::NotFound(_)
                | Error::UpstreamFailure(_)
                | Error::Unavailable(_)
        )
    }

    /// Short machine-readable kind, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::NotFound(_) => "not_found",
            Error::UpstreamFailure(_) => "upstream_failure",
            Error::Unavailable(_) => "unavailable",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidSignature(_) => "invalid_signature",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

#[cfg(feature = "rocksdb-store")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Unavailable(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Unavailable(format!("corrupt record: {}", err))
    }
}

//! Balance store
//!
//! The store is the only component allowed to mutate `Account.balance`.
//! Every mutation is a single atomic conditional update inside the
//! backend; callers never read-modify-write a balance themselves.
//!
//! # Backends
//!
//! - [`MemoryStore`] - sharded in-process map, one critical section per mutation
//! - [`RocksStore`] - RocksDB optimistic transactions with a conflict-retry loop

use crate::error::{Error, Result};
use crate::types::{Account, AccountId, Coins, CreditEvent, CreditOutcome, UsageRecord};
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "rocksdb-store")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksStore;

/// Attempts at drawing a fresh account code before giving up
pub(crate) const MAX_CODE_ATTEMPTS: usize = 16;

/// Durable home of accounts, usage records and applied credit events
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Create the account with a zero balance if absent; otherwise return it unchanged
    async fn ensure_account(&self, account_id: &AccountId) -> Result<Account>;

    /// Full account record
    async fn get_account(&self, account_id: &AccountId) -> Result<Account>;

    /// Current balance
    async fn get_balance(&self, account_id: &AccountId) -> Result<Coins> {
        Ok(self.get_account(account_id).await?.balance)
    }

    /// Look an account up by its shareable code
    async fn find_by_code(&self, code: &str) -> Result<Account>;

    /// Atomically debit `amount` if the balance covers it.
    ///
    /// Returns the new balance, or `InsufficientBalance` with nothing mutated.
    async fn try_debit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins>;

    /// Atomically credit `amount`, returning the new balance
    async fn credit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins>;

    /// Record `event.external_event_id` and credit the account as one unit.
    ///
    /// A key that was already recorded yields `AlreadyApplied` and leaves
    /// the balance untouched.
    async fn apply_credit_event(&self, event: &CreditEvent) -> Result<CreditOutcome>;

    /// Look up an applied credit event
    async fn get_credit_event(&self, external_event_id: &str) -> Result<Option<CreditEvent>>;

    /// Persist a usage record
    async fn insert_usage(&self, record: &UsageRecord) -> Result<()>;

    /// Usage records of one account, newest first
    async fn list_usage(&self, account_id: &AccountId) -> Result<Vec<UsageRecord>>;

    /// Delete one of the account's usage records. Returns false if it did not exist.
    async fn delete_usage(&self, account_id: &AccountId, record_id: Uuid) -> Result<bool>;
}

/// Reject zero amounts before touching storage
pub(crate) fn require_positive(amount: Coins) -> Result<()> {
    if amount == 0 {
        return Err(Error::InvalidAmount("Amount must be positive".to_string()));
    }
    Ok(())
}

/// Reject empty account identifiers before touching storage
pub(crate) fn require_account_id(account_id: &AccountId) -> Result<()> {
    if account_id.is_empty() {
        return Err(Error::InvalidRequest("Account id must not be empty".to_string()));
    }
    Ok(())
}

/// Overflow-checked credit arithmetic
pub(crate) fn checked_credit(balance: Coins, amount: Coins) -> Result<Coins> {
    balance
        .checked_add(amount)
        .ok_or_else(|| Error::InvalidAmount(format!("Credit of {} overflows balance", amount)))
}

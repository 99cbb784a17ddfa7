//! Durable balance store using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Account records (key: account_id)
//! - `codes` - Shareable code index (key: code, value: account_id)
//! - `credit_events` - Applied payment confirmations (key: external_event_id)
//! - `usage` - Usage records (key: len(account_id) || account_id || record_id)
//!
//! Conditional updates run in optimistic transactions. Keys are read with
//! `get_for_update`, so a concurrent commit to the same key makes ours fail
//! with `Busy`; the update is then retried from a fresh read and its
//! condition is validated again. Nothing is written when a condition fails.

use super::{checked_credit, require_account_id, require_positive, BalanceStore, MAX_CODE_ATTEMPTS};
use crate::error::{Error, Result};
use crate::types::{
    generate_account_code, normalize_code, Account, AccountId, Coins, CreditEvent, CreditOutcome,
    UsageRecord,
};
use crate::Config;
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_CODES: &str = "codes";
const CF_CREDIT_EVENTS: &str = "credit_events";
const CF_USAGE: &str = "usage";

/// RocksDB-backed store
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("max_conflict_retries", &self.inner.max_conflict_retries)
            .finish()
    }
}

struct Inner {
    db: OptimisticTransactionDB,
    max_conflict_retries: u32,
}

/// Outcome of one optimistic attempt
enum Attempt<T> {
    Done(T),
    Conflict,
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_CODES, Self::cf_options_hot()),
            ColumnFamilyDescriptor::new(CF_CREDIT_EVENTS, Self::cf_options_cold()),
            ColumnFamilyDescriptor::new(CF_USAGE, Self::cf_options_cold()),
        ];

        let db: OptimisticTransactionDB =
            OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB balance store");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                max_conflict_retries: config.rocksdb.max_conflict_retries.max(1),
            }),
        })
    }

    // Balances and indices are read on every request, keep them fast
    fn cf_options_hot() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_cold() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts
    }

    /// Run a storage closure on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| Error::Unavailable(format!("Storage task failed: {}", e)))?
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Unavailable(format!("Column family {} not found", name)))
    }

    /// Repeat an optimistic transaction until it commits without conflict
    fn with_retries<T>(
        &self,
        operation: &str,
        mut attempt: impl FnMut() -> Result<Attempt<T>>,
    ) -> Result<T> {
        for n in 1..=self.max_conflict_retries {
            match attempt()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Conflict => {
                    tracing::debug!(operation, attempt = n, "Write conflict, retrying");
                }
            }
        }
        Err(Error::Unavailable(format!(
            "{} gave up after {} conflicting attempts",
            operation, self.max_conflict_retries
        )))
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        let raw = self
            .db
            .get_cf(self.cf(CF_ACCOUNTS)?, account_id.as_str().as_bytes())?
            .ok_or_else(|| Error::NotFound(account_id.clone()))?;
        Ok(bincode::deserialize(&raw)?)
    }

    fn ensure_account(&self, account_id: &AccountId) -> Result<Account> {
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        let cf_codes = self.cf(CF_CODES)?;
        let key = account_id.as_str().as_bytes();

        self.with_retries("ensure_account", || {
            let txn = self.db.transaction();

            if let Some(raw) = txn.get_for_update_cf(cf_accounts, key, true)? {
                return Ok(Attempt::Done(bincode::deserialize::<Account>(&raw)?));
            }

            let mut claimed = None;
            for _ in 0..MAX_CODE_ATTEMPTS {
                let code = generate_account_code();
                if txn.get_for_update_cf(cf_codes, code.as_bytes(), true)?.is_none() {
                    claimed = Some(code);
                    break;
                }
            }
            let code = claimed.ok_or_else(|| {
                Error::Unavailable("Could not allocate a unique account code".to_string())
            })?;

            let account = Account::new(account_id.clone(), code);
            txn.put_cf(cf_codes, account.unique_code.as_bytes(), key)?;
            txn.put_cf(cf_accounts, key, bincode::serialize(&account)?)?;

            match txn.commit() {
                Ok(()) => {
                    tracing::info!(
                        account_id = %account.id,
                        unique_code = %account.unique_code,
                        "Account created"
                    );
                    Ok(Attempt::Done(account))
                }
                Err(e) if is_conflict(&e) => Ok(Attempt::Conflict),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Conditional read-validate-write of one account
    fn update_balance(
        &self,
        operation: &str,
        account_id: &AccountId,
        apply: impl Fn(Coins) -> Result<Coins>,
    ) -> Result<Coins> {
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        let key = account_id.as_str().as_bytes();

        self.with_retries(operation, || {
            let txn = self.db.transaction();
            let raw = txn
                .get_for_update_cf(cf_accounts, key, true)?
                .ok_or_else(|| Error::NotFound(account_id.clone()))?;
            let mut account: Account = bincode::deserialize(&raw)?;

            // A failed condition drops the transaction uncommitted
            account.balance = apply(account.balance)?;
            account.updated_at = Utc::now();
            txn.put_cf(cf_accounts, key, bincode::serialize(&account)?)?;

            match txn.commit() {
                Ok(()) => Ok(Attempt::Done(account.balance)),
                Err(e) if is_conflict(&e) => Ok(Attempt::Conflict),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn apply_credit_event(&self, event: &CreditEvent) -> Result<CreditOutcome> {
        let cf_accounts = self.cf(CF_ACCOUNTS)?;
        let cf_events = self.cf(CF_CREDIT_EVENTS)?;
        let event_key = event.external_event_id.as_bytes();
        let account_key = event.account_id.as_str().as_bytes();

        self.with_retries("apply_credit_event", || {
            let txn = self.db.transaction();

            if txn.get_for_update_cf(cf_events, event_key, true)?.is_some() {
                return Ok(Attempt::Done(CreditOutcome::AlreadyApplied));
            }

            let raw = txn
                .get_for_update_cf(cf_accounts, account_key, true)?
                .ok_or_else(|| Error::NotFound(event.account_id.clone()))?;
            let mut account: Account = bincode::deserialize(&raw)?;
            account.balance = checked_credit(account.balance, event.amount)?;
            account.updated_at = Utc::now();

            txn.put_cf(cf_events, event_key, bincode::serialize(event)?)?;
            txn.put_cf(cf_accounts, account_key, bincode::serialize(&account)?)?;

            match txn.commit() {
                Ok(()) => Ok(Attempt::Done(CreditOutcome::Applied {
                    new_balance: account.balance,
                })),
                Err(e) if is_conflict(&e) => Ok(Attempt::Conflict),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list_usage(&self, account_id: &AccountId) -> Result<Vec<UsageRecord>> {
        let cf = self.cf(CF_USAGE)?;
        let prefix = usage_prefix(account_id);

        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix[..]) {
                break;
            }
            records.push(bincode::deserialize::<UsageRecord>(&value)?);
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    fn delete_usage(&self, account_id: &AccountId, record_id: Uuid) -> Result<bool> {
        let cf = self.cf(CF_USAGE)?;
        let key = usage_key(account_id, record_id);

        if self.db.get_cf(cf, &key)?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, &key)?;
        Ok(true)
    }
}

fn is_conflict(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

// Length-prefixed so one account id can never be a prefix of another
fn usage_prefix(account_id: &AccountId) -> Vec<u8> {
    let id = account_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + id.len() + 16);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id);
    key
}

fn usage_key(account_id: &AccountId, record_id: Uuid) -> Vec<u8> {
    let mut key = usage_prefix(account_id);
    key.extend_from_slice(record_id.as_bytes());
    key
}

#[async_trait]
impl BalanceStore for RocksStore {
    async fn ensure_account(&self, account_id: &AccountId) -> Result<Account> {
        require_account_id(account_id)?;
        let account_id = account_id.clone();
        self.blocking(move |inner| inner.ensure_account(&account_id))
            .await
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        let account_id = account_id.clone();
        self.blocking(move |inner| inner.get_account(&account_id)).await
    }

    async fn find_by_code(&self, code: &str) -> Result<Account> {
        let code = normalize_code(code);
        self.blocking(move |inner| {
            let raw = inner
                .db
                .get_cf(inner.cf(CF_CODES)?, code.as_bytes())?
                .ok_or_else(|| Error::NotFound(AccountId::new(format!("code:{}", code))))?;
            let account_id = AccountId::new(String::from_utf8_lossy(&raw).into_owned());
            inner.get_account(&account_id)
        })
        .await
    }

    async fn try_debit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins> {
        require_positive(amount)?;
        let account_id = account_id.clone();
        self.blocking(move |inner| {
            inner.update_balance("try_debit", &account_id, |balance| {
                if balance < amount {
                    return Err(Error::InsufficientBalance {
                        required: amount,
                        available: balance,
                    });
                }
                Ok(balance - amount)
            })
        })
        .await
    }

    async fn credit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins> {
        require_positive(amount)?;
        let account_id = account_id.clone();
        self.blocking(move |inner| {
            inner.update_balance("credit", &account_id, |balance| checked_credit(balance, amount))
        })
        .await
    }

    async fn apply_credit_event(&self, event: &CreditEvent) -> Result<CreditOutcome> {
        require_positive(event.amount)?;
        let event = event.clone();
        self.blocking(move |inner| inner.apply_credit_event(&event)).await
    }

    async fn get_credit_event(&self, external_event_id: &str) -> Result<Option<CreditEvent>> {
        let key = external_event_id.to_string();
        self.blocking(move |inner| {
            match inner.db.get_cf(inner.cf(CF_CREDIT_EVENTS)?, key.as_bytes())? {
                Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |inner| {
            let key = usage_key(&record.account_id, record.id);
            inner
                .db
                .put_cf(inner.cf(CF_USAGE)?, key, bincode::serialize(&record)?)?;
            Ok(())
        })
        .await
    }

    async fn list_usage(&self, account_id: &AccountId) -> Result<Vec<UsageRecord>> {
        let account_id = account_id.clone();
        self.blocking(move |inner| inner.list_usage(&account_id)).await
    }

    async fn delete_usage(&self, account_id: &AccountId, record_id: Uuid) -> Result<bool> {
        let account_id = account_id.clone();
        self.blocking(move |inner| inner.delete_usage(&account_id, record_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    fn open_store() -> (Arc<dyn BalanceStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Arc::new(RocksStore::open(&config).unwrap()), temp_dir)
    }

    #[tokio::test]
    async fn test_debit_boundary() {
        let (store, _temp) = open_store();
        conformance::debit_boundary(store).await;
    }

    #[tokio::test]
    async fn test_zero_amounts_rejected() {
        let (store, _temp) = open_store();
        conformance::zero_amounts_rejected(store).await;
    }

    #[tokio::test]
    async fn test_missing_account() {
        let (store, _temp) = open_store();
        conformance::missing_account(store).await;
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (store, _temp) = open_store();
        conformance::ensure_is_idempotent(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_converges() {
        let (store, _temp) = open_store();
        conformance::concurrent_ensure_converges(store).await;
    }

    #[tokio::test]
    async fn test_credit_event_replay() {
        let (store, _temp) = open_store();
        conformance::credit_event_replay(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_credit_event_replays() {
        let (store, _temp) = open_store();
        conformance::concurrent_credit_event_replays(store).await;
    }

    #[tokio::test]
    async fn test_usage_records() {
        let (store, _temp) = open_store();
        conformance::usage_records(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_full_balance_debits() {
        let (store, _temp) = open_store();
        conformance::concurrent_full_balance_debits(store).await;
    }

    #[tokio::test]
    async fn test_balances_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let id = AccountId::new("durable");

        {
            let store = RocksStore::open(&config).unwrap();
            store.ensure_account(&id).await.unwrap();
            store.credit(&id, 25).await.unwrap();
            store
                .apply_credit_event(&CreditEvent::new("evt-durable", id.clone(), 5))
                .await
                .unwrap();
        }

        let store = RocksStore::open(&config).unwrap();
        assert_eq!(store.get_balance(&id).await.unwrap(), 30);
        let replay = store
            .apply_credit_event(&CreditEvent::new("evt-durable", id.clone(), 5))
            .await
            .unwrap();
        assert_eq!(replay, CreditOutcome::AlreadyApplied);
    }

    #[test]
    fn test_usage_prefix_is_unambiguous() {
        let short = usage_prefix(&AccountId::new("ab"));
        let long = usage_prefix(&AccountId::new("abc"));
        assert!(!long.starts_with(&short));
    }
}

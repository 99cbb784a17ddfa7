//! In-process balance store
//!
//! Backed by sharded concurrent maps. Each balance mutation runs inside the
//! shard lock of the account entry, so the check and the update are one
//! critical section. No lock is held across an `.await`.
//!
//! Lock order is `credit_events -> accounts -> codes`; nothing acquires
//! them in the opposite direction.

use super::{checked_credit, require_account_id, require_positive, BalanceStore, MAX_CODE_ATTEMPTS};
use crate::error::{Error, Result};
use crate::types::{
    generate_account_code, normalize_code, Account, AccountId, Coins, CreditEvent, CreditOutcome,
    UsageRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Account>,
    codes: DashMap<String, AccountId>,
    credit_events: DashMap<String, CreditEvent>,
    usage: DashMap<AccountId, BTreeMap<Uuid, UsageRecord>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a code nobody else holds
    fn claim_code(&self, account_id: &AccountId) -> Result<String> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_account_code();
            if let Entry::Vacant(slot) = self.codes.entry(code.clone()) {
                slot.insert(account_id.clone());
                return Ok(code);
            }
        }
        Err(Error::Unavailable(
            "Could not allocate a unique account code".to_string(),
        ))
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn ensure_account(&self, account_id: &AccountId) -> Result<Account> {
        require_account_id(account_id)?;

        if let Some(existing) = self.accounts.get(account_id) {
            return Ok(existing.clone());
        }

        match self.accounts.entry(account_id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let code = self.claim_code(account_id)?;
                let account = Account::new(account_id.clone(), code);
                slot.insert(account.clone());

                tracing::info!(
                    account_id = %account.id,
                    unique_code = %account.unique_code,
                    "Account created"
                );
                Ok(account)
            }
        }
    }

    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        self.accounts
            .get(account_id)
            .map(|account| account.clone())
            .ok_or_else(|| Error::NotFound(account_id.clone()))
    }

    async fn find_by_code(&self, code: &str) -> Result<Account> {
        let code = normalize_code(code);
        let account_id = self
            .codes
            .get(&code)
            .map(|id| id.clone())
            .ok_or_else(|| Error::NotFound(AccountId::new(format!("code:{}", code))))?;
        self.get_account(&account_id).await
    }

    async fn try_debit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins> {
        require_positive(amount)?;

        let mut account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.clone()))?;

        if account.balance < amount {
            return Err(Error::InsufficientBalance {
                required: amount,
                available: account.balance,
            });
        }

        account.balance -= amount;
        account.updated_at = Utc::now();
        Ok(account.balance)
    }

    async fn credit(&self, account_id: &AccountId, amount: Coins) -> Result<Coins> {
        require_positive(amount)?;

        let mut account = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| Error::NotFound(account_id.clone()))?;

        account.balance = checked_credit(account.balance, amount)?;
        account.updated_at = Utc::now();
        Ok(account.balance)
    }

    async fn apply_credit_event(&self, event: &CreditEvent) -> Result<CreditOutcome> {
        require_positive(event.amount)?;

        // The vacant entry keeps the key's shard locked until the credit lands,
        // so concurrent replays wait and then observe the recorded key.
        match self.credit_events.entry(event.external_event_id.clone()) {
            Entry::Occupied(_) => Ok(CreditOutcome::AlreadyApplied),
            Entry::Vacant(slot) => {
                let mut account = self
                    .accounts
                    .get_mut(&event.account_id)
                    .ok_or_else(|| Error::NotFound(event.account_id.clone()))?;

                account.balance = checked_credit(account.balance, event.amount)?;
                account.updated_at = Utc::now();
                let new_balance = account.balance;
                drop(account);

                slot.insert(event.clone());
                Ok(CreditOutcome::Applied { new_balance })
            }
        }
    }

    async fn get_credit_event(&self, external_event_id: &str) -> Result<Option<CreditEvent>> {
        Ok(self
            .credit_events
            .get(external_event_id)
            .map(|event| event.clone()))
    }

    async fn insert_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage
            .entry(record.account_id.clone())
            .or_default()
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn list_usage(&self, account_id: &AccountId) -> Result<Vec<UsageRecord>> {
        let mut records: Vec<UsageRecord> = self
            .usage
            .get(account_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn delete_usage(&self, account_id: &AccountId, record_id: Uuid) -> Result<bool> {
        Ok(self
            .usage
            .get_mut(account_id)
            .map(|mut records| records.remove(&record_id).is_some())
            .unwrap_or(false))
    }
}

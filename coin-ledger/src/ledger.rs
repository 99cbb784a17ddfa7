//! Main ledger orchestration layer
//!
//! Ties the balance store, the metered gate and the credit intake together
//! behind one handle built from [`Config`].
//!
//! # Example
//!
//! ```no_run
//! use coin_ledger::{AccountId, Config, Ledger, UsageKind};
//!
//! #[tokio::main]
//! async fn main() -> coin_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!     let account = ledger.ensure_account(&AccountId::new("user-1")).await?;
//!
//!     let quote = ledger.rates().quote_tokens(1_200)?;
//!     let charged = ledger
//!         .gate()
//!         .charge_upfront(&account.id, UsageKind::Transcription, quote, || async {
//!             Ok("transcript")
//!         })
//!         .await?;
//!     println!("balance now {}", charged.new_balance);
//!     Ok(())
//! }
//! ```

use crate::config::{Config, StorageBackend};
use crate::error::{Error, Result};
use crate::gate::MeteredGate;
use crate::intake::{CreditIntake, IgnoredReason, PaymentOutcome};
use crate::metrics::Metrics;
use crate::pricing::RateTable;
use crate::store::{require_positive, BalanceStore, MemoryStore};
use crate::types::{Account, AccountId, Coins, UsageRecord};
use crate::webhook::{PaymentConfirmation, SignatureVerifier, WebhookNotification};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Main ledger interface
pub struct Ledger {
    /// Balance store shared by every component
    store: Arc<dyn BalanceStore>,

    /// Metered operation gate
    gate: MeteredGate,

    /// External credit intake
    intake: CreditIntake,

    /// Published rates
    rates: RateTable,

    /// Webhook verifier, if a secret is configured
    verifier: Option<SignatureVerifier>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("backend", &self.config.backend)
            .field("rates", &self.rates)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let store: Arc<dyn BalanceStore> = match config.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "rocksdb-store")]
            StorageBackend::RocksDb => Arc::new(crate::store::RocksStore::open(&config)?),
            #[cfg(not(feature = "rocksdb-store"))]
            StorageBackend::RocksDb => {
                return Err(Error::Config(
                    "Built without the rocksdb-store feature".to_string(),
                ))
            }
        };

        info!(
            service = %config.service_name,
            backend = ?config.backend,
            "Ledger opened"
        );
        Self::with_store(store, config)
    }

    /// Build a ledger over an existing store
    pub fn with_store(store: Arc<dyn BalanceStore>, config: Config) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let verifier = match config.webhook.secret.as_deref() {
            Some(secret) => Some(SignatureVerifier::new(secret)?),
            None => None,
        };

        Ok(Self {
            gate: MeteredGate::new(store.clone(), metrics.clone()),
            intake: CreditIntake::new(store.clone(), metrics.clone()),
            rates: RateTable::from_config(&config.pricing),
            store,
            verifier,
            metrics,
            config,
        })
    }

    /// Create the account on first contact; idempotent
    pub async fn ensure_account(&self, account_id: &AccountId) -> Result<Account> {
        self.store.ensure_account(account_id).await
    }

    /// Account record
    pub async fn account(&self, account_id: &AccountId) -> Result<Account> {
        self.store.get_account(account_id).await
    }

    /// Current balance
    pub async fn balance(&self, account_id: &AccountId) -> Result<Coins> {
        self.store.get_balance(account_id).await
    }

    /// Operator gift: credit the account holding `code`.
    ///
    /// Returns the account with its balance after the credit.
    pub async fn gift(&self, code: &str, amount: Coins) -> Result<Account> {
        require_positive(amount)?;
        let mut account = self.store.find_by_code(code).await?;
        account.balance = self.store.credit(&account.id, amount).await?;
        self.metrics.record_credit();

        info!(
            account_id = %account.id,
            unique_code = %account.unique_code,
            amount,
            new_balance = account.balance,
            "Coins gifted"
        );
        Ok(account)
    }

    /// Usage history, newest first
    pub async fn usage(&self, account_id: &AccountId) -> Result<Vec<UsageRecord>> {
        self.store.list_usage(account_id).await
    }

    /// Delete one of the account's usage records
    pub async fn delete_usage(&self, account_id: &AccountId, record_id: Uuid) -> Result<bool> {
        let deleted = self.store.delete_usage(account_id, record_id).await?;
        if deleted {
            info!(account_id = %account_id, record_id = %record_id, "Usage record deleted");
        }
        Ok(deleted)
    }

    /// Authenticate a payment notification and credit the purchase.
    ///
    /// `fetch_payment` retrieves the payment from the provider by id; the
    /// notification body itself is never trusted for amounts or status.
    pub async fn handle_payment_notification<F, Fut>(
        &self,
        body: &[u8],
        signature_header: Option<&str>,
        request_id: Option<&str>,
        fetch_payment: F,
    ) -> Result<PaymentOutcome>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = anyhow::Result<PaymentConfirmation>>,
    {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| Error::Config("Webhook secret is not configured".to_string()))?;

        let notification = WebhookNotification::from_json(body)?;
        let Some(payment_id) = notification.payment_id() else {
            return Ok(PaymentOutcome::Ignored(IgnoredReason::NotPayment));
        };

        verifier.verify(signature_header, &payment_id, request_id)?;

        if !notification.is_payment() {
            return Ok(PaymentOutcome::Ignored(IgnoredReason::NotPayment));
        }

        let payment = fetch_payment(payment_id.clone())
            .await
            .map_err(|e| Error::UpstreamFailure(format!("{:#}", e)))?;

        if payment.id != payment_id {
            warn!(
                notified = %payment_id,
                fetched = %payment.id,
                "Fetched payment does not match notification"
            );
            return Err(Error::InvalidRequest(format!(
                "Fetched payment {} does not match notification {}",
                payment.id, payment_id
            )));
        }

        self.intake.apply_payment(&payment).await
    }

    /// Metered operation gate
    pub fn gate(&self) -> &MeteredGate {
        &self.gate
    }

    /// External credit intake
    pub fn intake(&self) -> &CreditIntake {
        &self.intake
    }

    /// Published rates
    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn BalanceStore> {
        &self.store
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}

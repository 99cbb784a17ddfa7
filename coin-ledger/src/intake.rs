//! External credit intake
//!
//! Applies credits that originate outside the ledger (payment
//! confirmations) exactly once per external event id. The key check and
//! the balance increment are a single store operation, so a replay racing
//! the original delivery can never double-credit.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pricing::find_bundle;
use crate::store::{require_account_id, require_positive, BalanceStore};
use crate::types::{AccountId, Coins, CreditEvent, CreditOutcome};
use crate::webhook::PaymentConfirmation;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a payment confirmation was acknowledged without crediting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredReason {
    /// Notification does not refer to a payment
    NotPayment,
    /// Payment has not cleared
    NotApproved,
    /// Metadata lacks the account
    MissingAccount,
    /// Metadata names no known bundle
    UnknownBundle,
}

/// Result of processing a payment confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Bundle credited, or already credited by an earlier delivery
    Credited {
        /// Coins the bundle is worth
        coins: Coins,
        /// Store outcome
        outcome: CreditOutcome,
    },
    /// Nothing to credit
    Ignored(IgnoredReason),
}

/// Idempotent credit applier
#[derive(Clone)]
pub struct CreditIntake {
    store: Arc<dyn BalanceStore>,
    metrics: Metrics,
}

impl std::fmt::Debug for CreditIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditIntake").finish_non_exhaustive()
    }
}

impl CreditIntake {
    /// Create intake over a store
    pub fn new(store: Arc<dyn BalanceStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Credit `amount` once for `external_event_id`.
    ///
    /// Replays return `AlreadyApplied` and leave the balance untouched. A
    /// failed apply does not consume the key, so the sender may retry.
    pub async fn apply_credit(
        &self,
        external_event_id: &str,
        account_id: &AccountId,
        amount: Coins,
    ) -> Result<CreditOutcome> {
        let external_event_id = external_event_id.trim();
        if external_event_id.is_empty() {
            return Err(Error::InvalidRequest(
                "External event id must not be empty".to_string(),
            ));
        }
        require_account_id(account_id)?;
        require_positive(amount)?;

        let event = CreditEvent::new(external_event_id, account_id.clone(), amount);
        let outcome = self.store.apply_credit_event(&event).await?;

        match outcome {
            CreditOutcome::Applied { new_balance } => {
                self.metrics.record_credit();
                info!(
                    external_event_id,
                    account_id = %account_id,
                    amount,
                    new_balance,
                    "External credit applied"
                );
            }
            CreditOutcome::AlreadyApplied => {
                self.metrics.record_duplicate_credit_event();
                info!(
                    external_event_id,
                    account_id = %account_id,
                    "External credit already applied, ignoring replay"
                );
            }
        }

        Ok(outcome)
    }

    /// Credit the bundle bought in an authenticated payment.
    ///
    /// Only approved payments with an account and a known bundle credit
    /// anything; the payment id is the idempotency key.
    pub async fn apply_payment(&self, payment: &PaymentConfirmation) -> Result<PaymentOutcome> {
        if !payment.is_approved() {
            info!(
                payment_id = %payment.id,
                status = %payment.status,
                "Payment not approved, nothing to credit"
            );
            return Ok(PaymentOutcome::Ignored(IgnoredReason::NotApproved));
        }

        let account_id = match payment.metadata.account_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => AccountId::new(id),
            _ => {
                warn!(payment_id = %payment.id, "Approved payment without account metadata");
                return Ok(PaymentOutcome::Ignored(IgnoredReason::MissingAccount));
            }
        };

        let Some(bundle) = payment.metadata.bundle.as_deref().and_then(find_bundle) else {
            warn!(
                payment_id = %payment.id,
                bundle = ?payment.metadata.bundle,
                "Approved payment for unknown bundle"
            );
            return Ok(PaymentOutcome::Ignored(IgnoredReason::UnknownBundle));
        };

        let outcome = self
            .apply_credit(&payment.id, &account_id, bundle.coins)
            .await?;
        Ok(PaymentOutcome::Credited {
            coins: bundle.coins,
            outcome,
        })
    }
}

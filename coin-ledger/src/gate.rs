//! Metered operation gate
//!
//! Wraps billable work with a charge/compensate protocol against the
//! balance store. Two shapes are supported:
//!
//! - [`MeteredGate::charge_upfront`]: the cost is known before the work
//!   runs. The debit happens first; if the work fails or the request is
//!   abandoned, exactly one compensating credit is issued.
//! - [`MeteredGate::charge_after`]: the cost depends on the result. The work
//!   runs first; if the debit is then rejected the artifact is discarded.
//!
//! A usage record is written only after a successful debit (or for
//! zero-cost work). Losing that write never un-charges the caller; it is
//! logged under the `coin_ledger::reconcile` target instead.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::BalanceStore;
use crate::types::{AccountId, Coins, Quote, UsageKind, UsageRecord};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Tracing target for states that need manual reconciliation
pub const RECONCILE_TARGET: &str = "coin_ledger::reconcile";

/// Output of work whose cost is only known once it completes
#[derive(Debug, Clone)]
pub struct Metered<T> {
    /// Delivered artifact
    pub output: T,

    /// Measured units and resulting cost
    pub quote: Quote,
}

impl<T> Metered<T> {
    /// Pair an artifact with its quote
    pub fn new(output: T, quote: Quote) -> Self {
        Self { output, quote }
    }
}

/// Successfully gated and completed operation
#[derive(Debug, Clone)]
pub struct Charged<T> {
    /// Delivered artifact
    pub output: T,

    /// Coins charged
    pub cost: Coins,

    /// Balance after the charge
    pub new_balance: Coins,

    /// Persisted usage record; `None` if the write was lost after the debit
    pub usage: Option<UsageRecord>,
}

/// Billing orchestrator for metered operations
#[derive(Clone)]
pub struct MeteredGate {
    store: Arc<dyn BalanceStore>,
    metrics: Metrics,
}

impl std::fmt::Debug for MeteredGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredGate").finish_non_exhaustive()
    }
}

impl MeteredGate {
    /// Create gate over a store
    pub fn new(store: Arc<dyn BalanceStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Charge `quote.cost`, then run `work`.
    ///
    /// `work` is never started unless the debit succeeded. If it fails, or
    /// the returned future is dropped before it completes, the debit is
    /// refunded and the caller sees `UpstreamFailure`.
    pub async fn charge_upfront<T, F, Fut>(
        &self,
        account_id: &AccountId,
        kind: UsageKind,
        quote: Quote,
        work: F,
    ) -> Result<Charged<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();

        if quote.cost == 0 {
            let new_balance = self.store.get_balance(account_id).await?;
            let output = work().await.map_err(upstream)?;
            let usage = self.record_usage(account_id, kind, quote).await;
            self.observe(started);
            return Ok(Charged { output, cost: 0, new_balance, usage });
        }

        let (new_balance, mut guard) = self.debit(account_id, kind, quote.cost).await?;

        match work().await {
            Ok(output) => {
                guard.disarm();
                let usage = self.record_usage(account_id, kind, quote).await;
                self.observe(started);
                Ok(Charged { output, cost: quote.cost, new_balance, usage })
            }
            Err(err) => {
                warn!(
                    account_id = %account_id,
                    kind = %kind,
                    amount = quote.cost,
                    error = %format!("{:#}", err),
                    "Metered work failed after debit, refunding"
                );
                // Detached so the refund completes even if this future is dropped
                if let Some(refund) = guard.disarm() {
                    if let Err(join_err) = tokio::spawn(refund.run()).await {
                        error!(
                            target: RECONCILE_TARGET,
                            account_id = %account_id,
                            amount = quote.cost,
                            error = %join_err,
                            "Refund task did not complete"
                        );
                        self.metrics.record_unreconciled();
                    }
                }
                self.observe(started);
                Err(upstream(err))
            }
        }
    }

    /// Run `work`, then charge what it reports.
    ///
    /// If the balance no longer covers the cost the artifact is dropped,
    /// no usage record is written and the caller sees `InsufficientBalance`.
    pub async fn charge_after<T, F, Fut>(
        &self,
        account_id: &AccountId,
        kind: UsageKind,
        work: F,
    ) -> Result<Charged<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Metered<T>>>,
    {
        let started = Instant::now();

        // Unknown accounts must not get free work
        self.store.get_balance(account_id).await?;

        let Metered { output, quote } = work().await.map_err(upstream)?;

        let new_balance = if quote.cost == 0 {
            self.store.get_balance(account_id).await?
        } else {
            match self.debit(account_id, kind, quote.cost).await {
                Ok((balance, mut guard)) => {
                    guard.disarm();
                    balance
                }
                Err(err) => {
                    warn!(
                        account_id = %account_id,
                        kind = %kind,
                        amount = quote.cost,
                        error = %err,
                        "Debit after work rejected, discarding artifact"
                    );
                    drop(output);
                    self.observe(started);
                    return Err(err);
                }
            }
        };

        let usage = self.record_usage(account_id, kind, quote).await;
        self.observe(started);
        Ok(Charged { output, cost: quote.cost, new_balance, usage })
    }

    /// Debit on a detached task and arm the refund for the caller.
    ///
    /// If the caller stops waiting before the result is handed over, the
    /// task itself refunds a debit that went through.
    async fn debit(
        &self,
        account_id: &AccountId,
        kind: UsageKind,
        amount: Coins,
    ) -> Result<(Coins, RefundGuard)> {
        let refund = Refund {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            account_id: account_id.clone(),
            amount,
            kind,
        };

        let (tx, rx) = oneshot::channel();
        let detached = refund.clone();
        tokio::spawn(async move {
            let result = detached
                .store
                .try_debit(&detached.account_id, detached.amount)
                .await;
            if let Err(Ok(_)) = tx.send(result) {
                warn!(
                    account_id = %detached.account_id,
                    kind = %detached.kind,
                    amount = detached.amount,
                    "Metered request abandoned during debit, refunding"
                );
                detached.run().await;
            }
        });

        let result = rx
            .await
            .map_err(|_| Error::Unavailable("Debit task did not complete".to_string()))?;

        match result {
            Ok(new_balance) => {
                self.metrics.record_debit();
                debug!(
                    account_id = %account_id,
                    kind = %kind,
                    amount,
                    new_balance,
                    "Debit applied"
                );
                Ok((new_balance, RefundGuard::arm(refund)))
            }
            Err(err) => {
                if matches!(err, Error::InsufficientBalance { .. }) {
                    self.metrics.record_rejected_debit();
                    info!(
                        account_id = %account_id,
                        kind = %kind,
                        amount,
                        error = %err,
                        "Debit rejected"
                    );
                } else {
                    warn!(
                        account_id = %account_id,
                        kind = %kind,
                        amount,
                        error = %err,
                        "Debit failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn record_usage(
        &self,
        account_id: &AccountId,
        kind: UsageKind,
        quote: Quote,
    ) -> Option<UsageRecord> {
        let record = UsageRecord::new(account_id.clone(), kind, quote.units, quote.cost);
        match self.store.insert_usage(&record).await {
            Ok(()) => Some(record),
            Err(err) => {
                error!(
                    target: RECONCILE_TARGET,
                    account_id = %account_id,
                    kind = %kind,
                    units = quote.units,
                    cost = quote.cost,
                    record_id = %record.id,
                    error = %err,
                    "Usage record lost after successful charge"
                );
                self.metrics.record_unreconciled();
                None
            }
        }
    }

    fn observe(&self, started: Instant) {
        self.metrics
            .record_gate_duration(started.elapsed().as_secs_f64());
    }
}

fn upstream(err: anyhow::Error) -> Error {
    Error::UpstreamFailure(format!("{:#}", err))
}

/// Compensating credit for a debit whose work was not delivered
#[derive(Clone)]
struct Refund {
    store: Arc<dyn BalanceStore>,
    metrics: Metrics,
    account_id: AccountId,
    amount: Coins,
    kind: UsageKind,
}

impl Refund {
    async fn run(self) {
        match self.store.credit(&self.account_id, self.amount).await {
            Ok(new_balance) => {
                self.metrics.record_refund();
                info!(
                    account_id = %self.account_id,
                    kind = %self.kind,
                    amount = self.amount,
                    new_balance,
                    "Debit refunded"
                );
            }
            Err(err) => {
                self.metrics.record_unreconciled();
                error!(
                    target: RECONCILE_TARGET,
                    account_id = %self.account_id,
                    kind = %self.kind,
                    amount = self.amount,
                    error = %err,
                    "Refund failed, account is owed coins"
                );
            }
        }
    }
}

/// Issues the refund if dropped while still armed
struct RefundGuard {
    pending: Option<Refund>,
}

impl RefundGuard {
    fn arm(refund: Refund) -> Self {
        Self { pending: Some(refund) }
    }

    fn disarm(&mut self) -> Option<Refund> {
        self.pending.take()
    }
}

impl Drop for RefundGuard {
    fn drop(&mut self) {
        let Some(refund) = self.pending.take() else {
            return;
        };

        warn!(
            account_id = %refund.account_id,
            amount = refund.amount,
            "Metered request abandoned after debit, refunding"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(refund.run());
            }
            Err(_) => {
                refund.metrics.record_unreconciled();
                error!(
                    target: RECONCILE_TARGET,
                    account_id = %refund.account_id,
                    amount = refund.amount,
                    "Abandoned debit dropped outside a runtime, refund not issued"
                );
            }
        }
    }
}

//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Each collector owns a
//! private registry so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `coin_ledger_debits_total` - Successful debits
//! - `coin_ledger_debits_rejected_total` - Debits rejected for insufficient balance
//! - `coin_ledger_credits_total` - Credits applied (payments, gifts, refunds)
//! - `coin_ledger_credit_events_duplicate_total` - Replayed payment confirmations
//! - `coin_ledger_refunds_total` - Compensating credits issued by the gate
//! - `coin_ledger_unreconciled_total` - States needing manual reconciliation
//! - `coin_ledger_gate_duration_seconds` - Gated operation latency

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Successful debits
    pub debits_total: IntCounter,

    /// Rejected debits
    pub debits_rejected_total: IntCounter,

    /// Applied credits
    pub credits_total: IntCounter,

    /// Duplicate credit events
    pub duplicate_credit_events_total: IntCounter,

    /// Compensating credits
    pub refunds_total: IntCounter,

    /// Unreconciled states
    pub unreconciled_total: IntCounter,

    /// Gate latency histogram
    pub gate_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let debits_total = counter("coin_ledger_debits_total", "Successful debits")?;
        let debits_rejected_total = counter(
            "coin_ledger_debits_rejected_total",
            "Debits rejected for insufficient balance",
        )?;
        let credits_total = counter("coin_ledger_credits_total", "Credits applied")?;
        let duplicate_credit_events_total = counter(
            "coin_ledger_credit_events_duplicate_total",
            "Replayed payment confirmations",
        )?;
        let refunds_total = counter(
            "coin_ledger_refunds_total",
            "Compensating credits issued by the gate",
        )?;
        let unreconciled_total = counter(
            "coin_ledger_unreconciled_total",
            "States needing manual reconciliation",
        )?;

        let gate_duration = Histogram::with_opts(
            HistogramOpts::new(
                "coin_ledger_gate_duration_seconds",
                "Gated operation latency",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        registry.register(Box::new(gate_duration.clone()))?;

        Ok(Self {
            debits_total,
            debits_rejected_total,
            credits_total,
            duplicate_credit_events_total,
            refunds_total,
            unreconciled_total,
            gate_duration,
            registry,
        })
    }

    /// Record a successful debit
    pub fn record_debit(&self) {
        self.debits_total.inc();
    }

    /// Record a rejected debit
    pub fn record_rejected_debit(&self) {
        self.debits_rejected_total.inc();
    }

    /// Record an applied credit
    pub fn record_credit(&self) {
        self.credits_total.inc();
    }

    /// Record a replayed credit event
    pub fn record_duplicate_credit_event(&self) {
        self.duplicate_credit_events_total.inc();
    }

    /// Record a compensating credit
    pub fn record_refund(&self) {
        self.refunds_total.inc();
    }

    /// Record an unreconciled state
    pub fn record_unreconciled(&self) {
        self.unreconciled_total.inc();
    }

    /// Record gated operation duration
    pub fn record_gate_duration(&self, duration_seconds: f64) {
        self.gate_duration.observe(duration_seconds);
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.debits_total.get(), 0);
        assert_eq!(metrics.unreconciled_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_debit();
        assert_eq!(a.debits_total.get(), 1);
        assert_eq!(b.debits_total.get(), 0);
    }

    #[test]
    fn test_render() {
        let metrics = Metrics::new().unwrap();
        metrics.record_refund();
        metrics.record_gate_duration(0.2);
        let text = metrics.render();
        assert!(text.contains("coin_ledger_refunds_total 1"));
        assert!(text.contains("coin_ledger_gate_duration_seconds_bucket"));
    }
}

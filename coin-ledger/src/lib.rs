//! Coin Ledger
//!
//! Prepaid coin balances and the metered-spend protocol around them.
//!
//! # Architecture
//!
//! - **Balance Store**: sole mutator of balances; atomic conditional debit
//! - **Metered Gate**: charge/compensate protocol around billable work
//! - **Credit Intake**: exactly-once credits from payment confirmations
//!
//! # Invariants
//!
//! - Balances never go negative, under any interleaving of requests
//! - No usage record exists without a successful debit
//! - At most one credit per external event id, forever
//! - Work that fails after an upfront debit is refunded exactly once

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod gate;
pub mod intake;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod store;
pub mod types;
pub mod webhook;

// Re-exports
pub use config::{Config, StorageBackend};
pub use error::{Error, Result};
pub use gate::{Charged, Metered, MeteredGate};
pub use intake::{CreditIntake, IgnoredReason, PaymentOutcome};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use pricing::{count_tokens, CoinBundle, RateTable};
pub use store::{BalanceStore, MemoryStore};
pub use types::{
    Account, AccountId, Coins, CreditEvent, CreditOutcome, Quote, UsageKind, UsageRecord,
};
pub use webhook::{PaymentConfirmation, SignatureVerifier};

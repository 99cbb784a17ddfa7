//! Core types for the coin ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer coin arithmetic (no floating point balances)
//! - Time-ordered identifiers (UUIDv7)

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Coin amount. Balances are never negative, so the type is unsigned.
pub type Coins = u64;

/// Alphabet for account codes
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated account codes
pub const CODE_LENGTH: usize = 8;

/// Account identifier (external identity subject)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty identifiers are never valid subjects
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Generate a random account code (`A-Z0-9`).
///
/// Uniqueness is not guaranteed here; stores retry on collision.
pub fn generate_account_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalize a user-supplied account code for lookup
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Account holding a coin balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account ID
    pub id: AccountId,

    /// Shareable code, unique across accounts
    pub unique_code: String,

    /// Current balance
    pub balance: Coins,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last balance change
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account with zero balance
    pub fn new(id: AccountId, unique_code: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            unique_code,
            balance: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Billable operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum UsageKind {
    /// Audio transcription
    Transcription = 1,
    /// AI document generation
    DocumentGeneration = 2,
    /// Signature certification storage
    CertificationStorage = 3,
}

impl UsageKind {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Transcription => "transcription",
            UsageKind::DocumentGeneration => "document-generation",
            UsageKind::CertificationStorage => "certification-storage",
        }
    }

    /// Parse from label
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(UsageKind::Transcription),
            "document-generation" => Some(UsageKind::DocumentGeneration),
            "certification-storage" => Some(UsageKind::CertificationStorage),
            _ => None,
        }
    }
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one gated and completed billable action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Unique record ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Owning account
    pub account_id: AccountId,

    /// Operation type
    pub kind: UsageKind,

    /// Operation-specific measure (tokens, megabytes, ...)
    pub units_consumed: u64,

    /// Coins charged
    pub cost: Coins,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// New record stamped now
    pub fn new(account_id: AccountId, kind: UsageKind, units_consumed: u64, cost: Coins) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            kind,
            units_consumed,
            cost,
            created_at: Utc::now(),
        }
    }
}

/// Credit applied from a payment confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEvent {
    /// Idempotency key supplied by the payment source
    pub external_event_id: String,

    /// Credited account
    pub account_id: AccountId,

    /// Coins credited
    pub amount: Coins,

    /// Applied timestamp
    pub applied_at: DateTime<Utc>,
}

impl CreditEvent {
    /// New event stamped now
    pub fn new(external_event_id: impl Into<String>, account_id: AccountId, amount: Coins) -> Self {
        Self {
            external_event_id: external_event_id.into(),
            account_id,
            amount,
            applied_at: Utc::now(),
        }
    }
}

/// Result of applying a credit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditOutcome {
    /// Balance incremented
    Applied {
        /// Balance after the credit
        new_balance: Coins,
    },
    /// Event already applied earlier; balance untouched
    AlreadyApplied,
}

impl CreditOutcome {
    /// Whether this call changed the balance
    pub fn is_applied(&self) -> bool {
        matches!(self, CreditOutcome::Applied { .. })
    }
}

/// Priced measure of a billable action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Units consumed
    pub units: u64,

    /// Coins to charge
    pub cost: Coins,
}

impl Quote {
    /// Create quote
    pub fn new(units: u64, cost: Coins) -> Self {
        Self { units, cost }
    }
}

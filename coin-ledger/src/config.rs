//! Configuration for the ledger

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Storage backend
    pub backend: StorageBackend,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Published coin rates
    pub pricing: PricingConfig,

    /// Payment webhook configuration
    pub webhook: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/coin-ledger"),
            service_name: "coin-ledger".to_string(),
            backend: StorageBackend::default(),
            rocksdb: RocksDBConfig::default(),
            pricing: PricingConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

/// Which balance store to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local store (tests, development)
    Memory,
    /// Durable RocksDB store
    #[default]
    RocksDb,
}

impl FromStr for StorageBackend {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "rocksdb" => Ok(StorageBackend::RocksDb),
            other => Err(crate::Error::Config(format!("Unknown storage backend: {}", other))),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Attempts for a conditional update before reporting `Unavailable`
    pub max_conflict_retries: u32,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            max_conflict_retries: 64,
        }
    }
}

/// Published per-unit prices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Coins per generated or transcribed token
    pub coins_per_token: Decimal,

    /// Coins per stored megabyte
    pub coins_per_mb_storage: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            coins_per_token: Decimal::ZERO,
            coins_per_mb_storage: Decimal::ZERO,
        }
    }
}

/// Payment webhook configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret for confirmation signatures
    pub secret: Option<String>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> crate::Result<()> {
        if let Some(data_dir) = lookup("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Some(backend) = lookup("LEDGER_BACKEND") {
            self.backend = backend.parse()?;
        }

        if let Some(retries) = lookup("LEDGER_MAX_CONFLICT_RETRIES") {
            self.rocksdb.max_conflict_retries = retries.parse().map_err(|e| {
                crate::Error::Config(format!("LEDGER_MAX_CONFLICT_RETRIES: {}", e))
            })?;
        }

        if let Some(rate) = lookup("COINS_PER_TOKEN") {
            self.pricing.coins_per_token = parse_rate("COINS_PER_TOKEN", &rate)?;
        }

        if let Some(rate) = lookup("COINS_PER_MB_STORAGE") {
            self.pricing.coins_per_mb_storage = parse_rate("COINS_PER_MB_STORAGE", &rate)?;
        }

        if let Some(secret) = lookup("LEDGER_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }

        Ok(())
    }
}

fn parse_rate(name: &str, value: &str) -> crate::Result<Decimal> {
    let rate = Decimal::from_str(value.trim())
        .map_err(|e| crate::Error::Config(format!("{}: {}", name, e)))?;
    if rate.is_sign_negative() {
        return Err(crate::Error::Config(format!("{} must not be negative", name)));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "coin-ledger");
        assert_eq!(config.backend, StorageBackend::RocksDb);
        assert_eq!(config.pricing.coins_per_token, Decimal::ZERO);
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn test_apply_env() {
        let vars: HashMap<&str, &str> = [
            ("LEDGER_BACKEND", "memory"),
            ("COINS_PER_TOKEN", "0.05"),
            ("COINS_PER_MB_STORAGE", "2"),
            ("LEDGER_WEBHOOK_SECRET", "s3cret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.pricing.coins_per_token, Decimal::new(5, 2));
        assert_eq!(config.pricing.coins_per_mb_storage, Decimal::from(2));
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "COINS_PER_TOKEN").then(|| "-1".to_string()));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            backend = "memory"

            [pricing]
            coins_per_token = "0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.pricing.coins_per_token, Decimal::new(1, 1));
        assert_eq!(config.rocksdb.max_conflict_retries, 64);
    }
}

//! Published coin rates and purchasable bundles
//!
//! Costs are always whole coins: `ceil(units * rate)`.

use crate::config::PricingConfig;
use crate::error::{Error, Result};
use crate::types::{Coins, Quote};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bytes per billed megabyte
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Per-unit prices in coins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    /// Coins per generated or transcribed token
    pub coins_per_token: Decimal,

    /// Coins per stored megabyte
    pub coins_per_mb_storage: Decimal,
}

impl RateTable {
    /// Rates from configuration
    pub fn from_config(config: &PricingConfig) -> Self {
        Self {
            coins_per_token: config.coins_per_token,
            coins_per_mb_storage: config.coins_per_mb_storage,
        }
    }

    /// Price a token count (transcription, document generation)
    pub fn quote_tokens(&self, tokens: u64) -> Result<Quote> {
        Ok(Quote::new(tokens, ceil_coins(tokens, self.coins_per_token)?))
    }

    /// Price a payload that will be stored, by size in bytes.
    ///
    /// Units are reported in whole megabytes, rounded up; the cost uses the
    /// exact fractional size.
    pub fn quote_storage(&self, bytes: u64) -> Result<Quote> {
        let megabytes = Decimal::from(bytes) / Decimal::from(BYTES_PER_MB);
        let total = megabytes
            .checked_mul(self.coins_per_mb_storage)
            .ok_or_else(|| Error::InvalidAmount(format!("{} bytes overflow the rate", bytes)))?;
        let cost = to_coins(total.ceil())?;
        Ok(Quote::new(bytes.div_ceil(BYTES_PER_MB), cost))
    }
}

fn ceil_coins(units: u64, rate: Decimal) -> Result<Coins> {
    let total = Decimal::from(units)
        .checked_mul(rate)
        .ok_or_else(|| Error::InvalidAmount(format!("{} units overflow the rate", units)))?;
    to_coins(total.ceil())
}

fn to_coins(value: Decimal) -> Result<Coins> {
    value
        .to_u64()
        .ok_or_else(|| Error::InvalidAmount(format!("{} is not a valid coin amount", value)))
}

/// Count billable tokens in generated text (whitespace-separated words)
pub fn count_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// A purchasable coin bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoinBundle {
    /// Bundle identifier carried in payment metadata
    pub id: &'static str,

    /// Display label
    pub label: &'static str,

    /// Coins credited on approval
    pub coins: Coins,

    /// Price in the payment currency
    pub price: Decimal,
}

/// Bundles on sale
pub fn bundles() -> [CoinBundle; 3] {
    [
        CoinBundle {
            id: "basic",
            label: "100 ThemiCoins",
            coins: 100,
            price: Decimal::new(149999, 2),
        },
        CoinBundle {
            id: "popular",
            label: "500 ThemiCoins",
            coins: 500,
            price: Decimal::new(349900, 2),
        },
        CoinBundle {
            id: "premium",
            label: "1000 ThemiCoins",
            coins: 1000,
            price: Decimal::new(599900, 2),
        },
    ]
}

/// Look a bundle up by id
pub fn find_bundle(id: &str) -> Option<CoinBundle> {
    bundles().into_iter().find(|bundle| bundle.id == id)
}

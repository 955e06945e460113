//! Configuration for a paper-trading portfolio, loaded from JSON.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::domain::MarginMode;

/// Asset class tunes price-cache freshness thresholds (§6 of the design doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Crypto,
    Forex,
    Stocks,
    Commodities,
}

/// Maximum age, in milliseconds, a streamed tick / polled snapshot may have
/// before it is considered stale for this asset class.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessWindow {
    pub stream_max_age_ms: i64,
    pub poll_max_age_ms: i64,
}

impl AssetClass {
    pub fn freshness(self) -> FreshnessWindow {
        match self {
            AssetClass::Crypto => FreshnessWindow {
                stream_max_age_ms: 500,
                poll_max_age_ms: 200,
            },
            AssetClass::Forex => FreshnessWindow {
                stream_max_age_ms: 300,
                poll_max_age_ms: 150,
            },
            AssetClass::Stocks => FreshnessWindow {
                stream_max_age_ms: 1_000,
                poll_max_age_ms: 500,
            },
            AssetClass::Commodities => FreshnessWindow {
                stream_max_age_ms: 2_000,
                poll_max_age_ms: 1_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    Fixed,
    SizeDependent,
    VolatilityAdjusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_maker_fee")]
    pub maker: Decimal,
    #[serde(default = "default_taker_fee")]
    pub taker: Decimal,
}

fn default_maker_fee() -> Decimal {
    dec!(0.0002)
}

fn default_taker_fee() -> Decimal {
    dec!(0.0005)
}

impl Default for FeeConfig {
    fn default() -> Self {
        FeeConfig {
            maker: default_maker_fee(),
            taker: default_taker_fee(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlippageConfig {
    #[serde(default = "default_base_slippage")]
    pub base: Decimal,
    #[serde(default)]
    pub model: SlippageModel,
    #[serde(default = "default_size_impact_factor")]
    pub size_impact_factor: Decimal,
    #[serde(default = "default_vol_multiplier")]
    pub vol_multiplier: Decimal,
}

fn default_base_slippage() -> Decimal {
    dec!(0.001)
}

fn default_size_impact_factor() -> Decimal {
    dec!(0.0)
}

fn default_vol_multiplier() -> Decimal {
    dec!(0.0)
}

impl Default for SlippageModel {
    fn default() -> Self {
        SlippageModel::Fixed
    }
}

impl Default for SlippageConfig {
    fn default() -> Self {
        SlippageConfig {
            base: default_base_slippage(),
            model: SlippageModel::default(),
            size_impact_factor: default_size_impact_factor(),
            vol_multiplier: default_vol_multiplier(),
        }
    }
}

/// Top-level configuration for one paper-trading portfolio/engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperTradingConfig {
    pub portfolio_name: String,
    #[serde(default = "default_provider_tag")]
    pub provider_tag: String,
    #[serde(default)]
    pub asset_class: AssetClass,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub fees: FeeConfig,
    #[serde(default)]
    pub slippage: SlippageConfig,
    #[serde(default = "default_leverage")]
    pub default_leverage: Decimal,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub simulated_latency_ms: Option<u64>,
    #[serde(default = "default_enable_realtime_updates")]
    pub enable_realtime_updates: bool,
    #[serde(default = "default_price_poll_interval_ms")]
    pub price_poll_interval_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_price_cache_capacity")]
    pub price_cache_capacity: usize,
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
}

fn default_provider_tag() -> String {
    "paper".to_string()
}

fn default_initial_balance() -> Decimal {
    dec!(10000)
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_leverage() -> Decimal {
    dec!(1)
}

fn default_enable_realtime_updates() -> bool {
    true
}

fn default_price_poll_interval_ms() -> u64 {
    500
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_price_cache_capacity() -> usize {
    1_000
}

fn default_volatility_window() -> usize {
    32
}

impl Default for AssetClass {
    fn default() -> Self {
        AssetClass::Crypto
    }
}

impl Default for MarginMode {
    fn default() -> Self {
        MarginMode::Cross
    }
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        PaperTradingConfig {
            portfolio_name: "default".to_string(),
            provider_tag: default_provider_tag(),
            asset_class: AssetClass::default(),
            initial_balance: default_initial_balance(),
            currency: default_currency(),
            fees: FeeConfig::default(),
            slippage: SlippageConfig::default(),
            default_leverage: default_leverage(),
            margin_mode: MarginMode::default(),
            simulated_latency_ms: None,
            enable_realtime_updates: default_enable_realtime_updates(),
            price_poll_interval_ms: default_price_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            price_cache_capacity: default_price_cache_capacity(),
            volatility_window: default_volatility_window(),
        }
    }
}

impl PaperTradingConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: PaperTradingConfig =
            serde_json::from_str(&contents).context("failed to parse config JSON")?;
        Ok(config)
    }
}

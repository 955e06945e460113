//! Paper Trading Core
//!
//! A universal paper-trading engine: order placement and lifecycle, fill
//! simulation with configurable slippage and fees, margin/liquidation
//! accounting, and persistent portfolio state, driven by live market data
//! from a pluggable provider.

pub mod accounting;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod lock_manager;
pub mod market_data;
pub mod matching_engine;
pub mod persistence;
pub mod price_cache;
pub mod slippage;
pub mod statistics;

pub use config::PaperTradingConfig;
pub use domain::*;
pub use engine::{Balance, OrderResult, PaperTradingEngine};
pub use error::{CoreError, CoreResult};
pub use market_data::{BinanceTickerProvider, MarketDataProvider};
pub use persistence::{SqliteStore, Store};
pub use statistics::Statistics;

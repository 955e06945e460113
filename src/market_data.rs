//! Market-data provider interface and a concrete public-ticker adapter.

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration as StdDuration;
use tracing::debug;

use crate::domain::{PriceSnapshot, Symbol};

/// Supplies bid/ask/last snapshots for symbols the engine watches. One
/// concrete adapter is provided (`BinanceTickerProvider`); the core never
/// routes across multiple brokers.
pub trait MarketDataProvider: Send + Sync {
    fn fetch_ticker(
        &self,
        symbol: &Symbol,
    ) -> impl std::future::Future<Output = Result<PriceSnapshot>> + Send;
}

/// Public `ticker/bookTicker` + `ticker/price` adapter, grounded on the same
/// `reqwest`-based client the rest of the codebase uses for public market
/// data. No API key is required or accepted; this adapter never places
/// orders against the real exchange.
#[derive(Debug, Clone)]
pub struct BinanceTickerProvider {
    client: Client,
    base_url: String,
}

impl Default for BinanceTickerProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceTickerProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        BinanceTickerProvider {
            client,
            base_url: "https://api.binance.com/api/v3".to_string(),
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut provider = Self::new();
        provider.base_url = base_url.into();
        provider
    }
}

#[derive(Debug, Deserialize)]
struct BookTicker {
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct PriceTicker {
    price: String,
}

impl MarketDataProvider for BinanceTickerProvider {
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<PriceSnapshot> {
        let book: BookTicker = self
            .client
            .get(format!("{}/ticker/bookTicker", self.base_url))
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .context("book ticker request failed")?
            .json()
            .await
            .context("book ticker response was not valid JSON")?;

        let price: PriceTicker = self
            .client
            .get(format!("{}/ticker/price", self.base_url))
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .context("price ticker request failed")?
            .json()
            .await
            .context("price ticker response was not valid JSON")?;

        let bid: Decimal = book.bid_price.parse().context("invalid bid price")?;
        let ask: Decimal = book.ask_price.parse().context("invalid ask price")?;
        let last: Decimal = price.price.parse().context("invalid last price")?;

        debug!(symbol = %symbol, %bid, %ask, %last, "fetched ticker");

        Ok(PriceSnapshot {
            symbol: symbol.clone(),
            bid,
            ask,
            last,
            timestamp: chrono::Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory provider used by engine-level tests so they never make a
    /// network call.
    #[derive(Clone)]
    pub struct FixedPriceProvider {
        pub bid: Decimal,
        pub ask: Decimal,
        pub last: Decimal,
    }

    impl MarketDataProvider for FixedPriceProvider {
        async fn fetch_ticker(&self, symbol: &Symbol) -> Result<PriceSnapshot> {
            Ok(PriceSnapshot {
                symbol: symbol.clone(),
                bid: self.bid,
                ask: self.ask,
                last: self.last,
                timestamp: chrono::Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn fixed_provider_returns_configured_prices() {
        let provider = FixedPriceProvider {
            bid: Decimal::new(29990, 0),
            ask: Decimal::new(30000, 0),
            last: Decimal::new(29995, 0),
        };
        let snap = provider.fetch_ticker(&Symbol::new("BTCUSDT")).await.unwrap();
        assert_eq!(snap.bid, Decimal::new(29990, 0));
        assert_eq!(snap.ask, Decimal::new(30000, 0));
    }

    #[test]
    fn provider_accepts_custom_base_url_for_testing() {
        let provider = BinanceTickerProvider::with_base_url("http://localhost:1");
        assert_eq!(provider.base_url, "http://localhost:1");
    }
}

//! Consumer-facing façade: wires the lock manager, slippage calculator,
//! accountant, matching engine, price cache, persistence and market-data
//! provider into one broker-like API for a single paper-trading portfolio.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::accounting::{self, PositionBook};
use crate::config::PaperTradingConfig;
use crate::domain::{
    MarginBlock, Order, OrderId, OrderParams, OrderStatus, OrderType, Portfolio, PortfolioId,
    PriceSnapshot, Side, Symbol, Trade,
};
use crate::error::{CoreError, CoreResult};
use crate::lock_manager::{LockKey, TransactionLockManager};
use crate::market_data::MarketDataProvider;
use crate::matching_engine::OrderMatchingEngine;
use crate::persistence::Store;
use crate::price_cache::PriceCache;
use crate::slippage::SlippageCalculator;
use crate::statistics::{Statistics, StatisticsCalculator};

/// Free / used / total balance, mirroring the shape of a real exchange's
/// account endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
    pub currency: String,
}

/// Result of a successful `place_order` call.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order: Order,
    pub trades: Vec<Trade>,
    pub available_balance: Decimal,
}

/// One paper-trading account: a portfolio, its positions and orders, and
/// everything needed to drive fills against live market data. Generic over
/// the market-data provider so tests can swap in a fixed-price stub without
/// touching the network.
pub struct PaperTradingEngine<P: MarketDataProvider> {
    config: PaperTradingConfig,
    portfolio: Mutex<Portfolio>,
    book: Mutex<PositionBook>,
    matching: Mutex<OrderMatchingEngine>,
    locks: TransactionLockManager,
    slippage: SlippageCalculator,
    cache: PriceCache,
    store: Arc<dyn Store>,
    market_data: P,
}

impl<P: MarketDataProvider> PaperTradingEngine<P> {
    pub fn new(config: PaperTradingConfig, market_data: P, store: Arc<dyn Store>) -> CoreResult<Self> {
        let portfolio = Portfolio::new(
            config.portfolio_name.clone(),
            config.provider_tag.clone(),
            config.initial_balance,
            config.currency.clone(),
            config.margin_mode,
            config.default_leverage,
        );
        store.save_portfolio(&portfolio)?;

        Ok(PaperTradingEngine {
            locks: TransactionLockManager::new(Duration::from_millis(config.lock_timeout_ms)),
            slippage: SlippageCalculator::new(config.slippage.clone(), config.volatility_window),
            cache: PriceCache::new(config.price_cache_capacity, config.asset_class.freshness()),
            portfolio: Mutex::new(portfolio),
            book: Mutex::new(PositionBook::new()),
            matching: Mutex::new(OrderMatchingEngine::new()),
            store,
            market_data,
            config,
        })
    }

    pub fn portfolio_id(&self) -> PortfolioId {
        self.portfolio.lock().expect("portfolio lock poisoned").id
    }

    /// Return a cached snapshot if it's fresh enough, otherwise fetch one
    /// from the market-data provider and cache it.
    async fn snapshot(&self, symbol: &Symbol) -> CoreResult<PriceSnapshot> {
        if let Some(cached) = self.cache.get(symbol) {
            return Ok(cached);
        }
        let snapshot = self
            .market_data
            .fetch_ticker(symbol)
            .await
            .map_err(|e| CoreError::MarketDataUnavailable(e.to_string()))?;
        self.slippage.record_price(symbol, snapshot.last);
        self.cache.update_polled(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn place_order(
        &self,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        params: OrderParams,
    ) -> CoreResult<OrderResult> {
        let portfolio_id = self.portfolio_id();
        let keys = vec![
            LockKey::Portfolio(portfolio_id),
            LockKey::PortfolioSymbol(portfolio_id, symbol.clone()),
        ];

        if let Some(latency_ms) = self.config.simulated_latency_ms {
            if order_type == OrderType::Market {
                tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            }
        }

        let snapshot = self.snapshot(&symbol).await?;

        self.locks
            .with_locks(keys, || async {
                let mut portfolio = self.portfolio.lock().expect("portfolio lock poisoned");
                let mut book = self.book.lock().expect("position book lock poisoned");
                let mut matching = self.matching.lock().expect("matching engine lock poisoned");

                let (order, trades) = matching.place_order(
                    &mut portfolio,
                    &mut book,
                    &self.slippage,
                    &snapshot,
                    symbol.clone(),
                    side,
                    order_type,
                    quantity,
                    params,
                    &self.config.fees,
                )?;

                self.persist_order_and_trades(&portfolio, &order, &book, &symbol, &trades)?;
                if order.is_active() {
                    self.store.save_margin_block(&margin_block_for(&order, &snapshot))?;
                }

                let available_balance = accounting::available_balance(&portfolio, &book, Decimal::ZERO);
                info!(order_id = %order.id, ?side, %quantity, "order placed");
                Ok(OrderResult {
                    order,
                    trades,
                    available_balance,
                })
            })
            .await
    }

    pub fn cancel_order(&self, order_id: OrderId) -> CoreResult<Order> {
        let mut matching = self.matching.lock().expect("matching engine lock poisoned");
        let order = matching.cancel_order(order_id)?;
        self.store.save_order(&order)?;
        self.store.release_margin_block(order_id.0)?;
        Ok(order)
    }

    pub fn cancel_all_orders(&self) -> CoreResult<Vec<Order>> {
        let portfolio_id = self.portfolio_id();
        let mut matching = self.matching.lock().expect("matching engine lock poisoned");
        let cancelled = matching.cancel_all_orders(portfolio_id);
        for order in &cancelled {
            self.store.save_order(order)?;
            self.store.release_margin_block(order.id.0)?;
        }
        Ok(cancelled)
    }

    /// Atomic edit: place the replacement first, only cancel the original
    /// once the replacement has been accepted.
    pub async fn edit_order(
        &self,
        order_id: OrderId,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
    ) -> CoreResult<Order> {
        let portfolio_id = self.portfolio_id();
        let symbol = {
            let matching = self.matching.lock().expect("matching engine lock poisoned");
            matching.get(order_id).ok_or(CoreError::OrderNotFound(order_id))?.symbol.clone()
        };
        let keys = vec![
            LockKey::Portfolio(portfolio_id),
            LockKey::PortfolioSymbol(portfolio_id, symbol.clone()),
        ];
        let snapshot = self.snapshot(&symbol).await?;

        self.locks
            .with_locks(keys, || async {
                let mut portfolio = self.portfolio.lock().expect("portfolio lock poisoned");
                let mut book = self.book.lock().expect("position book lock poisoned");
                let mut matching = self.matching.lock().expect("matching engine lock poisoned");

                let (replacement, trades) = matching.edit_order(
                    order_id,
                    &mut portfolio,
                    &mut book,
                    &self.slippage,
                    &snapshot,
                    new_price,
                    new_quantity,
                    &self.config.fees,
                )?;

                if let Some(original) = matching.get(order_id) {
                    self.store.save_order(original)?;
                }
                self.store.release_margin_block(order_id.0)?;

                self.persist_order_and_trades(&portfolio, &replacement, &book, &symbol, &trades)?;
                if replacement.is_active() {
                    self.store.save_margin_block(&margin_block_for(&replacement, &snapshot))?;
                }

                Ok(replacement)
            })
            .await
    }

    pub fn fetch_balance(&self) -> Balance {
        let portfolio = self.portfolio.lock().expect("portfolio lock poisoned");
        let book = self.book.lock().expect("position book lock poisoned");
        let used = book.total_initial_margin();
        Balance {
            free: portfolio.current_balance - used,
            used,
            total: portfolio.current_balance,
            currency: portfolio.currency.clone(),
        }
    }

    /// Refresh prices for every open position before returning them.
    pub async fn fetch_positions(&self) -> CoreResult<Vec<crate::domain::Position>> {
        let symbols: Vec<Symbol> = {
            let book = self.book.lock().expect("position book lock poisoned");
            book.open_positions().map(|p| p.symbol.clone()).collect()
        };
        for symbol in &symbols {
            if let Ok(snapshot) = self.snapshot(symbol).await {
                let mut book = self.book.lock().expect("position book lock poisoned");
                book.mark_price(symbol, snapshot.last);
            }
        }
        let book = self.book.lock().expect("position book lock poisoned");
        Ok(book.open_positions().cloned().collect())
    }

    pub fn fetch_closed_positions(&self) -> Vec<crate::domain::Position> {
        let book = self.book.lock().expect("position book lock poisoned");
        book.closed_positions().to_vec()
    }

    pub fn fetch_orders(&self, status: Option<OrderStatus>) -> Vec<Order> {
        let portfolio_id = self.portfolio_id();
        let matching = self.matching.lock().expect("matching engine lock poisoned");
        matching
            .orders_for_portfolio(portfolio_id)
            .filter(|o| match status {
                Some(s) => o.status == s,
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn fetch_trades(&self, limit: Option<usize>) -> CoreResult<Vec<Trade>> {
        let mut trades = self.store.load_trades(self.portfolio_id())?;
        trades.sort_by_key(|t| t.timestamp);
        if let Some(limit) = limit {
            let start = trades.len().saturating_sub(limit);
            trades = trades[start..].to_vec();
        }
        Ok(trades)
    }

    pub fn get_statistics(&self) -> Statistics {
        let book = self.book.lock().expect("position book lock poisoned");
        let trades = self.store.load_trades(self.portfolio_id()).unwrap_or_default();
        StatisticsCalculator::compute(book.closed_positions(), &trades, self.config.initial_balance)
    }

    /// Wipe history and restore the starting balance. Also clears locks and
    /// the in-memory matching/position state.
    pub fn reset_account(&self) -> CoreResult<()> {
        let mut portfolio = self.portfolio.lock().expect("portfolio lock poisoned");
        let mut book = self.book.lock().expect("position book lock poisoned");
        let mut matching = self.matching.lock().expect("matching engine lock poisoned");

        self.store.reset_account(portfolio.id, self.config.initial_balance)?;
        portfolio.current_balance = self.config.initial_balance;
        *book = PositionBook::new();
        *matching = OrderMatchingEngine::new();
        self.locks.clear_all_locks();
        info!(portfolio_id = %portfolio.id, "account reset");
        Ok(())
    }

    /// Run one monitoring pass over every symbol with at least one pending
    /// order, driving stop triggers, trailing-stop updates, resting-limit
    /// fills and liquidation checks. Intended to be called on a
    /// `price_poll_interval_ms` tick by the caller's own loop.
    pub async fn monitor_tick(&self) -> Vec<Trade> {
        let symbols: Vec<Symbol> = {
            let matching = self.matching.lock().expect("matching engine lock poisoned");
            let mut symbols: Vec<Symbol> = matching
                .orders_for_portfolio(self.portfolio_id())
                .filter(|o| o.is_active())
                .map(|o| o.symbol.clone())
                .collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        let mut all_trades = Vec::new();
        for symbol in symbols {
            match self.monitor_symbol(&symbol).await {
                Ok(mut trades) => all_trades.append(&mut trades),
                Err(e) => warn!(%symbol, error = %e, "monitoring pass failed for symbol"),
            }
        }
        all_trades
    }

    async fn monitor_symbol(&self, symbol: &Symbol) -> CoreResult<Vec<Trade>> {
        let portfolio_id = self.portfolio_id();
        let keys = vec![
            LockKey::Portfolio(portfolio_id),
            LockKey::PortfolioSymbol(portfolio_id, symbol.clone()),
        ];

        let snapshot = self
            .market_data
            .fetch_ticker(symbol)
            .await
            .map_err(|e| CoreError::MarketDataUnavailable(e.to_string()))?;
        self.slippage.record_price(symbol, snapshot.last);
        self.cache.update_stream(snapshot.clone());

        self.locks
            .with_locks(keys, || async {
                let mut portfolio = self.portfolio.lock().expect("portfolio lock poisoned");
                let mut book = self.book.lock().expect("position book lock poisoned");
                let mut matching = self.matching.lock().expect("matching engine lock poisoned");

                // `tick` liquidates positions internally (no trade is produced for
                // that), so the portfolio and the symbol's positions are always
                // re-persisted here, not just when a trade fires.
                let trades = matching.tick(symbol, &snapshot, &mut book, &mut portfolio, &self.config.fees);

                for trade in &trades {
                    if let Some(order) = matching.get(trade.order_id) {
                        self.persist_order_and_trades(&portfolio, order, &book, symbol, std::slice::from_ref(trade))?;
                        if !order.is_active() {
                            self.store.release_margin_block(order.id.0)?;
                        }
                    }
                }
                self.store.save_portfolio(&portfolio)?;
                for position in book
                    .open_positions()
                    .filter(|p| p.symbol == *symbol)
                    .chain(book.closed_positions().iter().filter(|p| p.symbol == *symbol))
                {
                    self.store.save_position(position)?;
                }
                Ok(trades)
            })
            .await
    }

    /// Persist a placement/tick outcome: the order, every position the fill
    /// touched, and (if any) the trade row, as one atomic commit per trade.
    fn persist_order_and_trades(
        &self,
        portfolio: &Portfolio,
        order: &Order,
        book: &PositionBook,
        symbol: &Symbol,
        trades: &[Trade],
    ) -> CoreResult<()> {
        if trades.is_empty() {
            return self.store.save_order(order);
        }
        let touched: Vec<crate::domain::Position> = book
            .open_positions()
            .filter(|p| p.symbol == *symbol)
            .cloned()
            .chain(book.closed_positions().iter().filter(|p| p.symbol == *symbol).cloned())
            .collect();
        for trade in trades {
            self.store.commit_fill(portfolio, order, &touched, trade)?;
        }
        Ok(())
    }
}

/// Audit row for the margin a resting order sets aside. Released once the
/// order terminates (cancel, edit-replace, or a fill that closes it out).
fn margin_block_for(order: &Order, snapshot: &PriceSnapshot) -> MarginBlock {
    let price = order
        .price
        .or(order.stop_price)
        .or(order.trailing_state.map(|s| s.stop_price))
        .unwrap_or(snapshot.last);
    MarginBlock {
        id: order.id.0,
        portfolio_id: order.portfolio_id,
        order_id: order.id,
        symbol: order.symbol.clone(),
        blocked_amount: order.quantity * price / order.leverage.max(Decimal::ONE),
        created_at: chrono::Utc::now(),
        released_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeeConfig, SlippageConfig};
    use crate::domain::MarginMode;
    use crate::persistence::SqliteStore;
    use rust_decimal_macros::dec;

    #[derive(Clone)]
    struct FixedPriceProvider {
        snapshot: Arc<Mutex<(Decimal, Decimal, Decimal)>>,
    }

    impl FixedPriceProvider {
        fn new(bid: Decimal, ask: Decimal, last: Decimal) -> Self {
            FixedPriceProvider { snapshot: Arc::new(Mutex::new((bid, ask, last))) }
        }

        fn set(&self, bid: Decimal, ask: Decimal, last: Decimal) {
            *self.snapshot.lock().unwrap() = (bid, ask, last);
        }
    }

    impl MarketDataProvider for FixedPriceProvider {
        async fn fetch_ticker(&self, symbol: &Symbol) -> anyhow::Result<PriceSnapshot> {
            let (bid, ask, last) = *self.snapshot.lock().unwrap();
            Ok(PriceSnapshot {
                symbol: symbol.clone(),
                bid,
                ask,
                last,
                timestamp: chrono::Utc::now(),
            })
        }
    }

    fn test_config() -> PaperTradingConfig {
        PaperTradingConfig {
            portfolio_name: "test".to_string(),
            fees: FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            slippage: SlippageConfig { base: dec!(0.001), ..Default::default() },
            margin_mode: MarginMode::Cross,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn market_buy_fills_immediately_and_updates_balance() {
        let provider = FixedPriceProvider::new(dec!(29990), dec!(30000), dec!(29995));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = PaperTradingEngine::new(test_config(), provider, store).unwrap();

        let result = engine
            .place_order(Symbol::new("BTC/USD"), Side::Buy, OrderType::Market, dec!(0.1), OrderParams::default())
            .await
            .unwrap();

        assert_eq!(result.order.status, OrderStatus::Filled);
        assert_eq!(result.trades.len(), 1);
        let balance = engine.fetch_balance();
        assert!(balance.total < dec!(10000));
        assert!(balance.used > Decimal::ZERO);
    }

    #[tokio::test]
    async fn resting_limit_order_parks_then_fills_on_monitor_tick() {
        let provider = FixedPriceProvider::new(dec!(29990), dec!(30000), dec!(29995));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = PaperTradingEngine::new(test_config(), provider.clone(), store).unwrap();

        let result = engine
            .place_order(
                Symbol::new("BTC/USD"),
                Side::Buy,
                OrderType::Limit,
                dec!(0.1),
                OrderParams { price: Some(dec!(29000)), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(result.order.status, OrderStatus::Pending);

        provider.set(dec!(28990), dec!(29000), dec!(28995));
        let trades = engine.monitor_tick().await;
        assert_eq!(trades.len(), 1);

        let positions = engine.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn reset_account_restores_initial_balance() {
        let provider = FixedPriceProvider::new(dec!(29990), dec!(30000), dec!(29995));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = PaperTradingEngine::new(test_config(), provider, store).unwrap();

        engine
            .place_order(Symbol::new("BTC/USD"), Side::Buy, OrderType::Market, dec!(0.1), OrderParams::default())
            .await
            .unwrap();
        engine.reset_account().unwrap();

        let balance = engine.fetch_balance();
        assert_eq!(balance.total, dec!(10000));
        assert!(engine.fetch_positions().await.unwrap().is_empty());
    }

    #[test]
    fn cancel_all_orders_returns_only_active_orders() {
        let provider = FixedPriceProvider::new(dec!(100), dec!(101), dec!(100.5));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = PaperTradingEngine::new(test_config(), provider, store).unwrap();
        assert!(engine.cancel_all_orders().unwrap().is_empty());
    }
}

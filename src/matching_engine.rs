//! Order state machine, placement protocol, fill mechanics and the
//! per-tick monitoring pass that drives stops, trailing stops and
//! liquidation checks.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;

use crate::accounting::{is_liquidated, PositionBook};
use crate::config::FeeConfig;
use crate::domain::{
    MarginMode, Order, OrderId, OrderParams, OrderStatus, OrderType, PortfolioId, Portfolio,
    PositionSide, PriceSnapshot, Side, Symbol, TimeInForce, Trade, TrailingState,
};
use crate::error::{CoreError, CoreResult};
use crate::slippage::SlippageCalculator;

/// Owns every order for one portfolio and runs the placement/fill protocol
/// against it. One instance per paper-trading account.
#[derive(Default)]
pub struct OrderMatchingEngine {
    orders: HashMap<OrderId, Order>,
}

impl OrderMatchingEngine {
    pub fn new() -> Self {
        OrderMatchingEngine::default()
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders_for_portfolio(&self, portfolio_id: PortfolioId) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(move |o| o.portfolio_id == portfolio_id)
    }

    pub fn pending_orders<'a>(&'a self, symbol: &'a Symbol) -> impl Iterator<Item = &'a Order> {
        self.orders.values().filter(move |o| o.symbol == *symbol && o.is_active())
    }

    /// Validate, execute or park a new order. Returns the stored order and
    /// any trades generated by an immediate fill.
    #[allow(clippy::too_many_arguments)]
    pub fn place_order(
        &mut self,
        portfolio: &mut Portfolio,
        book: &mut PositionBook,
        slippage: &SlippageCalculator,
        snapshot: &PriceSnapshot,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        params: OrderParams,
        fees: &FeeConfig,
    ) -> CoreResult<(Order, Vec<Trade>)> {
        validate_params(order_type, &params)?;

        let mut order = Order::new(
            portfolio.id,
            symbol.clone(),
            side,
            order_type,
            quantity,
            params,
            portfolio.leverage,
            portfolio.margin_mode,
        );

        let expected_price = match order_type {
            OrderType::Market => reference_price(side, snapshot),
            _ => order.price.unwrap_or_else(|| reference_price(side, snapshot)),
        };
        let expected_fee_rate =
            resting_fee_rate(side, order_type, order.time_in_force, expected_price, snapshot, fees);
        let check = crate::accounting::funds_check(
            portfolio,
            book,
            Decimal::ZERO,
            quantity,
            expected_price,
            order.leverage,
            expected_fee_rate,
        );
        if !check.sufficient {
            order.mark(OrderStatus::Rejected);
            return Err(CoreError::InsufficientFunds {
                required: check.required,
                available: check.available,
                currency: portfolio.currency.clone(),
            });
        }

        let mut trades = Vec::new();

        match order_type {
            OrderType::Market => {
                if order.time_in_force == TimeInForce::PO {
                    order.mark(OrderStatus::Rejected);
                    return Err(CoreError::PostOnlyWouldTakeLiquidity);
                }
                let price = slippage.execution_price(&symbol, side, quantity, reference_price(side, snapshot));
                fill(&mut order, book, portfolio, &mut trades, price, quantity, false, fees.taker)?;
            }
            OrderType::Limit | OrderType::Iceberg => {
                let limit_price = order
                    .price
                    .ok_or_else(|| CoreError::InvalidOrder("limit order requires a price".to_string()))?;
                let fillable = immediately_fillable(side, limit_price, snapshot);

                if order.time_in_force == TimeInForce::PO && fillable {
                    order.mark(OrderStatus::Rejected);
                    return Err(CoreError::PostOnlyWouldTakeLiquidity);
                }

                match order.time_in_force {
                    TimeInForce::IOC => {
                        if fillable {
                            fill(&mut order, book, portfolio, &mut trades, limit_price, quantity, false, fees.taker)?;
                        } else {
                            order.mark(OrderStatus::Cancelled);
                            info!(order_id = %order.id, reason = %CoreError::IocNotFillable, "order cancelled");
                        }
                    }
                    TimeInForce::FOK => {
                        if fillable {
                            fill(&mut order, book, portfolio, &mut trades, limit_price, quantity, false, fees.taker)?;
                        } else {
                            order.mark(OrderStatus::Cancelled);
                            info!(order_id = %order.id, reason = %CoreError::FokNotFillable, "order cancelled");
                        }
                    }
                    TimeInForce::GTC | TimeInForce::PO => {
                        if fillable {
                            fill(&mut order, book, portfolio, &mut trades, limit_price, quantity, false, fees.taker)?;
                        }
                        // else remains `pending`, picked up by `tick`.
                    }
                }
            }
            OrderType::Stop | OrderType::StopLimit => {
                // Parked; the monitoring loop owns triggering.
            }
            OrderType::TrailingStop => {
                let extreme = snapshot.last;
                let stop_price = trailing_stop_price(side, extreme, order.trailing_percent, order.trailing_amount)
                    .ok_or_else(|| CoreError::InvalidOrder("trailing stop requires percent or amount".to_string()))?;
                order.trailing_state = Some(TrailingState { extreme_price: extreme, stop_price });
            }
        }

        info!(order_id = %order.id, status = ?order.status, "order placed");
        self.orders.insert(order.id, order.clone());
        Ok((order, trades))
    }

    /// Cancel an order. Cancelling an already-cancelled order is an
    /// idempotent no-op; cancelling any other terminal order is an error.
    pub fn cancel_order(&mut self, order_id: OrderId) -> CoreResult<Order> {
        let order = self.orders.get_mut(&order_id).ok_or(CoreError::OrderNotFound(order_id))?;
        match order.status {
            OrderStatus::Cancelled => Ok(order.clone()),
            OrderStatus::Filled => Err(CoreError::AlreadyFilled(order_id)),
            _ => {
                order.mark(OrderStatus::Cancelled);
                Ok(order.clone())
            }
        }
    }

    pub fn cancel_all_orders(&mut self, portfolio_id: PortfolioId) -> Vec<Order> {
        let ids: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.portfolio_id == portfolio_id && o.is_active())
            .map(|o| o.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.cancel_order(id).ok())
            .collect()
    }

    /// Replace price/quantity on a still-unfilled resting order. Atomic
    /// cancel-and-replace: the replacement is placed (and re-validated
    /// against funds, and may fill immediately) through the same protocol as
    /// a fresh order; the original is only cancelled once that succeeds, so
    /// a rejected replacement leaves the original order untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn edit_order(
        &mut self,
        order_id: OrderId,
        portfolio: &mut Portfolio,
        book: &mut PositionBook,
        slippage: &SlippageCalculator,
        snapshot: &PriceSnapshot,
        new_price: Option<Decimal>,
        new_quantity: Option<Decimal>,
        fees: &FeeConfig,
    ) -> CoreResult<(Order, Vec<Trade>)> {
        let original = self.orders.get(&order_id).ok_or(CoreError::OrderNotFound(order_id))?.clone();
        match original.status {
            OrderStatus::Filled => return Err(CoreError::AlreadyFilled(order_id)),
            OrderStatus::Cancelled | OrderStatus::Rejected => return Err(CoreError::AlreadyCancelled(order_id)),
            OrderStatus::Partial => {
                return Err(CoreError::InvalidOrder("cannot edit a partially filled order".to_string()))
            }
            OrderStatus::Pending | OrderStatus::Triggered => {}
        }

        let params = OrderParams {
            price: new_price.or(original.price),
            stop_price: original.stop_price,
            time_in_force: Some(original.time_in_force),
            reduce_only: original.reduce_only,
            trailing_percent: original.trailing_percent,
            trailing_amount: original.trailing_amount,
            iceberg_qty: original.iceberg_qty,
            leverage: Some(original.leverage),
            margin_mode: Some(original.margin_mode),
        };
        let quantity = new_quantity.unwrap_or(original.quantity);

        let (replacement, trades) = self.place_order(
            portfolio,
            book,
            slippage,
            snapshot,
            original.symbol.clone(),
            original.side,
            original.order_type,
            quantity,
            params,
            fees,
        )?;

        if let Some(stored) = self.orders.get_mut(&order_id) {
            stored.mark(OrderStatus::Cancelled);
        }

        Ok((replacement, trades))
    }

    /// One monitoring pass for `symbol`: liquidation checks, resting-limit
    /// fills, stop triggers, and trailing-stop tracking. Each order is
    /// processed independently; a failure on one never aborts the rest.
    pub fn tick(
        &mut self,
        symbol: &Symbol,
        snapshot: &PriceSnapshot,
        book: &mut PositionBook,
        portfolio: &mut Portfolio,
        fees: &FeeConfig,
    ) -> Vec<Trade> {
        let mut trades = Vec::new();

        for side in [PositionSide::Long, PositionSide::Short] {
            if let Some(pos) = book.open_position(symbol, side) {
                if is_liquidated(pos, snapshot.last) {
                    if let Some(pnl) = book.force_close(symbol, side, snapshot.last) {
                        portfolio.current_balance += pnl;
                        info!(%symbol, ?side, pnl = %pnl, "position liquidated");
                    }
                }
            }
        }
        book.mark_price(symbol, snapshot.last);

        let order_ids: Vec<OrderId> = self.pending_orders(symbol).map(|o| o.id).collect();
        for id in order_ids {
            if let Err(err) = self.process_one(id, snapshot, book, portfolio, fees, &mut trades) {
                tracing::warn!(order_id = %id, error = %err, "order tick failed, skipping");
            }
        }

        trades
    }

    fn process_one(
        &mut self,
        id: OrderId,
        snapshot: &PriceSnapshot,
        book: &mut PositionBook,
        portfolio: &mut Portfolio,
        fees: &FeeConfig,
        trades: &mut Vec<Trade>,
    ) -> CoreResult<()> {
        let Some(order) = self.orders.get(&id) else { return Ok(()) };
        if !order.is_active() {
            return Ok(());
        }
        let order_type = order.order_type;
        let side = order.side;

        match order_type {
            OrderType::Limit | OrderType::Iceberg => {
                let limit_price = order.price.unwrap_or(snapshot.last);
                if immediately_fillable(side, limit_price, snapshot) {
                    let qty = self.orders.get(&id).unwrap().remaining_quantity();
                    let order = self.orders.get_mut(&id).unwrap();
                    fill(order, book, portfolio, trades, limit_price, qty, true, fees.maker)?;
                }
            }
            OrderType::Stop => {
                let stop_price = order.stop_price.unwrap_or(Decimal::ZERO);
                if order.status == OrderStatus::Triggered {
                    let order_mut = self.orders.get_mut(&id).unwrap();
                    let qty = order_mut.remaining_quantity();
                    fill(order_mut, book, portfolio, trades, stop_price, qty, false, fees.taker)?;
                } else if stop_triggered(side, stop_price, snapshot.last) {
                    self.orders.get_mut(&id).unwrap().mark(OrderStatus::Triggered);
                }
            }
            OrderType::StopLimit => {
                let stop_price = order.stop_price.unwrap_or(Decimal::ZERO);
                let limit_price = order.price.unwrap_or(stop_price);
                if order.status != OrderStatus::Triggered
                    && stop_triggered(side, stop_price, snapshot.last)
                {
                    self.orders.get_mut(&id).unwrap().mark(OrderStatus::Triggered);
                }
                let order = self.orders.get(&id).unwrap();
                if order.status == OrderStatus::Triggered
                    && immediately_fillable(side, limit_price, snapshot)
                {
                    let qty = order.remaining_quantity();
                    let order_mut = self.orders.get_mut(&id).unwrap();
                    fill(order_mut, book, portfolio, trades, limit_price, qty, false, fees.taker)?;
                }
            }
            OrderType::TrailingStop => {
                let order_mut = self.orders.get_mut(&id).unwrap();
                if let Some(mut state) = order_mut.trailing_state {
                    update_trailing(side, snapshot.last, &mut state, order_mut.trailing_percent, order_mut.trailing_amount);
                    order_mut.trailing_state = Some(state);
                    if stop_triggered(side, state.stop_price, snapshot.last) {
                        let qty = order_mut.remaining_quantity();
                        fill(order_mut, book, portfolio, trades, snapshot.last, qty, false, fees.taker)?;
                    }
                }
            }
            OrderType::Market => {}
        }
        Ok(())
    }
}

fn reference_price(side: Side, snapshot: &PriceSnapshot) -> Decimal {
    match side {
        Side::Buy => snapshot.ask,
        Side::Sell => snapshot.bid,
    }
}

/// Fee rate a funds-check should reserve against: taker for every buy and
/// every order that will execute immediately, maker only for a sell limit
/// that will rest on the book rather than cross it right away.
fn resting_fee_rate(
    side: Side,
    order_type: OrderType,
    time_in_force: TimeInForce,
    price: Decimal,
    snapshot: &PriceSnapshot,
    fees: &FeeConfig,
) -> Decimal {
    let resting_sell_limit = side == Side::Sell
        && matches!(order_type, OrderType::Limit | OrderType::Iceberg)
        && matches!(time_in_force, TimeInForce::GTC | TimeInForce::PO)
        && !immediately_fillable(side, price, snapshot);
    if resting_sell_limit {
        fees.maker
    } else {
        fees.taker
    }
}

fn immediately_fillable(side: Side, limit_price: Decimal, snapshot: &PriceSnapshot) -> bool {
    match side {
        Side::Buy => snapshot.ask <= limit_price || snapshot.last <= limit_price,
        Side::Sell => snapshot.bid >= limit_price || snapshot.last >= limit_price,
    }
}

/// `last ≥ stop` triggers a buy-side stop (entering long / closing short);
/// `last ≤ stop` triggers a sell-side stop (closing long).
fn stop_triggered(side: Side, stop_price: Decimal, last: Decimal) -> bool {
    match side {
        Side::Buy => last >= stop_price,
        Side::Sell => last <= stop_price,
    }
}

fn trailing_stop_price(
    side: Side,
    extreme: Decimal,
    percent: Option<Decimal>,
    amount: Option<Decimal>,
) -> Option<Decimal> {
    match side {
        Side::Sell => percent
            .map(|p| extreme * (Decimal::ONE - p / dec!(100)))
            .or(amount.map(|a| extreme - a)),
        Side::Buy => percent
            .map(|p| extreme * (Decimal::ONE + p / dec!(100)))
            .or(amount.map(|a| extreme + a)),
    }
}

fn update_trailing(
    side: Side,
    last: Decimal,
    state: &mut TrailingState,
    percent: Option<Decimal>,
    amount: Option<Decimal>,
) {
    match side {
        Side::Sell => {
            if last > state.extreme_price {
                state.extreme_price = last;
                if let Some(new_stop) = trailing_stop_price(side, last, percent, amount) {
                    if new_stop > state.stop_price {
                        state.stop_price = new_stop;
                    }
                }
            }
        }
        Side::Buy => {
            if last < state.extreme_price {
                state.extreme_price = last;
                if let Some(new_stop) = trailing_stop_price(side, last, percent, amount) {
                    if new_stop < state.stop_price {
                        state.stop_price = new_stop;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn fill(
    order: &mut Order,
    book: &mut PositionBook,
    portfolio: &mut Portfolio,
    trades: &mut Vec<Trade>,
    price: Decimal,
    quantity: Decimal,
    is_maker: bool,
    fee_rate: Decimal,
) -> CoreResult<()> {
    let trade = Trade::new(
        order.portfolio_id,
        order.id,
        order.symbol.clone(),
        order.side,
        price,
        quantity,
        fee_rate,
        is_maker,
    );
    portfolio.current_balance -= trade.fee;
    let realized = book.apply_fill(
        order.portfolio_id,
        &order.symbol,
        order.side,
        price,
        quantity,
        order.leverage,
        order.margin_mode,
        order.reduce_only,
        fee_rate,
    )?;
    portfolio.current_balance += realized;
    order.apply_fill(price, quantity);
    trades.push(trade);
    Ok(())
}

fn validate_params(order_type: OrderType, params: &OrderParams) -> CoreResult<()> {
    match order_type {
        OrderType::Stop => {
            if params.stop_price.is_none() {
                return Err(CoreError::InvalidOrder("stop order requires stop_price".to_string()));
            }
        }
        OrderType::StopLimit => {
            if params.stop_price.is_none() {
                return Err(CoreError::InvalidOrder("stop-limit order requires stop_price".to_string()));
            }
            if params.price.is_none() {
                return Err(CoreError::InvalidOrder("stop-limit order requires price".to_string()));
            }
        }
        OrderType::TrailingStop => {
            if params.trailing_percent.is_none() && params.trailing_amount.is_none() {
                return Err(CoreError::InvalidOrder(
                    "trailing stop requires trailing_percent or trailing_amount".to_string(),
                ));
            }
        }
        OrderType::Iceberg => {
            if params.iceberg_qty.is_none() {
                return Err(CoreError::InvalidOrder("iceberg order requires iceberg_qty".to_string()));
            }
            if params.price.is_none() {
                return Err(CoreError::InvalidOrder("iceberg order requires price".to_string()));
            }
        }
        OrderType::Limit => {
            if params.price.is_none() {
                return Err(CoreError::InvalidOrder("limit order requires price".to_string()));
            }
        }
        OrderType::Market => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SlippageConfig, SlippageModel};

    fn snapshot(bid: Decimal, ask: Decimal, last: Decimal) -> PriceSnapshot {
        PriceSnapshot {
            symbol: Symbol::new("BTC/USD"),
            bid,
            ask,
            last,
            timestamp: chrono::Utc::now(),
        }
    }

    fn portfolio() -> Portfolio {
        Portfolio::new("p", "paper", dec!(10000), "USD", MarginMode::Cross, dec!(1))
    }

    #[test]
    fn scenario_s1_market_buy_spot() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        let slippage = SlippageCalculator::new(
            SlippageConfig {
                base: dec!(0.001),
                model: SlippageModel::Fixed,
                size_impact_factor: dec!(0),
                vol_multiplier: dec!(0),
            },
            32,
        );
        let snap = snapshot(dec!(29990), dec!(30000), dec!(29995));

        let (order, trades) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("BTC/USD"),
                Side::Buy,
                OrderType::Market,
                dec!(0.1),
                OrderParams::default(),
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(30030.000)));
        assert_eq!(trades.len(), 1);
        assert_eq!(portfolio.current_balance, dec!(9998.4985));
        assert_eq!(
            crate::accounting::available_balance(&portfolio, &book, Decimal::ZERO),
            dec!(6995.4985)
        );
        let pos = book.open_position(&Symbol::new("BTC/USD"), PositionSide::Long).unwrap();
        assert_eq!(pos.quantity, dec!(0.1));
        assert_eq!(pos.entry_price, dec!(30030.000));
    }

    #[test]
    fn scenario_s2_limit_sell_parks_then_fills_as_maker() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        book.apply_fill(
            portfolio.id,
            &Symbol::new("BTC/USD"),
            Side::Buy,
            dec!(29000),
            dec!(0.1),
            dec!(1),
            MarginMode::Cross,
            false,
            dec!(0),
        )
        .unwrap();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(29990), dec!(30000), dec!(29995));

        let (order, trades) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("BTC/USD"),
                Side::Sell,
                OrderType::Limit,
                dec!(0.1),
                OrderParams {
                    price: Some(dec!(30100)),
                    time_in_force: Some(TimeInForce::GTC),
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(trades.is_empty());

        let next = snapshot(dec!(30120), dec!(30130), dec!(30125));
        let trades = engine.tick(
            &Symbol::new("BTC/USD"),
            &next,
            &mut book,
            &mut portfolio,
            &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
        );
        assert_eq!(trades.len(), 1);
        assert!(trades[0].is_maker);
        assert_eq!(trades[0].price, dec!(30100));
        assert_eq!(engine.get(order.id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn scenario_s3_post_only_would_cross_is_rejected() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(100), dec!(101), dec!(100.5));

        let err = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("X"),
                Side::Buy,
                OrderType::Limit,
                dec!(1),
                OrderParams {
                    price: Some(dec!(102)),
                    time_in_force: Some(TimeInForce::PO),
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::PostOnlyWouldTakeLiquidity));
    }

    #[test]
    fn scenario_s5_trailing_sell_stop() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        book.apply_fill(
            portfolio.id,
            &Symbol::new("BTC/USD"),
            Side::Buy,
            dec!(100),
            dec!(1),
            dec!(1),
            MarginMode::Cross,
            false,
            dec!(0),
        )
        .unwrap();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(99.9), dec!(100.1), dec!(100));

        let (order, _) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("BTC/USD"),
                Side::Sell,
                OrderType::TrailingStop,
                dec!(1),
                OrderParams {
                    trailing_percent: Some(dec!(2)),
                    reduce_only: true,
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0), taker: dec!(0) },
            )
            .unwrap();
        assert_eq!(order.trailing_state.unwrap().stop_price, dec!(98));

        for last in [dec!(101), dec!(103), dec!(102)] {
            engine.tick(
                &Symbol::new("BTC/USD"),
                &snapshot(last - dec!(0.1), last + dec!(0.1), last),
                &mut book,
                &mut portfolio,
                &FeeConfig { maker: dec!(0), taker: dec!(0) },
            );
        }
        let stop_after_103 = engine.get(order.id).unwrap().trailing_state.unwrap().stop_price;
        assert_eq!(stop_after_103, dec!(100.94));

        let trades = engine.tick(
            &Symbol::new("BTC/USD"),
            &snapshot(dec!(100.8), dec!(101), dec!(100.9)),
            &mut book,
            &mut portfolio,
            &FeeConfig { maker: dec!(0), taker: dec!(0) },
        );
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].price, dec!(100.9));
        assert_eq!(engine.get(order.id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn edit_order_cancels_original_and_places_a_replacement() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(100), dec!(101), dec!(100.5));
        let (order, _) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("X"),
                Side::Buy,
                OrderType::Limit,
                dec!(1),
                OrderParams {
                    price: Some(dec!(50)),
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap();

        let (replacement, _) = engine
            .edit_order(order.id, &mut portfolio, &mut book, &slippage, &snap, Some(dec!(60)), None, &FeeConfig {
                maker: dec!(0.0002),
                taker: dec!(0.0005),
            })
            .unwrap();

        assert_ne!(replacement.id, order.id);
        assert_eq!(replacement.price, Some(dec!(60)));
        assert_eq!(engine.get(order.id).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(engine.get(replacement.id).unwrap().status, OrderStatus::Pending);
    }

    #[test]
    fn edit_order_leaves_original_untouched_when_replacement_is_rejected() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(100), dec!(101), dec!(100.5));
        let (order, _) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("X"),
                Side::Buy,
                OrderType::Limit,
                dec!(1),
                OrderParams {
                    price: Some(dec!(50)),
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap();

        let err = engine
            .edit_order(
                order.id,
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                None,
                Some(dec!(100000)),
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap_err();

        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert_eq!(engine.get(order.id).unwrap().status, OrderStatus::Pending);
    }

    #[test]
    fn cancelling_an_already_cancelled_order_is_idempotent() {
        let mut engine = OrderMatchingEngine::new();
        let mut book = PositionBook::new();
        let mut portfolio = portfolio();
        let slippage = SlippageCalculator::new(SlippageConfig::default(), 32);
        let snap = snapshot(dec!(100), dec!(101), dec!(100.5));
        let (order, _) = engine
            .place_order(
                &mut portfolio,
                &mut book,
                &slippage,
                &snap,
                Symbol::new("X"),
                Side::Buy,
                OrderType::Limit,
                dec!(1),
                OrderParams {
                    price: Some(dec!(50)),
                    ..Default::default()
                },
                &FeeConfig { maker: dec!(0.0002), taker: dec!(0.0005) },
            )
            .unwrap();
        engine.cancel_order(order.id).unwrap();
        let second = engine.cancel_order(order.id).unwrap();
        assert_eq!(second.status, OrderStatus::Cancelled);
    }
}

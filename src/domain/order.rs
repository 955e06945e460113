//! Order types and the order state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{MarginMode, OrderId, PortfolioId, Side, Symbol};

/// Order type - determines placement and fill logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Executes immediately against the latest price snapshot.
    Market,
    /// Executes when price trades through `price`.
    Limit,
    /// Converts to a market order once `stop_price` is reached.
    Stop,
    /// Converts to a limit order at `price` once `stop_price` is reached.
    StopLimit,
    /// Stop whose trigger price tracks the favourable price extreme.
    TrailingStop,
    /// Simulated as a plain limit order; visible/hidden quantity is not modelled.
    Iceberg,
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancelled.
    GTC,
    /// Immediate or cancel.
    IOC,
    /// Fill or kill.
    FOK,
    /// Post-only: rejected if it would take liquidity immediately.
    PO,
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Triggered,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Per-order trailing-stop tracking state. Only populated for
/// `OrderType::TrailingStop`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailingState {
    /// Most favourable price observed since the order was placed.
    pub extreme_price: Decimal,
    /// Current dynamic stop price derived from `extreme_price`.
    pub stop_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub portfolio_id: PortfolioId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub trailing_percent: Option<Decimal>,
    pub trailing_amount: Option<Decimal>,
    pub iceberg_qty: Option<Decimal>,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub trailing_state: Option<TrailingState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Parameters accepted by `OrderMatchingEngine::place_order`, grouping every
/// field that is specific to a subset of order types.
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub trailing_percent: Option<Decimal>,
    pub trailing_amount: Option<Decimal>,
    pub iceberg_qty: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub margin_mode: Option<MarginMode>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portfolio_id: PortfolioId,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        params: OrderParams,
        default_leverage: Decimal,
        default_margin_mode: MarginMode,
    ) -> Self {
        let now = Utc::now();
        Order {
            id: OrderId::next(),
            portfolio_id,
            symbol,
            side,
            order_type,
            quantity,
            price: params.price,
            stop_price: params.stop_price,
            time_in_force: params.time_in_force.unwrap_or(TimeInForce::GTC),
            reduce_only: params.reduce_only,
            trailing_percent: params.trailing_percent,
            trailing_amount: params.trailing_amount,
            iceberg_qty: params.iceberg_qty,
            leverage: params.leverage.unwrap_or(default_leverage),
            margin_mode: params.margin_mode.unwrap_or(default_margin_mode),
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            trailing_state: None,
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Record a fill, updating filled quantity, the volume-weighted average
    /// fill price, and status. Returns whether the order is now fully filled.
    pub fn apply_fill(&mut self, price: Decimal, quantity: Decimal) -> bool {
        let prior_notional = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        let new_filled = self.filled_quantity + quantity;
        self.avg_fill_price = Some((prior_notional + price * quantity) / new_filled);
        self.filled_quantity = new_filled;
        self.updated_at = Utc::now();

        let fully_filled = self.filled_quantity >= self.quantity;
        self.status = if fully_filled {
            self.filled_at = Some(self.updated_at);
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        fully_filled
    }

    pub fn mark(&mut self, status: OrderStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status == OrderStatus::Filled {
            self.filled_at = Some(self.updated_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order::new(
            PortfolioId::next(),
            Symbol::new("BTC/USD"),
            Side::Buy,
            OrderType::Limit,
            dec!(1),
            OrderParams {
                price: Some(dec!(100)),
                ..Default::default()
            },
            dec!(1),
            MarginMode::Cross,
        )
    }

    #[test]
    fn new_order_starts_pending() {
        let order = sample_order();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.remaining_quantity(), dec!(1));
        assert!(order.is_active());
    }

    #[test]
    fn partial_then_full_fill_averages_price() {
        let mut order = sample_order();
        order.quantity = dec!(2);
        assert!(!order.apply_fill(dec!(100), dec!(1)));
        assert_eq!(order.status, OrderStatus::Partial);
        assert!(order.apply_fill(dec!(102), dec!(1)));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(dec!(101)));
        assert!(!order.is_active());
    }

    #[test]
    fn terminal_status_is_not_active() {
        let mut order = sample_order();
        order.mark(OrderStatus::Cancelled);
        assert!(!order.is_active());
        assert!(order.status.is_terminal());
    }
}

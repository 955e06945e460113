//! Append-only trade (fill) record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderId, PortfolioId, Side, Symbol, TradeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub portfolio_id: PortfolioId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_rate: Decimal,
    pub is_maker: bool,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        portfolio_id: PortfolioId,
        order_id: OrderId,
        symbol: Symbol,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        fee_rate: Decimal,
        is_maker: bool,
    ) -> Self {
        let fee = price * quantity * fee_rate;
        Trade {
            id: TradeId::next(),
            portfolio_id,
            order_id,
            symbol,
            side,
            price,
            quantity,
            fee,
            fee_rate,
            is_maker,
            timestamp: Utc::now(),
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

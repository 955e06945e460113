//! Open/closed positions and the margin-block audit record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{MarginMode, OrderId, PortfolioId, PositionId, Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The position side a fill on `order_side` opens or adds to.
    pub fn from_order_side(order_side: Side) -> Self {
        match order_side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }

    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub portfolio_id: PortfolioId,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: Decimal,
    pub margin_mode: MarginMode,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    pub current_price: Decimal,
    pub realized_pnl: Decimal,
    pub liquidation_price: Option<Decimal>,
}

impl Position {
    pub fn open(
        portfolio_id: PortfolioId,
        symbol: Symbol,
        side: PositionSide,
        entry_price: Decimal,
        quantity: Decimal,
        leverage: Decimal,
        margin_mode: MarginMode,
    ) -> Self {
        Position {
            id: PositionId::next(),
            portfolio_id,
            symbol,
            side,
            entry_price,
            quantity,
            leverage,
            margin_mode,
            opened_at: Utc::now(),
            closed_at: None,
            status: PositionStatus::Open,
            current_price: entry_price,
            realized_pnl: Decimal::ZERO,
            liquidation_price: None,
        }
    }

    /// Unrealized P&L at `current_price`.
    pub fn unrealized_pnl(&self) -> Decimal {
        match self.side {
            PositionSide::Long => (self.current_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - self.current_price) * self.quantity,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    pub fn close(&mut self, realized_pnl_delta: Decimal) {
        self.realized_pnl += realized_pnl_delta;
        self.quantity = Decimal::ZERO;
        self.status = PositionStatus::Closed;
        self.closed_at = Some(Utc::now());
        self.liquidation_price = None;
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Audit row recording margin set aside for a resting order at placement
/// time. Purely observational: released, never deleted, when the order
/// terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginBlock {
    pub id: u64,
    pub portfolio_id: PortfolioId,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub blocked_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn long_unrealized_pnl_is_price_delta_times_qty() {
        let mut pos = Position::open(
            PortfolioId::next(),
            Symbol::new("BTC/USD"),
            PositionSide::Long,
            dec!(100),
            dec!(2),
            dec!(1),
            MarginMode::Cross,
        );
        pos.current_price = dec!(110);
        assert_eq!(pos.unrealized_pnl(), dec!(20));
    }

    #[test]
    fn short_unrealized_pnl_is_inverted() {
        let mut pos = Position::open(
            PortfolioId::next(),
            Symbol::new("BTC/USD"),
            PositionSide::Short,
            dec!(100),
            dec!(2),
            dec!(1),
            MarginMode::Cross,
        );
        pos.current_price = dec!(90);
        assert_eq!(pos.unrealized_pnl(), dec!(20));
    }

    #[test]
    fn close_sets_status_and_zeroes_quantity() {
        let mut pos = Position::open(
            PortfolioId::next(),
            Symbol::new("BTC/USD"),
            PositionSide::Long,
            dec!(100),
            dec!(1),
            dec!(1),
            MarginMode::Cross,
        );
        pos.close(dec!(5));
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.quantity, Decimal::ZERO);
        assert_eq!(pos.realized_pnl, dec!(5));
        assert!(!pos.is_open());
    }
}

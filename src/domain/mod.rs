//! Domain entities: the portfolio, position, order, trade and price-snapshot
//! types shared by every component of the core.

mod order;
mod portfolio;
mod position;
mod price;
mod trade;

pub use order::{Order, OrderParams, OrderStatus, OrderType, TimeInForce, TrailingState};
pub use portfolio::{MarginMode, Portfolio};
pub use position::{MarginBlock, Position, PositionSide, PositionStatus};
pub use price::PriceSnapshot;
pub use trade::Trade;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trading pair / instrument symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order/fill direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

macro_rules! id_type {
    ($name:ident, $counter:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(PortfolioId, PORTFOLIO_ID_COUNTER);
id_type!(PositionId, POSITION_ID_COUNTER);
id_type!(OrderId, ORDER_ID_COUNTER);
id_type!(TradeId, TRADE_ID_COUNTER);

//! Tagged error type for the paper-trading core.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{OrderId, PortfolioId};

/// All ways an operation against the core can fail.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("insufficient funds: required {required}, available {available} {currency}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
        currency: String,
    },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("reduce-only order on {symbol} has no position to reduce")]
    ReduceOnlyNoPosition { symbol: String },

    #[error("reduce-only order on {symbol} exceeds open position size ({requested} > {available})")]
    ReduceOnlyExceedsPosition {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("post-only order would take liquidity")]
    PostOnlyWouldTakeLiquidity,

    #[error("IOC order could not be filled immediately")]
    IocNotFillable,

    #[error("FOK order could not be filled in full immediately")]
    FokNotFillable,

    #[error("order {0} is already filled")]
    AlreadyFilled(OrderId),

    #[error("order {0} is already cancelled")]
    AlreadyCancelled(OrderId),

    #[error("order {0} was not found")]
    OrderNotFound(OrderId),

    #[error("portfolio {0} was not found")]
    PortfolioNotFound(PortfolioId),

    #[error("market data unavailable for {0}")]
    MarketDataUnavailable(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("lock timed out on {0}, forcing release")]
    LockTimeout(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::PersistenceFailure(e.to_string())
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

//! Portfolio: the virtual cash account positions and orders belong to.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PortfolioId;

/// Margin accounting mode. Cross pools margin across all open positions in
/// the portfolio; isolated allocates margin per position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: PortfolioId,
    pub name: String,
    pub provider_tag: String,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub currency: String,
    pub margin_mode: MarginMode,
    pub leverage: Decimal,
}

impl Portfolio {
    pub fn new(
        name: impl Into<String>,
        provider_tag: impl Into<String>,
        initial_balance: Decimal,
        currency: impl Into<String>,
        margin_mode: MarginMode,
        leverage: Decimal,
    ) -> Self {
        Portfolio {
            id: PortfolioId::next(),
            name: name.into(),
            provider_tag: provider_tag.into(),
            initial_balance,
            current_balance: initial_balance,
            currency: currency.into(),
            margin_mode,
            leverage,
        }
    }
}

//! Balance & position accountant: available-funds checks, VWAP position
//! averaging, margin and liquidation-price math.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{MarginMode, PortfolioId, Position, PositionSide, Portfolio, Side, Symbol};
use crate::error::{CoreError, CoreResult};

/// Result of a pre-trade available-funds check. Never mutates state.
#[derive(Debug, Clone)]
pub struct FundsCheck {
    pub sufficient: bool,
    pub required: Decimal,
    pub available: Decimal,
}

/// Liquidation price for an isolated/cross position opened at `entry_price`
/// with `leverage`, assuming symmetric entry/exit fee rates. `None` when the
/// position is unleveraged (no liquidation risk) or the inputs are
/// degenerate.
pub fn liquidation_price(
    entry_price: Decimal,
    quantity: Decimal,
    leverage: Decimal,
    fee_rate: Decimal,
    side: PositionSide,
) -> Option<Decimal> {
    if leverage <= Decimal::ONE || quantity <= Decimal::ZERO || entry_price <= Decimal::ZERO {
        return None;
    }
    let notional = entry_price * quantity;
    let initial_margin = notional / leverage;
    let effective_margin = initial_margin - notional * fee_rate;
    let maint_margin = notional * (dec!(0.5) / leverage);
    let max_loss = effective_margin - maint_margin - notional * fee_rate;
    let offset = max_loss / quantity;
    Some(match side {
        PositionSide::Long => entry_price - offset,
        PositionSide::Short => entry_price + offset,
    })
}

/// True if `price` has crossed a position's liquidation price.
pub fn is_liquidated(position: &Position, price: Decimal) -> bool {
    match position.liquidation_price {
        None => false,
        Some(liq) => match position.side {
            PositionSide::Long => price <= liq,
            PositionSide::Short => price >= liq,
        },
    }
}

/// Every open and historical closed position for one portfolio, keyed by
/// `(symbol, side)` for open positions so long and short can coexist in
/// hedge-capable cross-margin accounts.
#[derive(Default)]
pub struct PositionBook {
    open: HashMap<(Symbol, PositionSide), Position>,
    closed: Vec<Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        PositionBook::default()
    }

    pub fn open_position(&self, symbol: &Symbol, side: PositionSide) -> Option<&Position> {
        self.open.get(&(symbol.clone(), side))
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.open.values()
    }

    pub fn open_positions_mut(&mut self) -> impl Iterator<Item = &mut Position> {
        self.open.values_mut()
    }

    pub fn closed_positions(&self) -> &[Position] {
        &self.closed
    }

    pub fn total_initial_margin(&self) -> Decimal {
        self.open
            .values()
            .map(|p| p.notional() / p.leverage.max(Decimal::ONE))
            .sum()
    }

    /// Apply a fill of `order_side` at `fill_price`/`fill_qty` to the book,
    /// reducing an opposite-side position first, then augmenting or opening
    /// a same-side position with any excess quantity. Returns the realized
    /// P&L delta produced by any reduction.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_fill(
        &mut self,
        portfolio_id: PortfolioId,
        symbol: &Symbol,
        order_side: Side,
        fill_price: Decimal,
        fill_qty: Decimal,
        leverage: Decimal,
        margin_mode: MarginMode,
        reduce_only: bool,
        fee_rate: Decimal,
    ) -> CoreResult<Decimal> {
        let opening_side = PositionSide::from_order_side(order_side);
        let reducing_side = opening_side.opposite();

        let mut realized = Decimal::ZERO;
        let mut excess = fill_qty;

        if let Some(existing) = self.open.get_mut(&(symbol.clone(), reducing_side)) {
            let reduce_qty = fill_qty.min(existing.quantity);
            let pnl_per_unit = match reducing_side {
                PositionSide::Long => fill_price - existing.entry_price,
                PositionSide::Short => existing.entry_price - fill_price,
            };
            realized = pnl_per_unit * reduce_qty;
            existing.quantity -= reduce_qty;
            existing.realized_pnl += realized;
            excess = fill_qty - reduce_qty;

            if existing.quantity.is_zero() {
                let mut closed = self.open.remove(&(symbol.clone(), reducing_side)).unwrap();
                closed.status = crate::domain::PositionStatus::Closed;
                closed.closed_at = Some(chrono::Utc::now());
                closed.liquidation_price = None;
                self.closed.push(closed);
            } else if leverage > Decimal::ONE {
                existing.liquidation_price = liquidation_price(
                    existing.entry_price,
                    existing.quantity,
                    existing.leverage,
                    fee_rate,
                    reducing_side,
                );
            }

            if excess > Decimal::ZERO && reduce_only {
                return Err(CoreError::ReduceOnlyExceedsPosition {
                    symbol: symbol.as_str().to_string(),
                    requested: fill_qty,
                    available: fill_qty - excess,
                });
            }
        } else if reduce_only {
            return Err(CoreError::ReduceOnlyNoPosition {
                symbol: symbol.as_str().to_string(),
            });
        }

        if excess > Decimal::ZERO {
            self.open_or_augment(
                portfolio_id,
                symbol,
                opening_side,
                fill_price,
                excess,
                leverage,
                margin_mode,
                fee_rate,
            );
        }

        Ok(realized)
    }

    #[allow(clippy::too_many_arguments)]
    fn open_or_augment(
        &mut self,
        portfolio_id: PortfolioId,
        symbol: &Symbol,
        side: PositionSide,
        fill_price: Decimal,
        fill_qty: Decimal,
        leverage: Decimal,
        margin_mode: MarginMode,
        fee_rate: Decimal,
    ) {
        let key = (symbol.clone(), side);
        if let Some(existing) = self.open.get_mut(&key) {
            let new_qty = existing.quantity + fill_qty;
            existing.entry_price =
                (existing.entry_price * existing.quantity + fill_price * fill_qty) / new_qty;
            existing.quantity = new_qty;
            existing.liquidation_price =
                liquidation_price(existing.entry_price, existing.quantity, existing.leverage, fee_rate, side);
        } else {
            let mut position = Position::open(
                portfolio_id,
                symbol.clone(),
                side,
                fill_price,
                fill_qty,
                leverage,
                margin_mode,
            );
            position.liquidation_price =
                liquidation_price(fill_price, fill_qty, leverage, fee_rate, side);
            self.open.insert(key, position);
        }
    }

    /// Close a position outright (liquidation or external close), archiving
    /// it into the closed-position history.
    pub fn force_close(&mut self, symbol: &Symbol, side: PositionSide, price: Decimal) -> Option<Decimal> {
        let mut position = self.open.remove(&(symbol.clone(), side))?;
        position.current_price = price;
        let pnl = position.unrealized_pnl();
        position.close(pnl);
        self.closed.push(position);
        Some(pnl)
    }

    pub fn mark_price(&mut self, symbol: &Symbol, price: Decimal) {
        for (key, position) in self.open.iter_mut() {
            if key.0 == *symbol {
                position.current_price = price;
            }
        }
    }
}

pub fn available_balance(portfolio: &Portfolio, book: &PositionBook, reserved_margin: Decimal) -> Decimal {
    portfolio.current_balance - book.total_initial_margin() - reserved_margin
}

pub fn funds_check(
    portfolio: &Portfolio,
    book: &PositionBook,
    reserved_margin: Decimal,
    quantity: Decimal,
    price: Decimal,
    leverage: Decimal,
    fee_rate: Decimal,
) -> FundsCheck {
    let notional = quantity * price;
    let required = notional / leverage.max(Decimal::ONE) + notional * fee_rate;
    let available = available_balance(portfolio, book, reserved_margin);
    FundsCheck {
        sufficient: available >= required,
        required,
        available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarginMode;

    #[test]
    fn scenario_s4_liquidation_price() {
        let liq = liquidation_price(dec!(100), dec!(10), dec!(10), dec!(0.0005), PositionSide::Long)
            .unwrap();
        assert_eq!(liq, dec!(95.1));
    }

    #[test]
    fn unleveraged_position_has_no_liquidation_price() {
        assert!(liquidation_price(dec!(100), dec!(1), dec!(1), dec!(0.0005), PositionSide::Long)
            .is_none());
    }

    #[test]
    fn scenario_s6_opposite_fill_closes_then_opens() {
        let portfolio_id = PortfolioId::next();
        let symbol = Symbol::new("BTC/USD");
        let mut book = PositionBook::new();

        book.apply_fill(
            portfolio_id,
            &symbol,
            Side::Buy,
            dec!(100),
            dec!(2),
            dec!(1),
            MarginMode::Cross,
            false,
            dec!(0),
        )
        .unwrap();

        let realized = book
            .apply_fill(
                portfolio_id,
                &symbol,
                Side::Sell,
                dec!(110),
                dec!(3),
                dec!(1),
                MarginMode::Cross,
                false,
                dec!(0),
            )
            .unwrap();

        assert_eq!(realized, dec!(20));
        assert!(book.open_position(&symbol, PositionSide::Long).is_none());
        let short = book.open_position(&symbol, PositionSide::Short).unwrap();
        assert_eq!(short.quantity, dec!(1));
        assert_eq!(short.entry_price, dec!(110));
    }

    #[test]
    fn vwap_averages_entries_on_augment() {
        let portfolio_id = PortfolioId::next();
        let symbol = Symbol::new("BTC/USD");
        let mut book = PositionBook::new();

        book.apply_fill(
            portfolio_id,
            &symbol,
            Side::Buy,
            dec!(100),
            dec!(1),
            dec!(1),
            MarginMode::Cross,
            false,
            dec!(0),
        )
        .unwrap();
        book.apply_fill(
            portfolio_id,
            &symbol,
            Side::Buy,
            dec!(200),
            dec!(1),
            dec!(1),
            MarginMode::Cross,
            false,
            dec!(0),
        )
        .unwrap();

        let pos = book.open_position(&symbol, PositionSide::Long).unwrap();
        assert_eq!(pos.entry_price, dec!(150));
        assert_eq!(pos.quantity, dec!(2));
    }

    #[test]
    fn reduce_only_without_position_is_rejected() {
        let portfolio_id = PortfolioId::next();
        let symbol = Symbol::new("BTC/USD");
        let mut book = PositionBook::new();
        let err = book
            .apply_fill(
                portfolio_id,
                &symbol,
                Side::Sell,
                dec!(100),
                dec!(1),
                dec!(1),
                MarginMode::Cross,
                true,
                dec!(0),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::ReduceOnlyNoPosition { .. }));
    }
}

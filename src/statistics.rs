//! Portfolio analytics computed read-only over closed positions and trades.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{Position, Side, Trade};

#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub total_trades: usize,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub profit_factor: f64,
    pub sharpe_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub max_drawdown_pct: Decimal,
    pub avg_holding_period_secs: Option<f64>,
    pub expectancy: Decimal,
    pub kelly_fraction: Decimal,
}

/// Computes `Statistics` for one portfolio from its closed positions and
/// fill history. Closed positions are expected in chronological order.
pub struct StatisticsCalculator;

impl StatisticsCalculator {
    pub fn compute(closed: &[Position], trades: &[Trade], initial_balance: Decimal) -> Statistics {
        if closed.is_empty() {
            return Statistics {
                total_trades: 0,
                win_rate: Decimal::ZERO,
                avg_win: Decimal::ZERO,
                avg_loss: Decimal::ZERO,
                largest_win: Decimal::ZERO,
                largest_loss: Decimal::ZERO,
                profit_factor: 0.0,
                sharpe_ratio: None,
                calmar_ratio: None,
                max_drawdown_pct: Decimal::ZERO,
                avg_holding_period_secs: None,
                expectancy: Decimal::ZERO,
                kelly_fraction: Decimal::ZERO,
            };
        }

        let pnls: Vec<Decimal> = closed.iter().map(|p| p.realized_pnl).collect();
        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();

        let win_rate = Decimal::from(wins.len() as u64) / Decimal::from(pnls.len() as u64);
        let avg_win = mean(&wins);
        let avg_loss = mean(&losses).abs();
        let largest_win = wins.iter().copied().fold(Decimal::ZERO, Decimal::max);
        let largest_loss = losses.iter().copied().fold(Decimal::ZERO, Decimal::min).abs();

        let gross_win: Decimal = wins.iter().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        let profit_factor = if gross_loss.is_zero() {
            if gross_win.is_zero() {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (gross_win / gross_loss).to_f64().unwrap_or(0.0)
        };

        let sharpe_ratio = sharpe(trades, initial_balance);
        let max_drawdown_pct = max_drawdown(&pnls, initial_balance);
        let calmar_ratio = calmar(&pnls, initial_balance, max_drawdown_pct);
        let avg_holding_period_secs = avg_holding_period(closed);

        let win_rate_f = win_rate.to_f64().unwrap_or(0.0);
        let expectancy = win_rate * avg_win - (Decimal::ONE - win_rate) * avg_loss;
        let kelly_fraction = kelly(win_rate_f, avg_win, avg_loss);

        Statistics {
            total_trades: pnls.len(),
            win_rate,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            profit_factor,
            sharpe_ratio,
            calmar_ratio,
            max_drawdown_pct,
            avg_holding_period_secs,
            expectancy,
            kelly_fraction,
        }
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len() as u64)
}

/// Signed cash flow of one fill relative to the account: a buy draws down
/// cash by notional plus fee, a sell returns notional minus fee.
fn trade_return(trade: &Trade) -> Decimal {
    match trade.side {
        Side::Buy => -(trade.notional() + trade.fee),
        Side::Sell => trade.notional() - trade.fee,
    }
}

/// Sharpe ratio of per-trade returns normalized by `initial_balance`,
/// annualized assuming a 365-trading-period year. `None` below two trades or
/// when the return series has zero/non-finite variance.
fn sharpe(trades: &[Trade], initial_balance: Decimal) -> Option<f64> {
    if trades.len() < 2 || initial_balance.is_zero() {
        return None;
    }
    let returns: Vec<f64> = trades
        .iter()
        .map(trade_return)
        .filter_map(|r| (r / initial_balance).to_f64())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let stdev = variance.sqrt();
    if !stdev.is_finite() || stdev == 0.0 {
        return None;
    }
    Some(mean / stdev * (365.0_f64).sqrt())
}

/// Max drawdown as a fraction (0.0-1.0) of the running peak equity, walking
/// `initial_balance + cumulative realized P&L` chronologically.
fn max_drawdown(pnls: &[Decimal], initial_balance: Decimal) -> Decimal {
    let mut cumulative = initial_balance;
    let mut peak = initial_balance;
    let mut worst = Decimal::ZERO;
    for pnl in pnls {
        cumulative += *pnl;
        if cumulative > peak {
            peak = cumulative;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - cumulative) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }
    worst
}

fn calmar(pnls: &[Decimal], initial_balance: Decimal, max_drawdown_pct: Decimal) -> Option<f64> {
    if max_drawdown_pct.is_zero() || initial_balance.is_zero() {
        return None;
    }
    let total_return: Decimal = pnls.iter().sum::<Decimal>() / initial_balance;
    let total_return = total_return.to_f64()?;
    let max_dd = max_drawdown_pct.to_f64()?;
    Some(total_return / max_dd)
}

fn avg_holding_period(closed: &[Position]) -> Option<f64> {
    let durations: Vec<f64> = closed
        .iter()
        .filter_map(|p| p.closed_at.map(|closed_at| (closed_at - p.opened_at).num_seconds() as f64))
        .collect();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<f64>() / durations.len() as f64)
}

/// Kelly criterion fraction, clamped to `[0, 0.25]` to avoid prescribing
/// aggressive sizing from noisy win-rate/payoff-ratio estimates.
fn kelly(win_rate: f64, avg_win: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return Decimal::ZERO;
    }
    let payoff_ratio = match (avg_win.to_f64(), avg_loss.to_f64()) {
        (Some(w), Some(l)) if l != 0.0 => w / l,
        _ => return Decimal::ZERO,
    };
    if payoff_ratio <= 0.0 {
        return Decimal::ZERO;
    }
    let raw = (win_rate * payoff_ratio - (1.0 - win_rate)) / payoff_ratio;
    let clamped = raw.clamp(0.0, 0.25);
    Decimal::from_f64_retain(clamped).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarginMode, OrderId, PortfolioId, PositionSide, Symbol};
    use rust_decimal_macros::dec;

    fn trade(side: Side, price: Decimal) -> Trade {
        Trade::new(PortfolioId::next(), OrderId::next(), Symbol::new("BTC/USD"), side, price, dec!(1), dec!(0.001), false)
    }

    fn closed_position(pnl: Decimal) -> Position {
        let mut pos = Position::open(
            PortfolioId::next(),
            Symbol::new("BTC/USD"),
            PositionSide::Long,
            dec!(100),
            dec!(1),
            dec!(1),
            MarginMode::Cross,
        );
        pos.close(pnl);
        pos
    }

    #[test]
    fn empty_history_yields_zeroed_statistics() {
        let stats = StatisticsCalculator::compute(&[], &[], dec!(10000));
        assert_eq!(stats.total_trades, 0);
        assert!(stats.sharpe_ratio.is_none());
    }

    #[test]
    fn profit_factor_is_infinite_with_only_wins() {
        let closed = vec![closed_position(dec!(10)), closed_position(dec!(20))];
        let stats = StatisticsCalculator::compute(&closed, &[], dec!(10000));
        assert_eq!(stats.profit_factor, f64::INFINITY);
        assert_eq!(stats.win_rate, Decimal::ONE);
    }

    #[test]
    fn profit_factor_is_gross_win_over_gross_loss() {
        let closed = vec![closed_position(dec!(30)), closed_position(dec!(-10))];
        let stats = StatisticsCalculator::compute(&closed, &[], dec!(10000));
        assert_eq!(stats.profit_factor, 3.0);
    }

    #[test]
    fn sharpe_is_none_below_two_trades() {
        let closed = vec![closed_position(dec!(10))];
        let trades = vec![trade(Side::Sell, dec!(110))];
        let stats = StatisticsCalculator::compute(&closed, &trades, dec!(10000));
        assert!(stats.sharpe_ratio.is_none());
    }

    #[test]
    fn sharpe_uses_trade_returns_not_position_pnls() {
        let closed = vec![closed_position(dec!(10))];
        let trades = vec![trade(Side::Buy, dec!(100)), trade(Side::Sell, dec!(110))];
        let stats = StatisticsCalculator::compute(&closed, &trades, dec!(10000));
        assert!(stats.sharpe_ratio.is_some());
    }

    #[test]
    fn max_drawdown_tracks_the_worst_peak_to_trough_decline() {
        let closed = vec![
            closed_position(dec!(1000)),
            closed_position(dec!(-500)),
            closed_position(dec!(-300)),
            closed_position(dec!(2000)),
        ];
        let stats = StatisticsCalculator::compute(&closed, &[], dec!(10000));
        // peak after first trade = 11000, trough after third = 10200
        let expected = (dec!(11000) - dec!(10200)) / dec!(11000);
        assert_eq!(stats.max_drawdown_pct, expected);
    }

    #[test]
    fn kelly_fraction_is_clamped_to_quarter() {
        let k = kelly(0.9, dec!(100), dec!(1));
        assert_eq!(k, dec!(0.25));
    }
}

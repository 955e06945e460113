//! Converts a reference price into a simulated execution price, accounting
//! for a configurable base slippage, order size, and recent volatility.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::{SlippageConfig, SlippageModel};
use crate::domain::{Side, Symbol};

/// Bounded history of recent prices for one symbol, used to estimate
/// short-term volatility for the volatility-adjusted slippage model.
struct VolatilityRing {
    capacity: usize,
    prices: VecDeque<f64>,
}

impl VolatilityRing {
    fn new(capacity: usize) -> Self {
        VolatilityRing {
            capacity,
            prices: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, price: Decimal) {
        let Some(price) = price.to_f64() else {
            return;
        };
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    /// Standard deviation of consecutive-price returns. Zero when there is
    /// not enough history to estimate it.
    fn sigma(&self) -> Decimal {
        if self.prices.len() < 3 {
            return Decimal::ZERO;
        }
        let returns: Vec<f64> = self
            .prices
            .iter()
            .zip(self.prices.iter().skip(1))
            .filter(|(prev, _)| **prev != 0.0)
            .map(|(prev, cur)| (cur - prev) / prev)
            .collect();
        if returns.len() < 2 {
            return Decimal::ZERO;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
        Decimal::from_f64_retain(variance.sqrt()).unwrap_or(Decimal::ZERO)
    }
}

pub struct SlippageCalculator {
    config: SlippageConfig,
    rings: Mutex<HashMap<Symbol, VolatilityRing>>,
    ring_capacity: usize,
    degenerate_inputs: AtomicU64,
}

impl SlippageCalculator {
    pub fn new(config: SlippageConfig, ring_capacity: usize) -> Self {
        SlippageCalculator {
            config,
            rings: Mutex::new(HashMap::new()),
            ring_capacity,
            degenerate_inputs: AtomicU64::new(0),
        }
    }

    /// Feed a newly observed price into the symbol's volatility ring.
    pub fn record_price(&self, symbol: &Symbol, price: Decimal) {
        let mut rings = self.rings.lock().expect("volatility ring lock poisoned");
        rings
            .entry(symbol.clone())
            .or_insert_with(|| VolatilityRing::new(self.ring_capacity))
            .push(price);
    }

    /// Count of calls that received a non-positive reference price and were
    /// passed through unchanged.
    pub fn degenerate_input_count(&self) -> u64 {
        self.degenerate_inputs.load(Ordering::Relaxed)
    }

    pub fn execution_price(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Decimal {
        if reference_price <= Decimal::ZERO {
            self.degenerate_inputs.fetch_add(1, Ordering::Relaxed);
            return reference_price;
        }

        let mut slip = self.config.base;

        if matches!(
            self.config.model,
            SlippageModel::SizeDependent | SlippageModel::VolatilityAdjusted
        ) {
            let notional = reference_price * quantity;
            slip += self.config.size_impact_factor * notional / dec!(10000);
        }

        if self.config.model == SlippageModel::VolatilityAdjusted {
            let sigma = {
                let rings = self.rings.lock().expect("volatility ring lock poisoned");
                rings.get(symbol).map(|r| r.sigma()).unwrap_or(Decimal::ZERO)
            };
            slip += self.config.vol_multiplier * sigma;
        }

        let price = match side {
            Side::Buy => reference_price * (Decimal::ONE + slip),
            Side::Sell => reference_price * (Decimal::ONE - slip),
        };

        price.max(Decimal::new(1, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(model: SlippageModel) -> SlippageCalculator {
        SlippageCalculator::new(
            SlippageConfig {
                base: dec!(0.001),
                model,
                size_impact_factor: dec!(1),
                vol_multiplier: dec!(1),
            },
            32,
        )
    }

    #[test]
    fn fixed_model_applies_base_slippage_for_buy() {
        let c = calc(SlippageModel::Fixed);
        let px = c.execution_price(&Symbol::new("BTC/USD"), Side::Buy, dec!(0.1), dec!(30000));
        assert_eq!(px, dec!(30030.000));
    }

    #[test]
    fn fixed_model_applies_base_slippage_for_sell() {
        let c = calc(SlippageModel::Fixed);
        let px = c.execution_price(&Symbol::new("BTC/USD"), Side::Sell, dec!(0.1), dec!(30000));
        assert_eq!(px, dec!(29970.000));
    }

    #[test]
    fn size_dependent_adds_notional_impact() {
        let c = calc(SlippageModel::SizeDependent);
        let px = c.execution_price(&Symbol::new("BTC/USD"), Side::Buy, dec!(1), dec!(10000));
        // base 0.001 + size_impact(1 * 10000/10000 = 1) => total slip 1.001
        assert_eq!(px, dec!(10000) * (Decimal::ONE + dec!(1.001)));
    }

    #[test]
    fn degenerate_reference_price_passes_through() {
        let c = calc(SlippageModel::Fixed);
        let px = c.execution_price(&Symbol::new("BTC/USD"), Side::Buy, dec!(1), Decimal::ZERO);
        assert_eq!(px, Decimal::ZERO);
        assert_eq!(c.degenerate_input_count(), 1);
    }

    #[test]
    fn volatility_adjusted_needs_history_before_it_contributes() {
        let c = calc(SlippageModel::VolatilityAdjusted);
        let symbol = Symbol::new("BTC/USD");
        let flat = c.execution_price(&symbol, Side::Buy, dec!(0), dec!(100));
        assert_eq!(flat, dec!(100.100));

        for p in [dec!(100), dec!(105), dec!(98), dec!(110), dec!(90)] {
            c.record_price(&symbol, p);
        }
        let with_history = c.execution_price(&symbol, Side::Buy, dec!(0), dec!(100));
        assert!(with_history > flat);
    }
}

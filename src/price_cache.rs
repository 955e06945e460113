//! Per-symbol quote cache with LRU eviction and asset-class-aware
//! freshness windows for both polled snapshots and streamed ticks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use crate::config::FreshnessWindow;
use crate::domain::{PriceSnapshot, Symbol};

pub struct PriceCache {
    capacity: usize,
    freshness: FreshnessWindow,
    snapshots: Mutex<HashMap<Symbol, PriceSnapshot>>,
    stream_ticks: Mutex<HashMap<Symbol, PriceSnapshot>>,
    lru: Mutex<VecDeque<Symbol>>,
}

impl PriceCache {
    pub fn new(capacity: usize, freshness: FreshnessWindow) -> Self {
        PriceCache {
            capacity,
            freshness,
            snapshots: Mutex::new(HashMap::new()),
            stream_ticks: Mutex::new(HashMap::new()),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    pub fn update_polled(&self, snapshot: PriceSnapshot) {
        let symbol = snapshot.symbol.clone();
        self.snapshots
            .lock()
            .expect("price cache poisoned")
            .insert(symbol.clone(), snapshot);
        self.touch(&symbol);
    }

    pub fn update_stream(&self, snapshot: PriceSnapshot) {
        let symbol = snapshot.symbol.clone();
        self.stream_ticks
            .lock()
            .expect("price cache poisoned")
            .insert(symbol.clone(), snapshot);
        self.touch(&symbol);
    }

    /// Freshest usable quote for `symbol`: a stream tick within its
    /// freshness window first, otherwise a polled snapshot within its
    /// (generally tighter) window, otherwise `None`.
    pub fn get(&self, symbol: &Symbol) -> Option<PriceSnapshot> {
        let now = Utc::now();
        if let Some(tick) = self.stream_ticks.lock().expect("price cache poisoned").get(symbol) {
            if tick.age_ms(now) <= self.freshness.stream_max_age_ms {
                return Some(tick.clone());
            }
        }
        if let Some(snap) = self.snapshots.lock().expect("price cache poisoned").get(symbol) {
            if snap.age_ms(now) <= self.freshness.poll_max_age_ms {
                return Some(snap.clone());
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.lru.lock().expect("price cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(&self, symbol: &Symbol) {
        let mut lru = self.lru.lock().expect("price cache poisoned");
        if let Some(pos) = lru.iter().position(|s| s == symbol) {
            lru.remove(pos);
        }
        lru.push_back(symbol.clone());

        while lru.len() > self.capacity {
            if let Some(evicted) = lru.pop_front() {
                self.snapshots.lock().expect("price cache poisoned").remove(&evicted);
                self.stream_ticks.lock().expect("price cache poisoned").remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, age_ms: i64) -> PriceSnapshot {
        PriceSnapshot {
            symbol: Symbol::new(symbol),
            bid: dec!(100),
            ask: dec!(101),
            last: dec!(100.5),
            timestamp: Utc::now() - chrono::Duration::milliseconds(age_ms),
        }
    }

    fn crypto_window() -> FreshnessWindow {
        crate::config::AssetClass::Crypto.freshness()
    }

    #[test]
    fn fresh_polled_snapshot_is_returned() {
        let cache = PriceCache::new(10, crypto_window());
        cache.update_polled(snapshot("BTC/USD", 0));
        assert!(cache.get(&Symbol::new("BTC/USD")).is_some());
    }

    #[test]
    fn stale_snapshot_is_not_returned() {
        let cache = PriceCache::new(10, crypto_window());
        cache.update_polled(snapshot("BTC/USD", 10_000));
        assert!(cache.get(&Symbol::new("BTC/USD")).is_none());
    }

    #[test]
    fn stream_tick_preferred_over_polled_snapshot() {
        let cache = PriceCache::new(10, crypto_window());
        let mut polled = snapshot("BTC/USD", 0);
        polled.last = dec!(100.5);
        cache.update_polled(polled);

        let mut tick = snapshot("BTC/USD", 0);
        tick.last = dec!(999);
        cache.update_stream(tick);

        assert_eq!(cache.get(&Symbol::new("BTC/USD")).unwrap().last, dec!(999));
    }

    #[test]
    fn lru_evicts_least_recently_used_symbol() {
        let cache = PriceCache::new(2, crypto_window());
        cache.update_polled(snapshot("A", 0));
        cache.update_polled(snapshot("B", 0));
        cache.update_polled(snapshot("C", 0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&Symbol::new("A")).is_none());
        assert!(cache.get(&Symbol::new("C")).is_some());
    }
}

//! Advisory, ordered, timed mutual exclusion over portfolio/symbol/order
//! keys. Acquiring several keys together always locks them in the same
//! global order, which is what makes the engine deadlock-free.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::{OrderId, PortfolioId, Symbol};

/// A resource a lock can be held on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Portfolio(PortfolioId),
    PortfolioSymbol(PortfolioId, Symbol),
    Order(OrderId),
}

impl LockKey {
    /// Namespace index used to give every key type a total order, so that
    /// locking `[Order, Portfolio, PortfolioSymbol]` in any input order
    /// always acquires Portfolio, then PortfolioSymbol, then Order.
    fn namespace(&self) -> u8 {
        match self {
            LockKey::Portfolio(_) => 0,
            LockKey::PortfolioSymbol(_, _) => 1,
            LockKey::Order(_) => 2,
        }
    }

    fn sort_key(&self) -> (u8, u64, String) {
        match self {
            LockKey::Portfolio(id) => (self.namespace(), id.0, String::new()),
            LockKey::PortfolioSymbol(id, symbol) => {
                (self.namespace(), id.0, symbol.as_str().to_string())
            }
            LockKey::Order(id) => (self.namespace(), id.0, String::new()),
        }
    }
}

/// One keyed advisory lock. Acquisition that exceeds the configured timeout
/// forcibly seizes the lock rather than block indefinitely; a warning is
/// logged and the caller proceeds as if it had acquired cleanly.
struct KeyLock {
    locked: AtomicBool,
    notify: Notify,
}

impl KeyLock {
    fn new() -> Self {
        KeyLock {
            locked: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    async fn acquire(&self, timeout: Duration, key: &LockKey) {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(?key, "lock wait exceeded timeout, forcing release");
                self.locked.store(true, Ordering::Release);
                self.notify.notify_waiters();
                return;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub struct TransactionLockManager {
    locks: Mutex<HashMap<LockKey, Arc<KeyLock>>>,
    timeout: Duration,
}

impl TransactionLockManager {
    pub fn new(timeout: Duration) -> Self {
        TransactionLockManager {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, key: &LockKey) -> Arc<KeyLock> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }

    /// Acquire every key in `keys` in deterministic order, run `f`, then
    /// release in reverse order regardless of how `f` completes.
    pub async fn with_locks<F, Fut, T>(&self, mut keys: Vec<LockKey>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        keys.sort_by_key(|k| k.sort_key());
        keys.dedup();

        let mut held = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.entry(key);
            lock.acquire(self.timeout, key).await;
            held.push(lock);
        }

        let result = f().await;

        for lock in held.into_iter().rev() {
            lock.release();
        }

        result
    }

    /// Force-release every outstanding lock and wake every waiter. Used on
    /// shutdown and account reset.
    pub fn clear_all_locks(&self) {
        let locks = self.locks.lock().expect("lock registry poisoned");
        for lock in locks.values() {
            lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn portfolio_key(id: u64) -> LockKey {
        LockKey::Portfolio(PortfolioId(id))
    }

    #[tokio::test]
    async fn serializes_access_to_the_same_key() {
        let manager = Arc::new(TransactionLockManager::new(Duration::from_secs(5)));
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .with_locks(vec![portfolio_key(1)], || async {
                        let before = counter.load(Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        counter.store(before + 1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn acquires_distinct_keys_in_deterministic_order() {
        let manager = TransactionLockManager::new(Duration::from_secs(5));
        let keys = vec![
            LockKey::Order(OrderId(5)),
            portfolio_key(2),
            LockKey::PortfolioSymbol(PortfolioId(2), Symbol::new("BTC/USD")),
        ];
        let result = manager.with_locks(keys, || async { 42 }).await;
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn force_release_lets_a_timed_out_waiter_proceed() {
        let manager = Arc::new(TransactionLockManager::new(Duration::from_millis(20)));
        let key = portfolio_key(9);

        let held_lock = manager.entry(&key);
        held_lock
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();

        let waited = manager.with_locks(vec![key], || async { "proceeded" }).await;
        assert_eq!(waited, "proceeded");
    }

    #[tokio::test]
    async fn clear_all_locks_wakes_waiters() {
        let manager = Arc::new(TransactionLockManager::new(Duration::from_secs(5)));
        let key = portfolio_key(3);
        let lock = manager.entry(&key);
        lock.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .unwrap();

        manager.clear_all_locks();
        let ran = manager.with_locks(vec![key], || async { true }).await;
        assert!(ran);
    }
}

// =============================================================================
// RollingWindowStore — bounded time-horizon quote windows, event-driven
// =============================================================================
//
// Generalizes the teacher's `CandleBuffer` (RwLock<HashMap<K, VecDeque<V>>>,
// trim-to-capacity ring buffer) from a count-bound ring keyed by a handful
// of fixed symbols into a time-bound window keyed by many `(exchange,
// symbol)` pairs. Unlike the teacher's buffer, the key set itself must be
// bounded here — many venues times many symbols can outgrow memory — so
// eviction also runs at the key level via a DashMap-backed LRU.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::{Exchange, Quote, Symbol};

/// A time-horizon-bounded sequence of quotes for one `(exchange, symbol)`.
pub struct RollingWindow {
    horizon: chrono::Duration,
    quotes: RwLock<VecDeque<Quote>>,
    last_touched: RwLock<DateTime<Utc>>,
}

impl RollingWindow {
    fn new(horizon: chrono::Duration) -> Self {
        Self {
            horizon,
            quotes: RwLock::new(VecDeque::new()),
            last_touched: RwLock::new(Utc::now()),
        }
    }

    fn push(&self, quote: Quote) {
        let mut quotes = self.quotes.write();
        quotes.push_back(quote);
        *self.last_touched.write() = Utc::now();
        self.evict_locked(&mut quotes);
    }

    fn evict_locked(&self, quotes: &mut VecDeque<Quote>) {
        let cutoff = Utc::now() - self.horizon;
        while quotes
            .front()
            .map(|q| q.effective_timestamp() < cutoff)
            .unwrap_or(false)
        {
            quotes.pop_front();
        }
    }

    /// Evict stale quotes without inserting anything. Called by the
    /// periodic cleanup task for windows that have gone quiet.
    pub fn evict(&self) {
        let mut quotes = self.quotes.write();
        self.evict_locked(&mut quotes);
    }

    /// Snapshot the current window, oldest first.
    pub fn snapshot(&self) -> Vec<Quote> {
        self.quotes.read().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        *self.last_touched.read()
    }
}

/// Emitted on every successful admission so interested consumers (the chart
/// assembler) can react instead of polling.
#[derive(Debug, Clone)]
pub struct WindowUpdated {
    pub exchange: Exchange,
    pub symbol: Symbol,
}

/// Store of `RollingWindow`s keyed by `(exchange, symbol)`, bounded both in
/// time (per window) and in key count (LRU eviction across windows).
pub struct RollingWindowStore {
    windows: DashMap<(Exchange, Symbol), Arc<RollingWindow>>,
    horizon: chrono::Duration,
    lru_capacity: usize,
    events_tx: broadcast::Sender<WindowUpdated>,
    /// Guards the batch-eviction pass. Tried, never awaited: if another
    /// admitter already holds it, this admission skips eviction and the
    /// next one over capacity tries again.
    eviction_lock: Mutex<()>,
}

impl RollingWindowStore {
    pub fn new(horizon: chrono::Duration, lru_capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(4096);
        Self {
            windows: DashMap::new(),
            horizon,
            lru_capacity,
            events_tx,
            eviction_lock: Mutex::new(()),
        }
    }

    /// Subscribe to `WindowUpdated` events. Lagging subscribers miss
    /// events rather than block the admission path (broadcast semantics).
    pub fn subscribe(&self) -> broadcast::Receiver<WindowUpdated> {
        self.events_tx.subscribe()
    }

    /// Admit a quote, creating the window if this is the first quote seen
    /// for `(exchange, symbol)`, and emit a `WindowUpdated` event.
    pub fn admit(&self, quote: Quote) {
        let key = (quote.exchange.clone(), quote.symbol.clone());
        let window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RollingWindow::new(self.horizon)))
            .clone();
        window.push(quote);

        let _ = self.events_tx.send(WindowUpdated {
            exchange: key.0,
            symbol: key.1,
        });

        if self.windows.len() > self.lru_capacity {
            self.evict_least_recently_touched();
        }
    }

    /// Batch-evict the bottom 10% of windows by last-touched time, in one
    /// pass under `eviction_lock`. The lock is tried rather than awaited:
    /// concurrent admitters that lose the race simply leave eviction to
    /// whichever admitter is already running it.
    fn evict_least_recently_touched(&self) {
        let Some(_guard) = self.eviction_lock.try_lock() else {
            return;
        };
        if self.windows.len() <= self.lru_capacity {
            return;
        }

        let mut entries: Vec<(Exchange, Symbol, DateTime<Utc>)> =
            self.windows.iter().map(|e| (e.key().0.clone(), e.key().1.clone(), e.value().last_touched())).collect();
        entries.sort_by_key(|(_, _, touched)| *touched);

        let evict_count = (entries.len() / 10).max(1);
        for (exchange, symbol, _) in entries.into_iter().take(evict_count) {
            debug!(exchange = %exchange, symbol = %symbol, "evicting least-recently-touched rolling window");
            self.windows.remove(&(exchange, symbol));
        }
    }

    pub fn window(&self, exchange: &Exchange, symbol: &Symbol) -> Option<Arc<RollingWindow>> {
        self.windows.get(&(exchange.clone(), symbol.clone())).map(|e| e.clone())
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Periodic sweep: evict stale quotes from every window and drop empty,
    /// long-untouched windows. Run on an interval from the orchestrator.
    pub fn cleanup(&self) {
        let mut to_remove = Vec::new();
        for entry in self.windows.iter() {
            entry.value().evict();
            if entry.value().is_empty() && Utc::now() - entry.value().last_touched() > self.horizon {
                to_remove.push(entry.key().clone());
            }
        }
        for key in to_remove {
            self.windows.remove(&key);
        }
    }
}

/// Spawn the periodic cleanup loop. Returns immediately; the loop runs
/// until `cancel` fires.
pub fn spawn_cleanup_task(
    store: Arc<RollingWindowStore>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    store.cleanup();
                    info!(keys = store.key_count(), "rolling window cleanup complete");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn quote(exchange: &str, symbol: &str, age_secs: i64) -> Quote {
        Quote {
            exchange: Exchange::new(exchange),
            symbol: crate::types::normalize(symbol),
            best_bid: Decimal::new(100, 0),
            best_ask: Decimal::new(101, 0),
            server_timestamp: None,
            local_timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn admit_creates_window_and_emits_event() {
        let store = RollingWindowStore::new(chrono::Duration::seconds(900), 100);
        let mut rx = store.subscribe();
        store.admit(quote("Binance", "BTC/USDT", 0));

        let event = rx.try_recv().expect("expected a WindowUpdated event");
        assert_eq!(event.exchange, Exchange::new("Binance"));
        assert_eq!(event.symbol.as_str(), "BTC_USDT");

        let window = store.window(&Exchange::new("Binance"), &crate::types::normalize("BTC/USDT")).unwrap();
        assert_eq!(window.snapshot().len(), 1);
    }

    #[test]
    fn window_evicts_quotes_older_than_horizon() {
        let store = RollingWindowStore::new(chrono::Duration::seconds(10), 100);
        store.admit(quote("Binance", "BTC_USDT", 20));
        store.admit(quote("Binance", "BTC_USDT", 0));

        let window = store.window(&Exchange::new("Binance"), &crate::types::normalize("BTC_USDT")).unwrap();
        assert_eq!(window.snapshot().len(), 1);
    }

    #[test]
    fn lru_evicts_when_key_capacity_exceeded() {
        let store = RollingWindowStore::new(chrono::Duration::seconds(900), 2);
        store.admit(quote("Binance", "A_USDT", 0));
        store.admit(quote("Binance", "B_USDT", 0));
        store.admit(quote("Binance", "C_USDT", 0));

        assert!(store.key_count() <= 2);
    }

    #[test]
    fn cleanup_removes_empty_stale_windows() {
        let store = RollingWindowStore::new(chrono::Duration::milliseconds(50), 100);
        store.admit(quote("Binance", "BTC_USDT", 0));
        std::thread::sleep(std::time::Duration::from_millis(120));
        store.cleanup();
        assert_eq!(store.key_count(), 0);
    }
}

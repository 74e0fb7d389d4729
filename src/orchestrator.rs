// =============================================================================
// Orchestrator — venue fleet, symbol selection, hot-path publish, health
// =============================================================================
//
// Startup sequencing and task spawning follow the teacher's `main.rs`; the
// central shared-state shape (per-subsystem Arcs behind `parking_lot`
// locks, periodic watchdog via `tokio::time::interval`) follows
// `app_state.rs`.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::broadcast::BroadcastHub;
use crate::channel;
use crate::config::AppConfig;
use crate::exchange::{self, shard_symbols, OnQuote, RawQuote, VenueAdapter};
use crate::rolling_window::RollingWindowStore;
use crate::types::{BroadcastMessage, Exchange, ExchangeStatus, Quote, Symbol, SymbolInfo, Trade};

/// Health record for one venue, exposed read-only via `/api/status`.
#[derive(Debug, Clone)]
pub struct VenueHealth {
    pub status: ExchangeStatus,
    pub last_quote_time: Option<chrono::DateTime<Utc>>,
}

/// Central shared state: the known symbol set, per-venue health, and the
/// two outbound bounded channels. One instance, held behind `Arc` by every
/// task that needs it.
pub struct Orchestrator {
    config: Arc<AppConfig>,
    known_symbols: RwLock<HashSet<(Exchange, Symbol)>>,
    health: DashMap<Exchange, VenueHealth>,
    last_trade: DashMap<(Exchange, Symbol), Trade>,
    pub persistence_tx: channel::Sender<Quote>,
    pub persistence_rx: parking_lot::Mutex<Option<channel::Receiver<Quote>>>,
    pub realtime_tx: channel::Sender<Quote>,
    pub rolling_window: Arc<RollingWindowStore>,
    pub broadcast: BroadcastHub,
}

impl Orchestrator {
    pub fn new(config: Arc<AppConfig>, rolling_window: Arc<RollingWindowStore>, broadcast: BroadcastHub) -> Arc<Self> {
        let (persistence_tx, persistence_rx) = channel::channel(config.channel_capacity);
        let (realtime_tx, realtime_rx) = channel::channel(config.channel_capacity);

        let this = Arc::new(Self {
            config,
            known_symbols: RwLock::new(HashSet::new()),
            health: DashMap::new(),
            last_trade: DashMap::new(),
            persistence_tx,
            persistence_rx: parking_lot::Mutex::new(Some(persistence_rx)),
            realtime_tx,
            rolling_window,
            broadcast,
        });

        // The realtime receiver feeds the rolling window directly; spawn
        // that consumer loop now so admission starts as soon as quotes
        // arrive.
        let orchestrator = this.clone();
        tokio::spawn(async move {
            let mut rx = realtime_rx;
            while let Some(quote) = rx.recv().await {
                orchestrator.rolling_window.admit(quote);
            }
        });

        this
    }

    /// Fetch tickers and symbol metadata for every configured venue,
    /// filter by volume and `USDT` quote, and register the surviving
    /// symbols. Returns the per-venue symbol list actually subscribed.
    #[instrument(skip(self, adapters))]
    pub async fn discover_symbols(
        &self,
        adapters: &[(Exchange, Arc<dyn VenueAdapter>)],
    ) -> Vec<(Exchange, Arc<dyn VenueAdapter>, Vec<Symbol>)> {
        let mut out = Vec::new();

        for (exchange, adapter) in adapters {
            let tickers = match adapter.list_tickers().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(exchange = %exchange, error = %e, "failed to list tickers, skipping venue at startup");
                    self.health.insert(
                        exchange.clone(),
                        VenueHealth {
                            status: ExchangeStatus::Stale,
                            last_quote_time: None,
                        },
                    );
                    continue;
                }
            };

            let eligible: HashSet<Symbol> = tickers
                .into_iter()
                .filter(|t| {
                    t.quote_volume >= self.config.volume_filter_min
                        && t.quote_volume <= self.config.volume_filter_max
                        && t.symbol.as_str().ends_with("USDT")
                })
                .map(|t| t.symbol)
                .collect();

            let symbol_infos: Vec<SymbolInfo> = match adapter.list_symbols().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(exchange = %exchange, error = %e, "failed to list symbols, skipping venue at startup");
                    continue;
                }
            };

            let mut symbols = Vec::new();
            {
                let mut known = self.known_symbols.write();
                for info in symbol_infos {
                    if !eligible.contains(&info.name) {
                        continue;
                    }
                    let key = (exchange.clone(), info.name.clone());
                    if known.insert(key) {
                        symbols.push(info.name);
                    }
                }
            }

            self.health.insert(
                exchange.clone(),
                VenueHealth {
                    status: ExchangeStatus::Starting,
                    last_quote_time: None,
                },
            );

            info!(exchange = %exchange, count = symbols.len(), "symbols selected for subscription");
            out.push((exchange.clone(), adapter.clone(), symbols));
        }

        out
    }

    /// Hot path: validate, normalize, stamp, compute `spread_pct`, and
    /// publish a raw venue quote into both outbound channels.
    fn publish_raw_quote(self: &Arc<Self>, exchange: Exchange, raw: RawQuote) {
        if raw.best_bid <= Decimal::ZERO || raw.best_ask <= Decimal::ZERO || raw.best_ask < raw.best_bid {
            return;
        }
        let symbol = crate::types::normalize(&raw.symbol_raw);
        let quote = Quote {
            exchange: exchange.clone(),
            symbol,
            best_bid: raw.best_bid,
            best_ask: raw.best_ask,
            server_timestamp: raw.server_timestamp,
            local_timestamp: Utc::now(),
        };

        self.health.entry(exchange).and_modify(|h| {
            h.status = ExchangeStatus::Healthy;
            h.last_quote_time = Some(quote.local_timestamp);
        });

        let spread_event = crate::types::SpreadEvent {
            exchange: quote.exchange.clone(),
            symbol: quote.symbol.clone(),
            best_bid: quote.best_bid,
            best_ask: quote.best_ask,
            spread_pct: quote.spread_pct(),
            min_volume: self.config.volume_filter_min,
            max_volume: self.config.volume_filter_max,
            timestamp: quote.local_timestamp,
        };
        self.broadcast.publish(BroadcastMessage::spread(spread_event));

        self.persistence_tx.send(quote.clone());
        self.realtime_tx.send(quote);
    }

    /// Spawn the venue fleet: one `run_venue` task per configured exchange,
    /// each driving its own shards. Returns once every venue task has been
    /// spawned (not once they complete — they run until `cancel` fires).
    pub async fn spawn_venues(self: &Arc<Self>, cancel: CancellationToken) {
        let mut adapters = Vec::new();
        for name in &self.config.exchanges {
            match exchange::venue_by_name(name) {
                Some(adapter) => adapters.push((adapter.exchange(), adapter)),
                None => warn!(exchange = %name, "unknown venue name in config, skipping"),
            }
        }

        let selected = self.discover_symbols(&adapters).await;

        for (_exchange, adapter, symbols) in selected {
            let shards = shard_symbols(&symbols, adapter.chunk_size(), adapter.supports_combined_stream());
            let (health_tx, _health_rx) = tokio::sync::watch::channel(Vec::new());

            let this = self.clone();
            let on_quote: OnQuote = Arc::new(move |exchange, raw| {
                this.publish_raw_quote(exchange, raw);
            });

            let cancel = cancel.clone();
            tokio::spawn(exchange::run_venue(adapter, shards, on_quote, cancel, health_tx));
        }
    }

    /// Watchdog: mark venues with no quote observed in the last minute as
    /// `Stale`. Runs on an interval until `cancel` fires.
    pub fn spawn_watchdog(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stale_after = chrono::Duration::seconds(60);
                        for mut entry in this.health.iter_mut() {
                            if let Some(last) = entry.last_quote_time {
                                if Utc::now() - last > stale_after && entry.status == ExchangeStatus::Healthy {
                                    warn!(exchange = %entry.key(), "no quotes in the last minute, marking stale");
                                    entry.status = ExchangeStatus::Stale;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn health_snapshot(&self) -> Vec<(Exchange, VenueHealth)> {
        self.health.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub fn known_symbol_count(&self) -> usize {
        self.known_symbols.read().len()
    }

    pub fn record_trade(&self, trade: Trade) {
        self.last_trade.insert((trade.exchange.clone(), trade.symbol.clone()), trade);
    }

    pub fn last_trade(&self, exchange: &Exchange, symbol: &Symbol) -> Option<Trade> {
        self.last_trade.get(&(exchange.clone(), symbol.clone())).map(|e| e.clone())
    }

    /// Take the persistence-channel receiver. Callable exactly once; the
    /// parquet-writer wiring in `main` is the only consumer.
    pub fn take_persistence_receiver(&self) -> Option<channel::Receiver<Quote>> {
        self.persistence_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            exchanges: vec!["Binance".to_string()],
            ..AppConfig::default()
        })
    }

    #[tokio::test]
    async fn publish_raw_quote_rejects_crossed_book() {
        let config = test_config();
        let store = Arc::new(RollingWindowStore::new(config.window_duration(), config.rolling_window_lru_capacity));
        let orchestrator = Orchestrator::new(config, store.clone(), BroadcastHub::new());

        orchestrator.publish_raw_quote(
            Exchange::new("Binance"),
            RawQuote {
                symbol_raw: "BTCUSDT".to_string(),
                best_bid: Decimal::new(100, 0),
                best_ask: Decimal::new(99, 0),
                server_timestamp: None,
            },
        );
        tokio::task::yield_now().await;
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn publish_raw_quote_admits_valid_quote() {
        let config = test_config();
        let store = Arc::new(RollingWindowStore::new(config.window_duration(), config.rolling_window_lru_capacity));
        let orchestrator = Orchestrator::new(config, store.clone(), BroadcastHub::new());

        orchestrator.publish_raw_quote(
            Exchange::new("Binance"),
            RawQuote {
                symbol_raw: "BTC/USDT".to_string(),
                best_bid: Decimal::new(100, 0),
                best_ask: Decimal::new(101, 0),
                server_timestamp: None,
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.key_count(), 1);

        let health = orchestrator.health_snapshot();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].1.status, ExchangeStatus::Healthy);
    }
}

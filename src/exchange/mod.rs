// =============================================================================
// Exchange adapters — one shared sharded-connection harness, 8 thin venues
// =============================================================================
//
// Every venue needs the identical shard/reconnect/backoff machinery and
// differs only in URL templates, REST discovery endpoints, and wire-format
// parsing. `VenueAdapter` captures that difference; `run_adapter` is the one
// harness every venue plugs into. Grounded on the connect/split/loop shape
// of the teacher's `run_trade_stream`/`run_depth_stream`, generalized from
// one bespoke function per venue into a trait plus a single generic driver.
// =============================================================================

mod bingx;
mod binance;
mod bitget;
mod bybit;
mod gate;
mod kucoin;
mod mexc;
mod okx;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

/// A parsed top-of-book payload, shard-local until the caller stamps the
/// exchange and normalizes the symbol.
pub struct RawQuote {
    pub symbol_raw: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Per-shard lifecycle, mirrored into the health registry for `/api/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Created,
    Subscribing,
    Subscribed,
    ConnectionLost,
    Reconnecting,
    Stopped,
}

/// Everything a venue must supply to plug into the shared harness. Every
/// method is cheap/pure except `parse_message`, which runs on the hot path.
pub trait VenueAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// Symbols this shard should carry per connection before a new shard is
    /// opened. See SPEC_FULL.md §4.1's per-venue adapter table.
    fn chunk_size(&self) -> usize;

    /// `false` for venues with no combined multi-symbol stream (BingX):
    /// the orchestrator then opens one shard per symbol regardless of
    /// `chunk_size`.
    fn supports_combined_stream(&self) -> bool {
        true
    }

    /// REST symbol discovery. Errors are logged by the caller; the venue
    /// adapter does not retry internally.
    fn list_symbols(&self) -> futures_util::future::BoxFuture<'_, Result<Vec<SymbolInfo>>>;

    /// REST 24h ticker volumes, used for the pre-subscribe volume filter.
    fn list_tickers(&self) -> futures_util::future::BoxFuture<'_, Result<Vec<TickerVolume>>>;

    /// WebSocket URL for one shard. Venues with per-symbol-only streams
    /// (BingX) encode the single symbol directly into the URL.
    fn ws_url(&self, symbols: &[Symbol]) -> String;

    /// Subscribe payload sent immediately after connect, or `None` when the
    /// URL alone determines the stream (no separate subscribe frame).
    fn subscribe_message(&self, symbols: &[Symbol]) -> Option<String>;

    /// Parse one inbound text frame into a quote, if it is one. Returns
    /// `Ok(None)` for control/ack frames that are not quotes; malformed
    /// quote payloads (missing bid/ask) are also `Ok(None)` — dropped
    /// silently per SPEC_FULL.md §4.1.
    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>>;
}

/// Health snapshot for one shard, read by the orchestrator's watchdog and
/// exposed via `/api/status`.
#[derive(Debug, Clone)]
pub struct ShardHealth {
    pub exchange: Exchange,
    pub shard_index: usize,
    pub symbol_count: usize,
    pub state: ShardState,
    pub last_message_at: Option<DateTime<Utc>>,
    pub reconnect_count: u64,
}

struct ShardHandle {
    state: Mutex<ShardState>,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    reconnect_count: AtomicU64,
    resubscribe_lock: tokio::sync::Mutex<()>,
}

impl ShardHandle {
    fn new() -> Self {
        Self {
            state: Mutex::new(ShardState::Created),
            last_message_at: Mutex::new(None),
            reconnect_count: AtomicU64::new(0),
            resubscribe_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn set(&self, state: ShardState) {
        *self.state.lock() = state;
    }

    fn get(&self) -> ShardState {
        *self.state.lock()
    }
}

/// Callback invoked once per validated, normalized quote. Runs on the
/// shard's I/O task; must be cheap and re-entrant across shards.
pub type OnQuote = Arc<dyn Fn(Exchange, RawQuote) + Send + Sync>;

/// Drive every shard for one venue until `cancel` fires. Shards run as
/// independent tasks so a stuck or reconnecting shard never blocks others.
#[instrument(skip(adapter, shard_groups, on_quote, cancel), fields(exchange = %adapter.exchange()))]
pub async fn run_venue(
    adapter: Arc<dyn VenueAdapter>,
    shard_groups: Vec<Vec<Symbol>>,
    on_quote: OnQuote,
    cancel: CancellationToken,
    health_tx: watch::Sender<Vec<ShardHealth>>,
) {
    let exchange = adapter.exchange();
    let handles: Vec<Arc<ShardHandle>> = shard_groups.iter().map(|_| Arc::new(ShardHandle::new())).collect();

    let mut tasks = Vec::new();
    for (index, symbols) in shard_groups.iter().cloned().enumerate() {
        let adapter = adapter.clone();
        let on_quote = on_quote.clone();
        let cancel = cancel.clone();
        let handle = handles[index].clone();
        tasks.push(tokio::spawn(run_shard(
            adapter, index, symbols, on_quote, cancel, handle,
        )));
    }

    let reporter_handles = handles.clone();
    let reporter_exchange = exchange.clone();
    let reporter_symbol_counts: Vec<usize> = shard_groups.iter().map(|g| g.len()).collect();
    let reporter_cancel = cancel.clone();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = reporter_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot: Vec<ShardHealth> = reporter_handles
                        .iter()
                        .enumerate()
                        .map(|(i, h)| ShardHealth {
                            exchange: reporter_exchange.clone(),
                            shard_index: i,
                            symbol_count: reporter_symbol_counts.get(i).copied().unwrap_or(0),
                            state: h.get(),
                            last_message_at: *h.last_message_at.lock(),
                            reconnect_count: h.reconnect_count.load(Ordering::Relaxed),
                        })
                        .collect();
                    let _ = health_tx.send(snapshot);
                }
            }
        }
    });

    cancel.cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    reporter.abort();
}

async fn run_shard(
    adapter: Arc<dyn VenueAdapter>,
    index: usize,
    symbols: Vec<Symbol>,
    on_quote: OnQuote,
    cancel: CancellationToken,
    handle: Arc<ShardHandle>,
) {
    let exchange = adapter.exchange();
    let mut backoff = Duration::from_secs(1);

    loop {
        if cancel.is_cancelled() {
            handle.set(ShardState::Stopped);
            return;
        }

        let _guard = handle.resubscribe_lock.lock().await;
        handle.set(ShardState::Subscribing);

        match connect_and_stream(&adapter, index, &symbols, &on_quote, &cancel, &handle).await {
            Ok(()) => {
                // Cancelled cleanly or stream ended without error.
                if cancel.is_cancelled() {
                    handle.set(ShardState::Stopped);
                    return;
                }
                handle.set(ShardState::ConnectionLost);
            }
            Err(e) => {
                warn!(exchange = %exchange, shard = index, error = %e, "shard connection failed");
                handle.set(ShardState::ConnectionLost);
            }
        }
        drop(_guard);

        handle.reconnect_count.fetch_add(1, Ordering::Relaxed);
        handle.set(ShardState::Reconnecting);
        tokio::select! {
            _ = cancel.cancelled() => {
                handle.set(ShardState::Stopped);
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

async fn connect_and_stream(
    adapter: &Arc<dyn VenueAdapter>,
    index: usize,
    symbols: &[Symbol],
    on_quote: &OnQuote,
    cancel: &CancellationToken,
    handle: &Arc<ShardHandle>,
) -> Result<()> {
    let exchange = adapter.exchange();
    let url = adapter.ws_url(symbols);
    info!(exchange = %exchange, shard = index, url = %url, "connecting shard");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to venue WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    if let Some(sub) = adapter.subscribe_message(symbols) {
        write
            .send(Message::Text(sub))
            .await
            .context("failed to send subscribe frame")?;
    }
    handle.set(ShardState::Subscribed);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        *handle.last_message_at.lock() = Some(Utc::now());
                        match adapter.parse_message(&text) {
                            Ok(Some(raw)) => on_quote(exchange.clone(), raw),
                            Ok(None) => {}
                            Err(e) => warn!(exchange = %exchange, shard = index, error = %e, "failed to parse venue message"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(exchange = %exchange, shard = index, error = %e, "shard read error");
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

/// Split `symbols` into shards of at most `chunk_size` each. A venue with
/// no combined stream yields one shard per symbol regardless of
/// `chunk_size` (see [`VenueAdapter::supports_combined_stream`]).
pub fn shard_symbols(symbols: &[Symbol], chunk_size: usize, supports_combined_stream: bool) -> Vec<Vec<Symbol>> {
    if symbols.is_empty() {
        return Vec::new();
    }
    let effective_chunk = if supports_combined_stream { chunk_size.max(1) } else { 1 };
    symbols
        .chunks(effective_chunk)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Resolve a venue adapter by its configured name, case-sensitively matching
/// the canonical venue names in [`crate::config::AppConfig::exchanges`].
pub fn venue_by_name(name: &str) -> Option<Arc<dyn VenueAdapter>> {
    let adapter: Arc<dyn VenueAdapter> = match name {
        "Binance" => Arc::new(binance::BinanceAdapter::new()),
        "Bybit" => Arc::new(bybit::BybitAdapter::new()),
        "OKX" => Arc::new(okx::OkxAdapter::new()),
        "Kucoin" => Arc::new(kucoin::KucoinAdapter::new()),
        "Gate" => Arc::new(gate::GateAdapter::new()),
        "MEXC" => Arc::new(mexc::MexcAdapter::new()),
        "Bitget" => Arc::new(bitget::BitgetAdapter::new()),
        "BingX" => Arc::new(bingx::BingxAdapter::new()),
        _ => return None,
    };
    Some(adapter)
}

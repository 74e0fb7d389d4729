// =============================================================================
// Canonical data model — quotes, trades, spreads, symbol metadata
// =============================================================================
//
// All price fields use `rust_decimal::Decimal` rather than `f64` so that the
// parquet round-trip at Decimal(28,10) is lossless. Symbols are normalized to
// `BASE_QUOTE` (see `normalize`) the instant they cross the venue boundary;
// nothing downstream of the exchange adapters ever sees a venue-native form.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short venue label, e.g. `Binance`, `Bybit`. Freely cloned/hashed/compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Exchange(pub String);

impl Exchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Exchange {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Canonical trading pair in `BASE_QUOTE` uppercase form. Construct only via
/// [`normalize`] — the newtype does not validate on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form for the data-lake partition path: canonical
    /// symbol with `/` rewritten to `#`. Never used in memory or wire
    /// formats, only in path construction.
    pub fn fs_safe(&self) -> String {
        self.0.replace('/', "#")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize a venue-native symbol string into canonical `BASE_QUOTE` form.
///
/// Replaces `/`, `-`, and spaces with `_`, uppercases, and collapses runs of
/// duplicate underscores. Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> Symbol {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;

    for ch in raw.trim().chars() {
        let mapped = match ch {
            '/' | '-' | ' ' | '_' => '_',
            other => other,
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped.to_ascii_uppercase());
    }

    let trimmed = out.trim_matches('_').to_string();
    Symbol(trimmed)
}

/// Canonical top-of-book tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// Timestamp reported by the venue, when available. Preferred over
    /// `local_timestamp` for staleness checks.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Stamped at the edge on receipt.
    pub local_timestamp: DateTime<Utc>,
}

impl Quote {
    /// The timestamp used for windowing and staleness: server time if the
    /// venue supplied one, otherwise local receipt time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.server_timestamp.unwrap_or(self.local_timestamp)
    }

    /// `(best_ask - best_bid) / best_bid * 100`, or `None` when `best_bid`
    /// is zero (division-by-zero is never attempted).
    pub fn spread_pct(&self) -> Option<Decimal> {
        if self.best_bid.is_zero() {
            return None;
        }
        Some((self.best_ask - self.best_bid) / self.best_bid * Decimal::ONE_HUNDRED)
    }

    pub fn is_valid(&self) -> bool {
        self.best_bid > Decimal::ZERO && self.best_ask > Decimal::ZERO && self.best_ask >= self.best_bid
    }
}

/// Trade side as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single executed trade. Only venues that supply a trade stream populate
/// this; it feeds the last-trade cache exposed via `/api/status`, not the
/// rolling window or the data lake (see SPEC_FULL.md open questions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: TradeSide,
    pub timestamp: DateTime<Utc>,
}

/// Published on the broadcast fan-out for downstream execution bots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadEvent {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread_pct: Option<Decimal>,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Envelope matching the wire format in SPEC_FULL.md §6:
/// `{ "MessageType": "Spread", "Payload": SpreadEvent }`.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMessage {
    #[serde(rename = "MessageType")]
    pub message_type: &'static str,
    #[serde(rename = "Payload")]
    pub payload: SpreadEvent,
}

impl BroadcastMessage {
    pub fn spread(event: SpreadEvent) -> Self {
        Self {
            message_type: "Spread",
            payload: event,
        }
    }
}

/// Tradable-symbol metadata for one venue. Deduplicated by `(exchange, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub exchange: Exchange,
    pub name: Symbol,
    pub price_step: Decimal,
    pub quantity_step: Decimal,
    pub min_notional: Decimal,
}

/// A 24h ticker entry used for the volume pre-filter.
#[derive(Debug, Clone)]
pub struct TickerVolume {
    pub symbol: Symbol,
    pub quote_volume: Decimal,
}

/// A `(symbol, exchange1, exchange2)` triple selected by offline analytics
/// and loaded from the opportunity CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: Symbol,
    pub exchange1: Exchange,
    pub exchange2: Exchange,
    pub opportunity_cycles_040bp: f64,
}

/// A per-opportunity chart frame: aligned spread series plus rolling
/// percentile bands. Field names follow the camelCase wire contract for
/// `/ws/realtime_charts` and `/api/dashboard_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartFrame {
    pub symbol: Symbol,
    pub exchange1: Exchange,
    pub exchange2: Exchange,
    pub timestamps: Vec<DateTime<Utc>>,
    pub spreads: Vec<Option<f64>>,
    pub upper_band: Vec<Option<f64>>,
    pub lower_band: Vec<Option<f64>>,
}

impl ChartFrame {
    pub fn empty(symbol: Symbol, exchange1: Exchange, exchange2: Exchange) -> Self {
        Self {
            symbol,
            exchange1,
            exchange2,
            timestamps: Vec::new(),
            spreads: Vec::new(),
            upper_band: Vec::new(),
            lower_band: Vec::new(),
        }
    }
}

/// Health status of a single exchange connection fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    Starting,
    Healthy,
    Stale,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Healthy => write!(f, "Healthy"),
            Self::Stale => write!(f, "Stale"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_all_separator_forms() {
        assert_eq!(normalize("BTC/USDT").as_str(), "BTC_USDT");
        assert_eq!(normalize("BTC-USDT").as_str(), "BTC_USDT");
        assert_eq!(normalize("btc usdt").as_str(), "BTC_USDT");
        assert_eq!(normalize("BTC_USDT").as_str(), "BTC_USDT");
    }

    #[test]
    fn normalize_collapses_duplicate_underscores() {
        assert_eq!(normalize("BTC//USDT").as_str(), "BTC_USDT");
        assert_eq!(normalize("BTC--USDT").as_str(), "BTC_USDT");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["BTC/USDT", "eth-usdt", "SOL USDT", "XRP_USDT"] {
            let once = normalize(raw);
            let twice = normalize(once.as_str());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn fs_safe_rewrites_slash_only() {
        let sym = Symbol("BTC_USDT".to_string());
        assert_eq!(sym.fs_safe(), "BTC_USDT");
    }

    #[test]
    fn spread_pct_null_on_zero_bid() {
        let q = Quote {
            exchange: Exchange::new("Binance"),
            symbol: normalize("BTC/USDT"),
            best_bid: Decimal::ZERO,
            best_ask: Decimal::new(1, 0),
            server_timestamp: None,
            local_timestamp: Utc::now(),
        };
        assert_eq!(q.spread_pct(), None);
    }

    #[test]
    fn quote_validity() {
        let base = Quote {
            exchange: Exchange::new("Binance"),
            symbol: normalize("BTC/USDT"),
            best_bid: Decimal::new(60000, 0),
            best_ask: Decimal::new(60001, 0),
            server_timestamp: None,
            local_timestamp: Utc::now(),
        };
        assert!(base.is_valid());

        let mut bad = base.clone();
        bad.best_ask = Decimal::new(59999, 0);
        assert!(!bad.is_valid());

        let mut zero = base;
        zero.best_bid = Decimal::ZERO;
        assert!(!zero.is_valid());
    }
}

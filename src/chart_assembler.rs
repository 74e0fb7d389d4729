// =============================================================================
// ChartAssembler — WindowUpdated → per-opportunity chart frames
// =============================================================================
//
// Pure join/percentile math lives as free functions over slices, in the
// teacher's `indicators/*` style. The per-consumer coalescing and send-lock
// discipline is grounded on `api/ws.rs`'s per-connection throttled push.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::AppConfig;
use crate::rolling_window::{RollingWindowStore, WindowUpdated};
use crate::types::{ChartFrame, Exchange, Opportunity, Quote, Symbol};

/// Drop quotes older than `max_age` relative to now. Enforces
/// `StaleQuoteMaxAge` at the as-of join boundary: a venue that has stopped
/// publishing must not keep contributing frozen prices to a join.
fn filter_fresh(quotes: &[Quote], now: DateTime<Utc>, max_age: chrono::Duration) -> Vec<Quote> {
    quotes.iter().filter(|q| now - q.effective_timestamp() <= max_age).cloned().collect()
}

/// A single `(tA, bidA, tB, bidB)` row surviving the as-of join.
struct JoinedRow {
    timestamp: DateTime<Utc>,
    bid_a: f64,
    bid_b: f64,
}

/// Backward as-of join of `window_a` onto `window_b`: for each quote in A,
/// find the latest quote in B at or before A's timestamp, dropping rows
/// with no match or where the gap exceeds `tolerance`.
fn as_of_join(window_a: &[Quote], window_b: &[Quote], tolerance: chrono::Duration) -> Vec<JoinedRow> {
    let mut rows = Vec::with_capacity(window_a.len());
    let mut b_idx = 0usize;

    for qa in window_a {
        let ta = qa.effective_timestamp();
        while b_idx + 1 < window_b.len() && window_b[b_idx + 1].effective_timestamp() <= ta {
            b_idx += 1;
        }
        if window_b.is_empty() {
            continue;
        }
        let qb = &window_b[b_idx];
        let tb = qb.effective_timestamp();
        if tb > ta || ta - tb > tolerance {
            continue;
        }
        let (Some(bid_a), Some(bid_b)) = (qa.best_bid.to_f64(), qb.best_bid.to_f64()) else {
            continue;
        };
        rows.push(JoinedRow {
            timestamp: ta,
            bid_a,
            bid_b,
        });
    }
    rows
}

/// `(bidA / bidB - 1) * 100`, or `None` when `bidB` is zero or the result
/// is non-finite.
fn spread_from_bids(bid_a: f64, bid_b: f64) -> Option<f64> {
    if bid_b == 0.0 {
        return None;
    }
    let value = (bid_a / bid_b - 1.0) * 100.0;
    value.is_finite().then_some(value)
}

/// Percentile by the ceiling rule: `idx = ceil(n * q) - 1`, clamped to
/// `[0, n-1]`. `values` need not be sorted; this function sorts a local
/// copy.
fn percentile(values: &[f64], quantile: f64) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = finite.len();
    let idx = ((n as f64 * quantile).ceil() as isize - 1).clamp(0, n as isize - 1) as usize;
    Some(finite[idx])
}

/// Rolling percentile bands over a trailing window of `window_size`
/// samples, one output per input index.
fn rolling_bands(spreads: &[Option<f64>], window_size: usize, upper_q: f64, lower_q: f64) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut upper = Vec::with_capacity(spreads.len());
    let mut lower = Vec::with_capacity(spreads.len());
    for i in 0..spreads.len() {
        let start = i.saturating_sub(window_size.saturating_sub(1));
        let slice: Vec<f64> = spreads[start..=i].iter().filter_map(|v| *v).collect();
        upper.push(percentile(&slice, upper_q));
        lower.push(percentile(&slice, lower_q));
    }
    (upper, lower)
}

/// Build a `ChartFrame` for one opportunity from the two windows' current
/// snapshots. Returns `None` if the join produces no rows. Quotes older
/// than `config.stale_quote_max_age()` are dropped from each side before
/// joining, per SPEC_FULL.md §9's staleness policy.
pub fn assemble_frame(opportunity: &Opportunity, window_a: &[Quote], window_b: &[Quote], config: &AppConfig) -> Option<ChartFrame> {
    let now = Utc::now();
    let max_age = config.stale_quote_max_age();
    let fresh_a = filter_fresh(window_a, now, max_age);
    let fresh_b = filter_fresh(window_b, now, max_age);

    let rows = as_of_join(&fresh_a, &fresh_b, config.asof_tolerance());
    if rows.is_empty() {
        return None;
    }

    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
    let spreads: Vec<Option<f64>> = rows.iter().map(|r| spread_from_bids(r.bid_a, r.bid_b)).collect();
    let (upper_band, lower_band) = rolling_bands(
        &spreads,
        config.percentile_window,
        config.percentile_quantiles.upper,
        config.percentile_quantiles.lower,
    );

    Some(ChartFrame {
        symbol: opportunity.symbol.clone(),
        exchange1: opportunity.exchange1.clone(),
        exchange2: opportunity.exchange2.clone(),
        timestamps,
        spreads,
        upper_band,
        lower_band,
    })
}

/// Per-consumer-per-symbol coalescing: supersede a pending send if one
/// arrives within `COALESCE_WINDOW` of the last.
pub struct Coalescer {
    window: Duration,
    last_sent: AsyncMutex<HashMap<(Exchange, Exchange, Symbol), DateTime<Utc>>>,
}

impl Coalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if a frame for this key should be assembled and sent
    /// now; `false` if a send happened too recently and this event should
    /// be superseded.
    pub async fn should_send(&self, key: (Exchange, Exchange, Symbol)) -> bool {
        let mut last_sent = self.last_sent.lock().await;
        let now = Utc::now();
        let ready = match last_sent.get(&key) {
            Some(last) => now.signed_duration_since(*last).to_std().unwrap_or(Duration::ZERO) >= self.window,
            None => true,
        };
        if ready {
            last_sent.insert(key, now);
        }
        ready
    }
}

/// Run the chart assembler: react to `WindowUpdated` events, rebuild chart
/// frames for every opportunity touching the updated window, and hand them
/// to `on_frame`. Runs until the event channel closes.
pub async fn run_chart_assembler(
    store: Arc<RollingWindowStore>,
    config: Arc<AppConfig>,
    opportunities: impl Fn() -> Vec<Opportunity> + Send + Sync + 'static,
    coalesce_window: Duration,
    on_frame: impl Fn(ChartFrame) + Send + Sync + 'static,
) {
    let mut events = store.subscribe();
    let coalescer = Arc::new(Coalescer::new(coalesce_window));

    loop {
        let event: WindowUpdated = match events.recv().await {
            Ok(e) => e,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "chart assembler fell behind WindowUpdated events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        for opp in opportunities() {
            let touches = (opp.exchange1 == event.exchange || opp.exchange2 == event.exchange) && opp.symbol == event.symbol;
            if !touches {
                continue;
            }
            let key = (opp.exchange1.clone(), opp.exchange2.clone(), opp.symbol.clone());
            let coalescer = coalescer.clone();
            if !coalescer.should_send(key).await {
                continue;
            }

            let Some(window_a) = store.window(&opp.exchange1, &opp.symbol) else {
                continue;
            };
            let Some(window_b) = store.window(&opp.exchange2, &opp.symbol) else {
                continue;
            };
            let snapshot_a = window_a.snapshot();
            let snapshot_b = window_b.snapshot();

            if let Some(frame) = assemble_frame(&opp, &snapshot_a, &snapshot_b, &config) {
                on_frame(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn q(bid: i64, secs_ago: i64) -> Quote {
        Quote {
            exchange: Exchange::new("X"),
            symbol: crate::types::normalize("BTC_USDT"),
            best_bid: Decimal::new(bid, 0),
            best_ask: Decimal::new(bid + 1, 0),
            server_timestamp: None,
            local_timestamp: Utc::now() - chrono::Duration::seconds(secs_ago),
        }
    }

    #[test]
    fn as_of_join_matches_latest_b_at_or_before_a() {
        let window_a = vec![q(100, 0)];
        let window_b = vec![q(90, 5), q(95, 1)];
        let rows = as_of_join(&window_a, &window_b, chrono::Duration::seconds(2));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bid_b, 95.0);
    }

    #[test]
    fn as_of_join_drops_rows_outside_tolerance() {
        let window_a = vec![q(100, 0)];
        let window_b = vec![q(90, 10)];
        let rows = as_of_join(&window_a, &window_b, chrono::Duration::seconds(2));
        assert!(rows.is_empty());
    }

    #[test]
    fn spread_from_bids_null_on_zero_denominator() {
        assert_eq!(spread_from_bids(100.0, 0.0), None);
    }

    #[test]
    fn percentile_ceiling_rule() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.97), Some(10.0));
        assert_eq!(percentile(&values, 0.03), Some(1.0));
    }

    #[test]
    fn percentile_ignores_non_finite_values() {
        let values = vec![1.0, f64::NAN, f64::INFINITY, 2.0];
        assert_eq!(percentile(&values, 1.0), Some(2.0));
    }

    #[tokio::test]
    async fn coalescer_suppresses_rapid_repeats() {
        let coalescer = Coalescer::new(Duration::from_millis(200));
        let key = (Exchange::new("A"), Exchange::new("B"), crate::types::normalize("BTC_USDT"));
        assert!(coalescer.should_send(key.clone()).await);
        assert!(!coalescer.should_send(key.clone()).await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(coalescer.should_send(key).await);
    }
}

// =============================================================================
// HistoricalReader — parquet partition scan, merge, NDJSON streaming
// =============================================================================
//
// Generalizes `binance::client`'s REST-array-to-typed-rows parsing
// (`get_klines`) to a parquet row-group scan, and leans on axum's
// streaming-body idiom (the teacher already depends on axum/tower-http)
// for the bounded-memory NDJSON response.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, Float64Array, StringArray, TimestampMillisecondArray};
use chrono::{TimeZone, Utc};
use futures_util::stream::{self, Stream};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::AppConfig;
use crate::types::{ChartFrame, Exchange, Opportunity, Quote, Symbol};

/// Enumerate every `.parquet` file under `root/exchange={E}/symbol={SymbolFS}`,
/// across all dates and hours.
fn partition_files(root: &Path, exchange: &Exchange, symbol: &Symbol) -> Vec<PathBuf> {
    let base = root
        .join(format!("exchange={}", exchange.as_str()))
        .join(format!("symbol={}", symbol.fs_safe()));

    let mut files = Vec::new();
    let mut stack = vec![base];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                files.push(path);
            }
        }
    }
    files
}

/// Read every quote out of one parquet file. Malformed files are logged
/// and skipped rather than aborting the whole scan.
fn read_quotes(path: &Path, exchange: &Exchange, symbol: &Symbol) -> Result<Vec<Quote>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read parquet metadata from {}", path.display()))?
        .build()
        .with_context(|| format!("failed to build arrow reader for {}", path.display()))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("failed to decode record batch in {}", path.display()))?;
        let timestamps = batch
            .column_by_name("Timestamp")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
            .context("missing Timestamp column")?;
        let best_bids = batch
            .column_by_name("BestBid")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .context("missing BestBid column")?;
        let best_asks = batch
            .column_by_name("BestAsk")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .context("missing BestAsk column")?;

        for row in 0..batch.num_rows() {
            let Some(ts) = Utc.timestamp_millis_opt(timestamps.value(row)).single() else {
                continue;
            };
            out.push(Quote {
                exchange: exchange.clone(),
                symbol: symbol.clone(),
                best_bid: Decimal::try_from(best_bids.value(row)).unwrap_or(Decimal::ZERO),
                best_ask: Decimal::try_from(best_asks.value(row)).unwrap_or(Decimal::ZERO),
                server_timestamp: Some(ts),
                local_timestamp: ts,
            });
        }
    }
    Ok(out)
}

/// Read and merge every partitioned quote for `(exchange, symbol)`,
/// sorted by timestamp. Runs blocking file I/O; call from
/// `spawn_blocking`.
pub fn load_symbol_history(root: &Path, exchange: &Exchange, symbol: &Symbol) -> Vec<Quote> {
    let files = partition_files(root, exchange, symbol);
    let mut quotes = Vec::new();
    for file in files {
        match read_quotes(&file, exchange, symbol) {
            Ok(mut rows) => quotes.append(&mut rows),
            Err(e) => warn!(path = %file.display(), error = %e, "skipping unreadable parquet partition"),
        }
    }
    quotes.sort_by_key(|q| q.effective_timestamp());
    quotes
}

/// Assemble the historical chart frame for one opportunity by loading both
/// sides' full history and running the same as-of join + percentile
/// pipeline used for realtime updates.
pub fn load_opportunity_frame(root: &Path, opportunity: &Opportunity, config: &AppConfig) -> Option<ChartFrame> {
    let window_a = load_symbol_history(root, &opportunity.exchange1, &opportunity.symbol);
    let window_b = load_symbol_history(root, &opportunity.exchange2, &opportunity.symbol);
    crate::chart_assembler::assemble_frame(opportunity, &window_a, &window_b, config)
}

/// Stream the NDJSON body for `GET /api/dashboard_data`: one `ChartFrame`
/// JSON object per line, one line per opportunity with a non-empty join.
/// Each opportunity's history is loaded and joined on demand inside
/// `spawn_blocking`, so server memory is bounded by one frame at a time
/// rather than the whole response.
pub fn dashboard_ndjson_stream(
    root: PathBuf,
    config: Arc<AppConfig>,
    opportunities: Vec<Opportunity>,
) -> impl Stream<Item = Result<String, std::io::Error>> {
    stream::unfold((opportunities.into_iter(), root, config), |(mut remaining, root, config)| async move {
        loop {
            let opportunity = remaining.next()?;
            let root_for_blocking = root.clone();
            let config_for_blocking = config.clone();
            let frame = tokio::task::spawn_blocking(move || {
                load_opportunity_frame(&root_for_blocking, &opportunity, &config_for_blocking)
            })
            .await
            .unwrap_or(None);

            let Some(frame) = frame else {
                continue;
            };
            let mut line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "failed to serialize chart frame");
                    continue;
                }
            };
            line.push('\n');
            return Some((Ok(line), (remaining, root, config)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_files_returns_empty_for_missing_root() {
        let root = std::env::temp_dir().join(format!("hist-test-missing-{}", uuid::Uuid::new_v4()));
        let files = partition_files(&root, &Exchange::new("Binance"), &crate::types::normalize("BTC_USDT"));
        assert!(files.is_empty());
    }

    #[test]
    fn load_symbol_history_is_empty_when_no_partitions_exist() {
        let root = std::env::temp_dir().join(format!("hist-test-empty-{}", uuid::Uuid::new_v4()));
        let history = load_symbol_history(&root, &Exchange::new("Binance"), &crate::types::normalize("BTC_USDT"));
        assert!(history.is_empty());
    }
}

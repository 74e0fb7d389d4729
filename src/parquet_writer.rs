// =============================================================================
// ParquetWriter — partitioned columnar persistence, single serialized writer
// =============================================================================
//
// The orchestrator's persistence consumer batches quotes per partition in
// memory and hands off an immutable snapshot to one dedicated writer task,
// mirroring the teacher's single-serialized-task + channel-consumer-loop
// pattern used throughout `main.rs`. The arrow/parquet pairing itself is
// grounded on the only pack reference with a working feature set for it.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::types::{Exchange, Quote, Symbol};

/// Key identifying one partition: `exchange={E}/symbol={SymbolFS}/date={YYYY-MM-DD}/hour={HH}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub exchange: Exchange,
    pub symbol: Symbol,
    pub date: String,
    pub hour: String,
}

impl PartitionKey {
    pub fn from_quote(quote: &Quote) -> Self {
        let ts = quote.effective_timestamp();
        Self {
            exchange: quote.exchange.clone(),
            symbol: quote.symbol.clone(),
            date: ts.format("%Y-%m-%d").to_string(),
            hour: ts.format("%H").to_string(),
        }
    }

    pub fn dir(&self, root: &std::path::Path) -> PathBuf {
        root.join(format!("exchange={}", self.exchange.as_str()))
            .join(format!("symbol={}", self.symbol.fs_safe()))
            .join(format!("date={}", self.date))
            .join(format!("hour={}", self.hour))
    }
}

/// An immutable snapshot of one partition's buffered quotes, ready to
/// write. No reference to a live in-progress buffer ever crosses this
/// boundary.
pub struct WriteRequest {
    pub partition: PartitionKey,
    pub quotes: Arc<Vec<Quote>>,
    /// Used to build a collision-free file name: `spreads-{mm-ss.fffffff}.parquet`.
    pub flushed_at: DateTime<Utc>,
}

fn quote_schema() -> Schema {
    Schema::new(vec![
        Field::new("Timestamp", DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())), false),
        Field::new("BestBid", DataType::Float64, false),
        Field::new("BestAsk", DataType::Float64, false),
        Field::new("SpreadPercentage", DataType::Float64, true),
        Field::new("MinVolume", DataType::Float64, false),
        Field::new("MaxVolume", DataType::Float64, false),
        Field::new("Exchange", DataType::Utf8, false),
        Field::new("Symbol", DataType::Utf8, false),
    ])
}

/// Build one `RecordBatch` from a partition's quote snapshot.
///
/// Decimal fields are stored as `Float64` here: arrow's 128-bit decimal
/// array requires a fixed scale/precision agreed with downstream readers,
/// and this system already treats `rust_decimal::Decimal` as the
/// lossless-at-the-edge representation — the parquet copy only needs to
/// survive a single round trip through the visualization reader, which
/// consumes floats.
fn build_record_batch(
    quotes: &[Quote],
    min_volume: f64,
    max_volume: f64,
) -> Result<RecordBatch> {
    let schema = Arc::new(quote_schema());

    let timestamps: Vec<i64> = quotes.iter().map(|q| q.effective_timestamp().timestamp_millis()).collect();
    let best_bids: Vec<f64> = quotes.iter().map(|q| q.best_bid.to_f64().unwrap_or(0.0)).collect();
    let best_asks: Vec<f64> = quotes.iter().map(|q| q.best_ask.to_f64().unwrap_or(0.0)).collect();
    let spread_pcts: Vec<Option<f64>> = quotes
        .iter()
        .map(|q| q.spread_pct().and_then(|d| d.to_f64()).filter(|v| v.is_finite()))
        .collect();
    let min_volumes: Vec<f64> = vec![min_volume; quotes.len()];
    let max_volumes: Vec<f64> = vec![max_volume; quotes.len()];
    let exchanges: Vec<String> = quotes.iter().map(|q| q.exchange.as_str().to_string()).collect();
    let symbols: Vec<String> = quotes.iter().map(|q| q.symbol.as_str().to_string()).collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampMillisecondArray::from(timestamps).with_timezone("UTC")),
            Arc::new(Float64Array::from(best_bids)),
            Arc::new(Float64Array::from(best_asks)),
            Arc::new(Float64Array::from(spread_pcts)),
            Arc::new(Float64Array::from(min_volumes)),
            Arc::new(Float64Array::from(max_volumes)),
            Arc::new(StringArray::from(exchanges)),
            Arc::new(StringArray::from(symbols)),
        ],
    )
    .context("failed to construct record batch")?;

    Ok(batch)
}

/// In-memory per-partition buffer owned by the orchestrator's persistence
/// consumer. Not shared across tasks; flushes hand off an immutable copy.
#[derive(Default)]
pub struct PartitionBuffers {
    buffers: HashMap<PartitionKey, Vec<Quote>>,
}

impl PartitionBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `quote`, returning a ready-to-flush snapshot if `batch_size`
    /// was reached for its partition. The live buffer is cleared on flush.
    pub fn push(&mut self, quote: Quote, batch_size: usize) -> Option<(PartitionKey, Arc<Vec<Quote>>)> {
        let key = PartitionKey::from_quote(&quote);
        let buffer = self.buffers.entry(key.clone()).or_default();
        buffer.push(quote);
        if buffer.len() >= batch_size {
            let snapshot = Arc::new(std::mem::take(buffer));
            return Some((key, snapshot));
        }
        None
    }

    /// Force-flush every non-empty partition (used on the flush timer and
    /// on shutdown).
    pub fn drain_all(&mut self) -> Vec<(PartitionKey, Arc<Vec<Quote>>)> {
        let mut out = Vec::new();
        for (key, buffer) in self.buffers.iter_mut() {
            if !buffer.is_empty() {
                out.push((key.clone(), Arc::new(std::mem::take(buffer))));
            }
        }
        out
    }
}

/// Handle for enqueuing write requests onto the serialized writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
    queue_depth: Arc<AtomicUsize>,
}

impl WriterHandle {
    pub fn enqueue(&self, request: WriteRequest) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(request).is_err() {
            warn!("parquet writer task is gone; dropping write request");
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }
}

/// Spawn the single serialized writer task. All flushes across every
/// partition funnel through this one task, so writes are never
/// interleaved and at most one flush is in-flight.
pub fn spawn_writer(
    root: PathBuf,
    min_volume: f64,
    max_volume: f64,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteRequest>();
    let queue_depth = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle {
        tx,
        queue_depth: queue_depth.clone(),
    };

    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            queue_depth.fetch_sub(1, Ordering::Relaxed);
            let root = root.clone();
            let result = tokio::task::spawn_blocking(move || write_partition(&root, &request, min_volume, max_volume)).await;
            match result {
                Ok(Ok(path)) => info!(path = %path.display(), "parquet batch written"),
                Ok(Err(e)) => error!(error = %e, "failed to write parquet batch"),
                Err(e) => error!(error = %e, "parquet writer blocking task panicked"),
            }
        }
    });

    (handle, task)
}

fn write_partition(root: &std::path::Path, request: &WriteRequest, min_volume: f64, max_volume: f64) -> Result<PathBuf> {
    let dir = request.partition.dir(root);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create partition dir {}", dir.display()))?;

    let file_name = format!(
        "spreads-{}.parquet",
        request.flushed_at.format("%M-%S.%9f")
    );
    let path = dir.join(file_name);

    let batch = build_record_batch(&request.quotes, min_volume, max_volume)?;
    let file = std::fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).context("failed to construct ArrowWriter")?;
    writer.write(&batch).context("failed to write record batch")?;
    writer.close().context("failed to close parquet writer")?;

    Ok(path)
}

/// Periodic flush timer: force-flush any non-empty partitions that have
/// not reached `batch_size` naturally, so data is not stuck indefinitely
/// under low traffic.
pub fn spawn_flush_timer(
    buffers: Arc<tokio::sync::Mutex<PartitionBuffers>>,
    writer: WriterHandle,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut guard = buffers.lock().await;
                    for (partition, snapshot) in guard.drain_all() {
                        writer.enqueue(WriteRequest { partition, quotes: snapshot, flushed_at: Utc::now() });
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let mut guard = buffers.lock().await;
                    for (partition, snapshot) in guard.drain_all() {
                        writer.enqueue(WriteRequest { partition, quotes: snapshot, flushed_at: Utc::now() });
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn quote(exchange: &str, symbol: &str) -> Quote {
        Quote {
            exchange: Exchange::new(exchange),
            symbol: crate::types::normalize(symbol),
            best_bid: Decimal::new(100, 0),
            best_ask: Decimal::new(101, 0),
            server_timestamp: None,
            local_timestamp: Utc::now(),
        }
    }

    #[test]
    fn partition_key_uses_fs_safe_symbol() {
        let q = quote("Binance", "BTC/USDT");
        let key = PartitionKey::from_quote(&q);
        let dir = key.dir(std::path::Path::new("/lake"));
        assert!(dir.to_string_lossy().contains("symbol=BTC_USDT"));
    }

    #[test]
    fn buffer_flushes_at_batch_size() {
        let mut buffers = PartitionBuffers::new();
        let mut flushed = None;
        for _ in 0..3 {
            flushed = buffers.push(quote("Binance", "BTC_USDT"), 3);
        }
        assert!(flushed.is_some());
        let (_, snapshot) = flushed.unwrap();
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn drain_all_clears_partial_buffers() {
        let mut buffers = PartitionBuffers::new();
        buffers.push(quote("Binance", "BTC_USDT"), 100);
        let drained = buffers.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(buffers.drain_all().is_empty());
    }

    #[test]
    fn record_batch_has_expected_row_count() {
        let quotes = vec![quote("Binance", "BTC_USDT"), quote("Binance", "BTC_USDT")];
        let batch = build_record_batch(&quotes, 1.0, 2.0).unwrap();
        assert_eq!(batch.num_rows(), 2);
    }
}

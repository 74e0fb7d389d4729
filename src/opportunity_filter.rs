// =============================================================================
// OpportunityFilter — newest-CSV discovery with a TTL cache
// =============================================================================
//
// Grounded on `fm0668-CrossFury`'s `csv` dependency for the parse, and the
// teacher's `Instant`-keyed cache fields in `app_state.rs`
// (`last_reconcile_ok: RwLock<Option<Instant>>`) for the TTL pattern.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::{Exchange, Opportunity};

#[derive(serde::Deserialize)]
struct OpportunityRow {
    symbol: String,
    exchange1: String,
    exchange2: String,
    opportunity_cycles_040bp: f64,
}

/// Find the most recently modified `.csv` file directly under `dir`.
fn newest_csv(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|ext| ext.to_str()) == Some("csv"))
        .max_by_key(|e| e.metadata().and_then(|m| m.modified()).ok())
        .map(|e| e.path())
}

fn load_opportunities(path: &Path, threshold: f64) -> Result<Vec<Opportunity>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for record in reader.deserialize() {
        let row: OpportunityRow = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "skipping malformed opportunity row");
                continue;
            }
        };
        if row.opportunity_cycles_040bp <= threshold {
            continue;
        }
        out.push(Opportunity {
            symbol: crate::types::normalize(&row.symbol),
            exchange1: Exchange::new(row.exchange1),
            exchange2: Exchange::new(row.exchange2),
            opportunity_cycles_040bp: row.opportunity_cycles_040bp,
        });
    }
    out.sort_by(|a, b| (a.symbol.as_str(), a.exchange1.as_str()).cmp(&(b.symbol.as_str(), b.exchange1.as_str())));
    Ok(out)
}

struct Cached {
    opportunities: Vec<Opportunity>,
    fetched_at: Instant,
    source: Option<PathBuf>,
}

/// Caches the parsed opportunity list for `ttl`, re-scanning `dir` for the
/// newest CSV only when the cache has expired.
pub struct OpportunityFilter {
    dir: PathBuf,
    threshold: f64,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl OpportunityFilter {
    pub fn new(dir: PathBuf, threshold: f64, ttl: Duration) -> Self {
        Self {
            dir,
            threshold,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current opportunity list, refreshing from disk if the cache is
    /// stale. Returns an empty list (never an error) if no CSV exists or
    /// the newest one fails to parse — the caller treats "no opportunities
    /// yet" as a normal state, not a fault.
    pub fn current(&self) -> Vec<Opportunity> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.opportunities.clone();
            }
        }
        self.refresh()
    }

    fn refresh(&self) -> Vec<Opportunity> {
        let Some(path) = newest_csv(&self.dir) else {
            *self.cache.write() = Some(Cached {
                opportunities: Vec::new(),
                fetched_at: Instant::now(),
                source: None,
            });
            return Vec::new();
        };

        let opportunities = match load_opportunities(&path, self.threshold) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load opportunities, keeping previous set");
                return self.cache.read().as_ref().map(|c| c.opportunities.clone()).unwrap_or_default();
            }
        };

        info!(path = %path.display(), count = opportunities.len(), "opportunities refreshed");
        *self.cache.write() = Some(Cached {
            opportunities: opportunities.clone(),
            fetched_at: Instant::now(),
            source: Some(path),
        });
        opportunities
    }

    pub fn source_path(&self) -> Option<PathBuf> {
        self.cache.read().as_ref().and_then(|c| c.source.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, rows: &[(&str, &str, &str, f64)]) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "symbol,exchange1,exchange2,opportunity_cycles_040bp").unwrap();
        for (symbol, e1, e2, val) in rows {
            writeln!(file, "{symbol},{e1},{e2},{val}").unwrap();
        }
        path
    }

    #[test]
    fn filters_by_threshold_and_normalizes_symbol() {
        let dir = std::env::temp_dir().join(format!("opp-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write_csv(
            &dir,
            "snap.csv",
            &[("BTC/USDT", "Binance", "Bybit", 50.0), ("eth-usdt", "OKX", "Gate", 10.0)],
        );

        let filter = OpportunityFilter::new(dir.clone(), 40.0, Duration::from_secs(10));
        let opps = filter.current();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].symbol.as_str(), "BTC_USDT");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn returns_empty_when_no_csv_present() {
        let dir = std::env::temp_dir().join(format!("opp-test-empty-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let filter = OpportunityFilter::new(dir.clone(), 40.0, Duration::from_secs(10));
        assert!(filter.current().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn caches_within_ttl() {
        let dir = std::env::temp_dir().join(format!("opp-test-ttl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        write_csv(&dir, "snap.csv", &[("BTC/USDT", "Binance", "Bybit", 50.0)]);

        let filter = OpportunityFilter::new(dir.clone(), 40.0, Duration::from_secs(60));
        let first = filter.current();
        // Removing the file must not affect a cached read within the TTL.
        std::fs::remove_file(dir.join("snap.csv")).unwrap();
        let second = filter.current();
        assert_eq!(first.len(), second.len());

        std::fs::remove_dir_all(&dir).ok();
    }
}

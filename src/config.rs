// =============================================================================
// Application configuration — single bundle, hot-loadable, atomic save
// =============================================================================
//
// Every tunable lives here so the engine never needs a code change to retune
// a window, threshold, or listen address. All fields carry `#[serde(default
// = "...")]` so that adding a field never breaks loading an older config
// file. Persistence uses the atomic tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors that prevent the process from entering the hot loop at all.
/// Every other runtime error is recovered locally and logged instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("data lake root '{0}' does not exist and could not be created: {1}")]
    DataLakeRootUnavailable(String, std::io::Error),
    #[error("no exchanges enabled in ExchangeSettings.Exchanges")]
    NoExchangesEnabled,
    #[error("unknown venue name '{0}' in ExchangeSettings.Exchanges")]
    UnknownVenue(String),
    #[error("invalid listen address '{0}': {1}")]
    InvalidListenAddress(String, std::net::AddrParseError),
}

fn default_data_lake_path() -> String {
    "./data-lake".to_string()
}

fn default_stats_path() -> String {
    "./analytics".to_string()
}

fn default_exchanges() -> Vec<String> {
    vec![
        "Binance".to_string(),
        "Bybit".to_string(),
        "OKX".to_string(),
        "Kucoin".to_string(),
        "Gate".to_string(),
        "MEXC".to_string(),
        "Bitget".to_string(),
        "BingX".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10_000
}

fn default_window_duration_secs() -> i64 {
    15 * 60
}

fn default_percentile_window() -> usize {
    200
}

fn default_upper_quantile() -> f64 {
    0.97
}

fn default_lower_quantile() -> f64 {
    0.03
}

fn default_asof_tolerance_secs() -> i64 {
    2
}

fn default_min_volume() -> Decimal {
    Decimal::new(2_000_000, 0)
}

fn default_max_volume() -> Decimal {
    Decimal::new(100_000_000_000, 0)
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_realtime_path() -> String {
    "/ws/realtime_charts".to_string()
}

fn default_health_check_path() -> String {
    "/api/health".to_string()
}

fn default_stale_quote_max_age_secs() -> i64 {
    7
}

fn default_opportunity_threshold() -> f64 {
    40.0
}

fn default_opportunity_cache_ttl_secs() -> u64 {
    10
}

fn default_lru_capacity() -> usize {
    50_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_coalesce_window_ms() -> u64 {
    250
}

/// Percentile quantiles for the rolling band computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileQuantiles {
    #[serde(default = "default_upper_quantile")]
    pub upper: f64,
    #[serde(default = "default_lower_quantile")]
    pub lower: f64,
}

impl Default for PercentileQuantiles {
    fn default() -> Self {
        Self {
            upper: default_upper_quantile(),
            lower: default_lower_quantile(),
        }
    }
}

/// Per-venue credentials. Only required for venues that publish private
/// streams; public market-data paths work anonymously.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub exchange_name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("exchange_name", &self.exchange_name)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_lake_path")]
    pub data_lake_path: String,

    #[serde(default = "default_stats_path")]
    pub analyzer_stats_path: String,

    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<String>,

    #[serde(default)]
    pub exchange_configs: Vec<ExchangeConfig>,

    #[serde(default = "default_true")]
    pub recording_enabled: bool,

    #[serde(default = "default_batch_size")]
    pub recording_batch_size: usize,

    #[serde(default = "default_window_duration_secs")]
    pub window_duration_secs: i64,

    #[serde(default = "default_percentile_window")]
    pub percentile_window: usize,

    #[serde(default)]
    pub percentile_quantiles: PercentileQuantiles,

    #[serde(default = "default_asof_tolerance_secs")]
    pub asof_tolerance_secs: i64,

    #[serde(default = "default_min_volume")]
    pub volume_filter_min: Decimal,

    #[serde(default = "default_max_volume")]
    pub volume_filter_max: Decimal,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_realtime_path")]
    pub realtime_path: String,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    #[serde(default = "default_stale_quote_max_age_secs")]
    pub stale_quote_max_age_secs: i64,

    #[serde(default = "default_opportunity_threshold")]
    pub opportunity_threshold: f64,

    #[serde(default = "default_opportunity_cache_ttl_secs")]
    pub opportunity_cache_ttl_secs: u64,

    #[serde(default = "default_lru_capacity")]
    pub rolling_window_lru_capacity: usize,

    #[serde(default = "default_cleanup_interval_secs")]
    pub rolling_window_cleanup_interval_secs: u64,

    #[serde(default = "default_coalesce_window_ms")]
    pub chart_coalesce_window_ms: u64,

    /// Bounded channel capacity shared by the persistence and realtime
    /// channels (drop-oldest on overflow).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    100_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_lake_path: default_data_lake_path(),
            analyzer_stats_path: default_stats_path(),
            exchanges: default_exchanges(),
            exchange_configs: Vec::new(),
            recording_enabled: true,
            recording_batch_size: default_batch_size(),
            window_duration_secs: default_window_duration_secs(),
            percentile_window: default_percentile_window(),
            percentile_quantiles: PercentileQuantiles::default(),
            asof_tolerance_secs: default_asof_tolerance_secs(),
            volume_filter_min: default_min_volume(),
            volume_filter_max: default_max_volume(),
            listen_address: default_listen_address(),
            realtime_path: default_realtime_path(),
            health_check_path: default_health_check_path(),
            stale_quote_max_age_secs: default_stale_quote_max_age_secs(),
            opportunity_threshold: default_opportunity_threshold(),
            opportunity_cache_ttl_secs: default_opportunity_cache_ttl_secs(),
            rolling_window_lru_capacity: default_lru_capacity(),
            rolling_window_cleanup_interval_secs: default_cleanup_interval_secs(),
            chart_coalesce_window_ms: default_coalesce_window_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`. If the file does not
    /// exist, returns an error so the caller can fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(path = %path.display(), exchanges = ?config.exchanges, "config loaded");
        Ok(config)
    }

    /// Persist the current configuration using an atomic write (tmp +
    /// rename) so a crash mid-write never corrupts the file on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Validate fields that must hold before the hot loop starts. Returns
    /// the fatal `ConfigError` that should set the process exit code.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.exchanges.is_empty() {
            return Err(ConfigError::NoExchangesEnabled);
        }
        for name in &self.exchanges {
            if crate::exchange::venue_by_name(name).is_none() {
                return Err(ConfigError::UnknownVenue(name.clone()));
            }
        }
        if let Err(e) = std::fs::create_dir_all(&self.data_lake_path) {
            return Err(ConfigError::DataLakeRootUnavailable(
                self.data_lake_path.clone(),
                e,
            ));
        }
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddress(self.listen_address.clone(), e))?;
        Ok(())
    }

    pub fn window_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_duration_secs)
    }

    pub fn asof_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.asof_tolerance_secs)
    }

    pub fn stale_quote_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_quote_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.exchanges.len(), 8);
        assert_eq!(cfg.recording_batch_size, 10_000);
        assert_eq!(cfg.window_duration_secs, 900);
        assert_eq!(cfg.percentile_window, 200);
        assert!((cfg.percentile_quantiles.upper - 0.97).abs() < f64::EPSILON);
        assert!((cfg.percentile_quantiles.lower - 0.03).abs() < f64::EPSILON);
        assert_eq!(cfg.channel_capacity, 100_000);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.realtime_path, "/ws/realtime_charts");
        assert_eq!(cfg.opportunity_threshold, 40.0);
        assert!(cfg.recording_enabled);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "data_lake_path": "/tmp/lake" }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.data_lake_path, "/tmp/lake");
        assert_eq!(cfg.recording_batch_size, 10_000);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.exchanges, cfg2.exchanges);
        assert_eq!(cfg.data_lake_path, cfg2.data_lake_path);
    }

    #[test]
    fn validate_rejects_unknown_venue() {
        let mut cfg = AppConfig::default();
        cfg.exchanges = vec!["NotAVenue".to_string()];
        cfg.data_lake_path = std::env::temp_dir()
            .join("spread-nexus-test-lake")
            .to_string_lossy()
            .to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownVenue(_))));
    }

    #[test]
    fn validate_rejects_empty_exchange_list() {
        let mut cfg = AppConfig::default();
        cfg.exchanges = Vec::new();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoExchangesEnabled)));
    }
}

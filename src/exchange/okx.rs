use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_BASE: &str = "https://www.okx.com";

pub struct OkxAdapter {
    http: reqwest::Client,
}

impl OkxAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("OKX")
    }

    fn chunk_size(&self) -> usize {
        20
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v5/public/instruments?instType=SPOT");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("okx instruments request failed")?
                .json()
                .await
                .context("okx instruments body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["data"].as_array().context("missing data array")? {
                if entry["state"].as_str() != Some("live") {
                    continue;
                }
                let name = match entry["instId"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: decimal_field(entry, "tickSz"),
                    quantity_step: decimal_field(entry, "lotSz"),
                    min_notional: decimal_field(entry, "minSz"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/api/v5/market/tickers?instType=SPOT");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("okx tickers request failed")?
                .json()
                .await
                .context("okx tickers body was not JSON")?;

            Ok(body["data"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let symbol = entry["instId"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["volCcy24h"].as_str()?).ok()?;
                    Some(TickerVolume {
                        symbol: crate::types::normalize(symbol),
                        quote_volume,
                    })
                })
                .collect())
        }
        .boxed()
    }

    fn ws_url(&self, _symbols: &[Symbol]) -> String {
        WS_URL.to_string()
    }

    fn subscribe_message(&self, symbols: &[Symbol]) -> Option<String> {
        let args: Vec<serde_json::Value> = symbols
            .iter()
            .map(|s| serde_json::json!({ "channel": "tickers", "instId": s.as_str().replace('_', "-") }))
            .collect();
        Some(serde_json::json!({ "op": "subscribe", "args": args }).to_string())
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["arg"]["channel"].as_str() != Some("tickers") {
            return Ok(None);
        }
        let entry = match root["data"].as_array().and_then(|a| a.first()) {
            Some(e) => e,
            None => return Ok(None),
        };
        let symbol_raw = match entry["instId"].as_str() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
        let best_bid = match entry["bidPx"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match entry["askPx"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let server_timestamp: Option<DateTime<Utc>> = entry["ts"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(Some(RawQuote {
            symbol_raw,
            best_bid,
            best_ask,
            server_timestamp,
        }))
    }
}

fn decimal_field(value: &serde_json::Value, key: &str) -> Decimal {
    value[key]
        .as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://wbs.mexc.com/ws";
const REST_BASE: &str = "https://api.mexc.com";

pub struct MexcAdapter {
    http: reqwest::Client,
}

impl MexcAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for MexcAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("MEXC")
    }

    // Message-size constrained: MEXC's combined bookTicker stream degrades
    // past a few dozen symbols per connection, so shards stay small.
    fn chunk_size(&self) -> usize {
        6
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v3/exchangeInfo");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("mexc exchangeInfo request failed")?
                .json()
                .await
                .context("mexc exchangeInfo body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["symbols"].as_array().context("missing symbols array")? {
                if entry["status"].as_str() != Some("1") && entry["isSpotTradingAllowed"].as_bool() != Some(true) {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: step_from_precision(entry["quotePrecision"].as_u64().unwrap_or(6) as u32),
                    quantity_step: step_from_precision(entry["baseAssetPrecision"].as_u64().unwrap_or(6) as u32),
                    min_notional: Decimal::ZERO,
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/api/v3/ticker/24hr");
            let body: Vec<serde_json::Value> = self
                .http
                .get(&url)
                .send()
                .await
                .context("mexc 24hr ticker request failed")?
                .json()
                .await
                .context("mexc 24hr ticker body was not JSON")?;

            Ok(body
                .into_iter()
                .filter_map(|entry| {
                    let symbol = entry["symbol"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["quoteVolume"].as_str()?).ok()?;
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
        let params: Vec<String> = symbols
            .iter()
            .map(|s| format!("spot@public.bookTicker.v3.api@{}", s.as_str().replace('_', "")))
            .collect();
        Some(serde_json::json!({ "method": "SUBSCRIPTION", "params": params }).to_string())
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["c"].as_str().map(|c| c.contains("bookTicker")) != Some(true) {
            return Ok(None);
        }
        let symbol_raw = match root["s"].as_str() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
        let data = &root["d"];
        let best_bid = match data["b"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match data["a"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };

        Ok(Some(RawQuote {
            symbol_raw,
            best_bid,
            best_ask,
            server_timestamp: None,
        }))
    }
}

fn step_from_precision(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

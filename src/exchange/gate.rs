use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const REST_BASE: &str = "https://api.gateio.ws";

pub struct GateAdapter {
    http: reqwest::Client,
}

impl GateAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for GateAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("Gate")
    }

    fn chunk_size(&self) -> usize {
        30
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v4/spot/currency_pairs");
            let body: Vec<serde_json::Value> = self
                .http
                .get(&url)
                .send()
                .await
                .context("gate currency_pairs request failed")?
                .json()
                .await
                .context("gate currency_pairs body was not JSON")?;

            let mut out = Vec::new();
            for entry in body {
                if entry["trade_status"].as_str() != Some("tradable") {
                    continue;
                }
                let name = match entry["id"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                let precision = entry["precision"].as_i64().unwrap_or(6).max(0) as u32;
                let amount_precision = entry["amount_precision"].as_i64().unwrap_or(6).max(0) as u32;
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: step_from_precision(precision),
                    quantity_step: step_from_precision(amount_precision),
                    min_notional: decimal_field(&entry, "min_quote_amount"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/api/v4/spot/tickers");
            let body: Vec<serde_json::Value> = self
                .http
                .get(&url)
                .send()
                .await
                .context("gate tickers request failed")?
                .json()
                .await
                .context("gate tickers body was not JSON")?;

            Ok(body
                .into_iter()
                .filter_map(|entry| {
                    let symbol = entry["currency_pair"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["quote_volume"].as_str()?).ok()?;
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
        let payload: Vec<String> = symbols.iter().map(|s| s.as_str().to_string()).collect();
        Some(
            serde_json::json!({
                "time": 0,
                "channel": "spot.book_ticker",
                "event": "subscribe",
                "payload": payload,
            })
            .to_string(),
        )
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["channel"].as_str() != Some("spot.book_ticker") || root["event"].as_str() != Some("update") {
            return Ok(None);
        }
        let result = &root["result"];
        let symbol_raw = match result["s"].as_str() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
        let best_bid = match result["b"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match result["a"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
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

fn decimal_field(value: &serde_json::Value, key: &str) -> Decimal {
    value[key]
        .as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

fn step_from_precision(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const REST_BASE: &str = "https://api.bybit.com";

pub struct BybitAdapter {
    http: reqwest::Client,
}

impl BybitAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("Bybit")
    }

    fn chunk_size(&self) -> usize {
        10
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/v5/market/instruments-info?category=spot");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bybit instruments-info request failed")?
                .json()
                .await
                .context("bybit instruments-info body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["result"]["list"].as_array().context("missing result.list")? {
                if entry["status"].as_str() != Some("Trading") {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: decimal_field(&entry["priceFilter"], "tickSize"),
                    quantity_step: decimal_field(&entry["lotSizeFilter"], "basePrecision"),
                    min_notional: decimal_field(&entry["lotSizeFilter"], "minOrderAmt"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/v5/market/tickers?category=spot");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bybit tickers request failed")?
                .json()
                .await
                .context("bybit tickers body was not JSON")?;

            Ok(body["result"]["list"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let symbol = entry["symbol"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["turnover24h"].as_str()?).ok()?;
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
        let args: Vec<String> = symbols
            .iter()
            .map(|s| format!("tickers.{}", s.as_str().replace('_', "")))
            .collect();
        Some(serde_json::json!({ "op": "subscribe", "args": args }).to_string())
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["topic"].as_str().map(|t| t.starts_with("tickers.")) != Some(true) {
            return Ok(None);
        }
        let data = &root["data"];
        let symbol_raw = match data["symbol"].as_str() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
        let best_bid = match data["bid1Price"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match data["ask1Price"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
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

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const REST_BASE: &str = "https://api.bitget.com";

pub struct BitgetAdapter {
    http: reqwest::Client,
}

impl BitgetAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for BitgetAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("Bitget")
    }

    fn chunk_size(&self) -> usize {
        100
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v2/spot/public/symbols");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bitget symbols request failed")?
                .json()
                .await
                .context("bitget symbols body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["data"].as_array().context("missing data array")? {
                if entry["status"].as_str() != Some("online") {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: step_from_places(&entry["pricePrecision"]),
                    quantity_step: step_from_places(&entry["quantityPrecision"]),
                    min_notional: decimal_field(entry, "minTradeUSDT"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/api/v2/spot/market/tickers");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bitget tickers request failed")?
                .json()
                .await
                .context("bitget tickers body was not JSON")?;

            Ok(body["data"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let symbol = entry["symbol"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["usdtVolume"].as_str()?).ok()?;
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
            .map(|s| serde_json::json!({ "instType": "SPOT", "channel": "ticker", "instId": s.as_str().replace('_', "") }))
            .collect();
        Some(serde_json::json!({ "op": "subscribe", "args": args }).to_string())
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["arg"]["channel"].as_str() != Some("ticker") {
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
        let best_bid = match entry["bidPr"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match entry["askPr"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
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

fn step_from_places(value: &serde_json::Value) -> Decimal {
    let places = value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok())).unwrap_or(6) as u32;
    Decimal::new(1, places)
}

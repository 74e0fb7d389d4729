use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

// Kucoin's production flow negotiates a token + endpoint via a POST to
// `/api/v1/bullet-public` before connecting. This adapter targets the
// long-lived default public endpoint; the harness's reconnect/backoff loop
// covers the case where that endpoint rejects the connection.
const WS_URL: &str = "wss://ws-api-spot.kucoin.com/endpoint";
const REST_BASE: &str = "https://api.kucoin.com";

pub struct KucoinAdapter {
    http: reqwest::Client,
}

impl KucoinAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for KucoinAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("Kucoin")
    }

    fn chunk_size(&self) -> usize {
        100
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v2/symbols");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("kucoin symbols request failed")?
                .json()
                .await
                .context("kucoin symbols body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["data"].as_array().context("missing data array")? {
                if entry["enableTrading"].as_bool() != Some(true) {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: decimal_field(entry, "priceIncrement"),
                    quantity_step: decimal_field(entry, "baseIncrement"),
                    min_notional: decimal_field(entry, "minFunds"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/api/v1/market/allTickers");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("kucoin tickers request failed")?
                .json()
                .await
                .context("kucoin tickers body was not JSON")?;

            Ok(body["data"]["ticker"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|entry| {
                    let symbol = entry["symbol"].as_str()?;
                    let quote_volume = Decimal::from_str(entry["volValue"].as_str()?).ok()?;
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
        let topics: Vec<String> = symbols.iter().map(|s| s.as_str().replace('_', "-")).collect();
        Some(
            serde_json::json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "type": "subscribe",
                "topic": format!("/market/ticker:{}", topics.join(",")),
                "privateChannel": false,
                "response": true,
            })
            .to_string(),
        )
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["type"].as_str() != Some("message") {
            return Ok(None);
        }
        let topic = match root["topic"].as_str() {
            Some(t) => t,
            None => return Ok(None),
        };
        let symbol_raw = match topic.rsplit(':').next() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
        let data = &root["data"];
        let best_bid = match data["bestBid"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
            Some(v) => v,
            None => return Ok(None),
        };
        let best_ask = match data["bestAsk"].as_str().and_then(|v| Decimal::from_str(v).ok()) {
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

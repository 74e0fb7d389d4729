use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_URL: &str = "wss://open-api-ws.bingx.com/market";
const REST_BASE: &str = "https://open-api.bingx.com";

pub struct BingxAdapter {
    http: reqwest::Client,
}

impl BingxAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for BingxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("BingX")
    }

    fn chunk_size(&self) -> usize {
        100
    }

    fn supports_combined_stream(&self) -> bool {
        false
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/openApi/spot/v1/common/symbols");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bingx symbols request failed")?
                .json()
                .await
                .context("bingx symbols body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["data"]["symbols"].as_array().context("missing data.symbols")? {
                if entry["status"].as_i64() != Some(1) {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step: decimal_field(entry, "tickSize"),
                    quantity_step: decimal_field(entry, "stepSize"),
                    min_notional: decimal_field(entry, "minNotional"),
                });
            }
            Ok(out)
        }
        .boxed()
    }

    fn list_tickers(&self) -> BoxFuture<'_, Result<Vec<TickerVolume>>> {
        async move {
            let url = format!("{REST_BASE}/openApi/spot/v1/ticker/24hr");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("bingx ticker request failed")?
                .json()
                .await
                .context("bingx ticker body was not JSON")?;

            Ok(body["data"]
                .as_array()
                .into_iter()
                .flatten()
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
        let symbol = symbols.first()?.as_str().replace('_', "-");
        Some(
            serde_json::json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "reqType": "sub",
                "dataType": format!("{symbol}@bookTicker"),
            })
            .to_string(),
        )
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        if root["dataType"].as_str().map(|d| d.contains("bookTicker")) != Some(true) {
            return Ok(None);
        }
        let data = &root["data"];
        let symbol_raw = match data["s"].as_str() {
            Some(s) => s.to_string(),
            None => return Ok(None),
        };
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

fn decimal_field(value: &serde_json::Value, key: &str) -> Decimal {
    value[key]
        .as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

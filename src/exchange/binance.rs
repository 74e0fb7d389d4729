use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::{Exchange, Symbol, SymbolInfo, TickerVolume};

use super::{RawQuote, VenueAdapter};

const WS_BASE: &str = "wss://stream.binance.com:9443/stream";
const REST_BASE: &str = "https://api.binance.com";

pub struct BinanceAdapter {
    http: reqwest::Client,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl VenueAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::new("Binance")
    }

    fn chunk_size(&self) -> usize {
        20
    }

    fn list_symbols(&self) -> BoxFuture<'_, Result<Vec<SymbolInfo>>> {
        async move {
            let url = format!("{REST_BASE}/api/v3/exchangeInfo");
            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("binance exchangeInfo request failed")?
                .json()
                .await
                .context("binance exchangeInfo body was not JSON")?;

            let mut out = Vec::new();
            for entry in body["symbols"].as_array().context("missing symbols array")? {
                if entry["status"].as_str() != Some("TRADING") {
                    continue;
                }
                let name = match entry["symbol"].as_str() {
                    Some(s) => s,
                    None => continue,
                };
                let mut price_step = Decimal::ZERO;
                let mut quantity_step = Decimal::ZERO;
                let mut min_notional = Decimal::ZERO;
                for filter in entry["filters"].as_array().into_iter().flatten() {
                    match filter["filterType"].as_str() {
                        Some("PRICE_FILTER") => {
                            price_step = decimal_field(filter, "tickSize");
                        }
                        Some("LOT_SIZE") => {
                            quantity_step = decimal_field(filter, "stepSize");
                        }
                        Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                            min_notional = decimal_field(filter, "minNotional");
                        }
                        _ => {}
                    }
                }
                out.push(SymbolInfo {
                    exchange: self.exchange(),
                    name: crate::types::normalize(name),
                    price_step,
                    quantity_step,
                    min_notional,
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
                .context("binance 24hr ticker request failed")?
                .json()
                .await
                .context("binance 24hr ticker body was not JSON")?;

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

    fn ws_url(&self, symbols: &[Symbol]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@bookTicker", s.as_str().replace('_', "").to_lowercase()))
            .collect();
        format!("{WS_BASE}?streams={}", streams.join("/"))
    }

    fn subscribe_message(&self, _symbols: &[Symbol]) -> Option<String> {
        None
    }

    fn parse_message(&self, text: &str) -> Result<Option<RawQuote>> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let data = root.get("data").unwrap_or(&root);

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

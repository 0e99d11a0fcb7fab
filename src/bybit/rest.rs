// =============================================================================
// Bybit public REST client
// =============================================================================
//
// Read-only market endpoints: instruments, tickers, klines, orderbook. Every
// call carries a 30 s deadline. HTTP 429 and venue throttling codes map to
// `UpstreamRateLimit`; callers retry with backoff or skip the cycle.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::types::{Candle, OrderBookSnapshot, MINUTE_MS};

const BASE_URL: &str = "https://api.bybit.com";
/// Bybit throttling retCode.
const RET_CODE_RATE_LIMIT: i64 = 10006;

#[derive(Clone)]
pub struct BybitRest {
    base_url: String,
    client: reqwest::Client,
}

impl BybitRest {
    pub fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("cryptoscan/1.0")
                .build()
                .expect("failed to build REST client"),
        }
    }

    /// GET a v5 endpoint and unwrap the `{retCode, result}` envelope.
    async fn get_result(&self, path: &str, query: &[(&str, String)]) -> EngineResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).query(query).send().await?;

        if resp.status().as_u16() == 429 {
            return Err(EngineError::UpstreamRateLimit(format!("HTTP 429 on {path}")));
        }
        if !resp.status().is_success() {
            return Err(EngineError::TransientNetwork(format!(
                "HTTP {} on {path}",
                resp.status()
            )));
        }

        let body: Value = resp.json().await.map_err(|e| {
            EngineError::Malformed(format!("bad JSON from {path}: {e}"))
        })?;

        match body["retCode"].as_i64() {
            Some(0) => Ok(body["result"].clone()),
            Some(RET_CODE_RATE_LIMIT) => Err(EngineError::UpstreamRateLimit(format!(
                "retCode 10006 on {path}"
            ))),
            code => Err(EngineError::TransientNetwork(format!(
                "retCode {:?} on {path}: {}",
                code, body["retMsg"]
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Instruments
    // -------------------------------------------------------------------------

    /// All USDT-quoted linear perpetuals currently in `Trading` status.
    pub async fn perpetual_pairs(&self) -> EngineResult<Vec<String>> {
        let result = self
            .get_result(
                "/v5/market/instruments-info",
                &[("category", "linear".into()), ("limit", "1000".into())],
            )
            .await?;
        let pairs = parse_instruments(&result);
        debug!(count = pairs.len(), "perpetual pairs fetched");
        Ok(pairs)
    }

    // -------------------------------------------------------------------------
    // Prices
    // -------------------------------------------------------------------------

    /// Last prices for the whole linear category in one call, filtered down
    /// to `symbols`. One fetch serves an entire curation pass.
    pub async fn current_prices(
        &self,
        symbols: &[String],
    ) -> EngineResult<HashMap<String, f64>> {
        let result = self
            .get_result("/v5/market/tickers", &[("category", "linear".into())])
            .await?;

        let wanted: std::collections::HashSet<&str> =
            symbols.iter().map(String::as_str).collect();
        let mut prices = HashMap::new();
        for ticker in result["list"].as_array().into_iter().flatten() {
            let Some(symbol) = ticker["symbol"].as_str() else {
                continue;
            };
            if !wanted.contains(symbol) {
                continue;
            }
            if let Some(price) = ticker["lastPrice"].as_str().and_then(|s| s.parse().ok()) {
                prices.insert(symbol.to_string(), price);
            }
        }
        Ok(prices)
    }

    /// Daily close from `days_ago` days back, or `None` when the venue has no
    /// history that far.
    pub async fn historical_daily_close(
        &self,
        symbol: &str,
        days_ago: i64,
        now_ms: i64,
    ) -> EngineResult<Option<f64>> {
        let start = now_ms - days_ago * 24 * 3_600_000;
        let result = self
            .get_result(
                "/v5/market/kline",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("interval", "D".into()),
                    ("start", start.to_string()),
                    ("limit", "1".into()),
                ],
            )
            .await?;

        let close = result["list"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| row[4].as_str())
            .and_then(|s| s.parse().ok());
        Ok(close)
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// One-minute bars for `[start_ms, end_ms]`, ascending. The venue answers
    /// newest-first; rows that fail validation are dropped with a warning.
    pub async fn kline_1m(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> EngineResult<Vec<Candle>> {
        let result = self
            .get_result(
                "/v5/market/kline",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("interval", "1".into()),
                    ("start", start_ms.to_string()),
                    ("end", end_ms.to_string()),
                    ("limit", "1000".into()),
                ],
            )
            .await?;

        Ok(parse_kline_rows(symbol, &result))
    }

    // -------------------------------------------------------------------------
    // Orderbook
    // -------------------------------------------------------------------------

    /// Top 25 levels per side. Best-effort for alert enrichment.
    pub async fn orderbook_snapshot(
        &self,
        symbol: &str,
        now_ms: i64,
    ) -> EngineResult<OrderBookSnapshot> {
        let result = self
            .get_result(
                "/v5/market/orderbook",
                &[
                    ("category", "linear".into()),
                    ("symbol", symbol.into()),
                    ("limit", "25".into()),
                ],
            )
            .await?;

        parse_orderbook(symbol, &result, now_ms).ok_or_else(|| {
            EngineError::Malformed(format!("orderbook response missing sides for {symbol}"))
        })
    }
}

impl Default for BybitRest {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Response parsing
// =============================================================================

fn parse_instruments(result: &Value) -> Vec<String> {
    result["list"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|inst| {
            inst["contractType"].as_str() == Some("LinearPerpetual")
                && inst["status"].as_str() == Some("Trading")
                && inst["symbol"].as_str().is_some_and(|s| s.ends_with("USDT"))
        })
        .filter_map(|inst| inst["symbol"].as_str().map(str::to_string))
        .collect()
}

/// Kline rows come as `[start, open, high, low, close, volume, turnover]`
/// string arrays, newest first.
fn parse_kline_rows(symbol: &str, result: &Value) -> Vec<Candle> {
    let mut rows: Vec<&Value> = result["list"].as_array().into_iter().flatten().collect();
    rows.reverse();

    rows.into_iter()
        .filter_map(|row| {
            let candle = parse_kline_row(row)?;
            match candle.validate() {
                Ok(()) => Some(candle),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "REST kline row rejected");
                    None
                }
            }
        })
        .collect()
}

fn parse_kline_row(row: &Value) -> Option<Candle> {
    let field = |i: usize| -> Option<f64> { row[i].as_str()?.parse().ok() };
    let start_ms: i64 = row[0].as_str()?.parse().ok()?;
    Some(Candle {
        start_ms,
        end_ms: start_ms + MINUTE_MS,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
        // REST only serves completed bars.
        is_closed: true,
    })
}

fn parse_orderbook(symbol: &str, result: &Value, now_ms: i64) -> Option<OrderBookSnapshot> {
    let side = |key: &str| -> Option<Vec<[f64; 2]>> {
        result[key]
            .as_array()?
            .iter()
            .map(|level| {
                let price: f64 = level[0].as_str()?.parse().ok()?;
                let qty: f64 = level[1].as_str()?.parse().ok()?;
                Some([price, qty])
            })
            .collect()
    };
    Some(OrderBookSnapshot {
        symbol: symbol.to_string(),
        bids: side("b")?,
        asks: side("a")?,
        ts_ms: now_ms,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instruments_filtering() {
        let result = json!({"list": [
            {"symbol": "BTCUSDT", "contractType": "LinearPerpetual", "status": "Trading"},
            {"symbol": "ETHUSD",  "contractType": "InversePerpetual", "status": "Trading"},
            {"symbol": "SOLUSDT", "contractType": "LinearPerpetual", "status": "Closed"},
            {"symbol": "BTCUSDC", "contractType": "LinearPerpetual", "status": "Trading"},
            {"symbol": "XRPUSDT", "contractType": "LinearFutures",  "status": "Trading"},
            {"symbol": "DOGEUSDT","contractType": "LinearPerpetual", "status": "Trading"},
        ]});
        assert_eq!(parse_instruments(&result), vec!["BTCUSDT", "DOGEUSDT"]);
    }

    #[test]
    fn kline_rows_reversed_to_ascending() {
        let result = json!({"list": [
            ["120000", "10.1", "10.3", "10.0", "10.2", "5.0", "51.0"],
            ["60000",  "10.0", "10.2", "9.9",  "10.1", "4.0", "40.4"],
        ]});
        let candles = parse_kline_rows("BTCUSDT", &result);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].start_ms, 60_000);
        assert_eq!(candles[0].end_ms, 120_000);
        assert_eq!(candles[1].start_ms, 120_000);
        assert!(candles.iter().all(|c| c.is_closed));
        assert!((candles[1].close - 10.2).abs() < 1e-9);
    }

    #[test]
    fn malformed_kline_rows_are_dropped() {
        let result = json!({"list": [
            ["120000", "10.1", "9.0", "10.0", "10.2", "5.0", "x"], // high < body
            ["60000",  "10.0", "10.2", "9.9", "10.1", "4.0", "y"],
            ["not-a-ts", "1", "2", "0.5", "1.5", "1", "z"],
        ]});
        let candles = parse_kline_rows("BTCUSDT", &result);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].start_ms, 60_000);
    }

    #[test]
    fn orderbook_parsing() {
        let result = json!({
            "b": [["100.5", "2.0"], ["100.0", "7.5"]],
            "a": [["100.6", "1.0"]],
        });
        let snap = parse_orderbook("BTCUSDT", &result, 42).unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.bids, vec![[100.5, 2.0], [100.0, 7.5]]);
        assert_eq!(snap.asks, vec![[100.6, 1.0]]);
        assert_eq!(snap.ts_ms, 42);
    }

    #[test]
    fn orderbook_missing_side_is_none() {
        let result = json!({"b": [["100.5", "2.0"]]});
        assert!(parse_orderbook("BTCUSDT", &result, 0).is_none());
    }
}

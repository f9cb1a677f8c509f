// =============================================================================
// Live Exchange REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// carry the API key as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange.
//
// Failures map to typed `EngineError` variants so the central error handler
// can classify them structurally: transport problems become
// `Connection`/`Timeout`, HTTP 401/403 becomes `Auth`, and any other non-2xx
// response becomes `Exchange` with the broker's reason attached.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::{ExchangeClient, OrderAck, OrderBook, OrderRequest, Ticker};
use crate::error_handler::EngineError;
use crate::market_data::Candle;
use crate::types::{now_ms, OrderStatus, OrderType};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Minutes in 24 hours, for trades-per-minute derivation.
const MINUTES_PER_DAY: f64 = 1_440.0;

/// REST client for the derivatives API with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct LiveExchangeClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl LiveExchangeClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://fapi.binance.com")
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "exchange REST client initialised");

        Self {
            secret: secret.into(),
            base_url,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Issue a request and surface failures as typed engine errors.
    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<serde_json::Value> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(format!("{what}: {e}"))
            } else {
                EngineError::Connection(format!("{what}: {e}"))
            }
        })?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EngineError::Auth(format!("{what} returned {status}: {body}")).into());
        }
        if !status.is_success() {
            return Err(EngineError::Exchange(format!("{what} returned {status}: {body}")).into());
        }

        Ok(body)
    }

    fn get(&self, path: &str, query: &str) -> reqwest::RequestBuilder {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        self.client.get(url)
    }

    /// Open interest in USD for `symbol`, best effort.
    async fn fetch_open_interest_usd(&self, symbol: &str, last_price: f64) -> f64 {
        let req = self.get("/fapi/v1/openInterest", &format!("symbol={symbol}"));
        match self.send(req, "openInterest").await {
            Ok(body) => {
                let oi: f64 = body["openInterest"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                oi * last_price
            }
            Err(e) => {
                warn!(symbol, error = %e, "open interest fetch failed");
                0.0
            }
        }
    }
}

fn parse_string_f64(val: &serde_json::Value) -> f64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_levels(val: &serde_json::Value) -> Vec<(f64, f64)> {
    val.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let price = level.get(0).map(parse_string_f64)?;
                    let qty = level.get(1).map(parse_string_f64)?;
                    Some((price, qty))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::Open,
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::Partial,
        "CANCELED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Pending,
    }
}

#[async_trait::async_trait]
impl ExchangeClient for LiveExchangeClient {
    #[instrument(skip(self), name = "exchange::fetch_markets")]
    async fn fetch_markets(&self) -> Result<Vec<String>> {
        let req = self.get("/fapi/v1/exchangeInfo", "");
        let body = self.send(req, "exchangeInfo").await?;

        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| EngineError::MissingData("exchangeInfo.symbols".into()))?
            .iter()
            .filter(|s| s["status"].as_str() == Some("TRADING"))
            .filter(|s| s["contractType"].as_str() == Some("PERPETUAL"))
            .filter_map(|s| s["symbol"].as_str().map(str::to_string))
            .collect::<Vec<_>>();

        debug!(count = symbols.len(), "markets fetched");
        Ok(symbols)
    }

    #[instrument(skip(self), name = "exchange::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let req = self.get("/fapi/v1/ticker/24hr", &format!("symbol={symbol}"));
        let body = self.send(req, "ticker/24hr").await?;

        let last = parse_string_f64(&body["lastPrice"]);
        let volume_24h_usd = parse_string_f64(&body["quoteVolume"]);
        let trade_count = body["count"].as_u64().unwrap_or(0) as f64;

        let open_interest_usd = self.fetch_open_interest_usd(symbol, last).await;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            volume_24h_usd,
            open_interest_usd,
            // The 24h OI delta needs a history endpoint; callers treat 0 as
            // "unknown" and the OI filter uses the absolute value anyway.
            oi_change_24h_pct: 0.0,
            trades_per_minute: trade_count / MINUTES_PER_DAY,
        })
    }

    #[instrument(skip(self), name = "exchange::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        let req = self.get(
            "/fapi/v1/klines",
            &format!("symbol={symbol}&interval={timeframe}&limit={limit}"),
        );
        let body = self.send(req, "klines").await?;

        let raw = body
            .as_array()
            .ok_or_else(|| EngineError::MissingData("klines array".into()))?;

        // Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
        // [5] volume.
        let candles = raw
            .iter()
            .filter_map(|k| {
                let arr = k.as_array()?;
                Some(Candle {
                    ts_ms: arr.first()?.as_i64()?,
                    open: parse_string_f64(arr.get(1)?),
                    high: parse_string_f64(arr.get(2)?),
                    low: parse_string_f64(arr.get(3)?),
                    close: parse_string_f64(arr.get(4)?),
                    volume: parse_string_f64(arr.get(5)?),
                })
            })
            .collect::<Vec<_>>();

        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "exchange::fetch_order_book")]
    async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook> {
        let req = self.get("/fapi/v1/depth", &format!("symbol={symbol}&limit=100"));
        let body = self.send(req, "depth").await?;

        Ok(OrderBook {
            bids: parse_levels(&body["bids"]),
            asks: parse_levels(&body["asks"]),
        })
    }

    #[instrument(skip(self), name = "exchange::fetch_balance")]
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>> {
        let qs = self.signed_query("");
        let req = self.get("/fapi/v2/balance", &qs);
        let body = self.send(req, "balance").await?;

        let balances = body
            .as_array()
            .ok_or_else(|| EngineError::MissingData("balance array".into()))?
            .iter()
            .filter_map(|b| {
                let asset = b["asset"].as_str()?.to_string();
                let free = parse_string_f64(&b["availableBalance"]);
                Some((asset, free))
            })
            .collect();

        Ok(balances)
    }

    #[instrument(skip(self, request), name = "exchange::create_order")]
    async fn create_order(&self, request: OrderRequest) -> Result<OrderAck> {
        let side = request.side.to_string().to_uppercase();
        let order_type = match request.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            request.symbol, side, order_type, request.qty, request.client_order_id
        );
        if let Some(price) = request.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }
        if request.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol = %request.symbol, side = %side, order_type, qty = request.qty, "placing order");

        let body = self.send(self.client.post(&url), "order").await?;

        let filled_qty = parse_string_f64(&body["executedQty"]);
        let avg_price = parse_string_f64(&body["avgPrice"]);

        Ok(OrderAck {
            exchange_id: body["orderId"]
                .as_u64()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            status: parse_order_status(body["status"].as_str().unwrap_or("")),
            filled_qty,
            avg_fill_price: (avg_price > 0.0).then_some(avg_price),
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, exchange_id: &str, symbol: &str) -> Result<bool> {
        let params = format!("symbol={symbol}&orderId={exchange_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        match self.send(self.client.delete(&url), "cancel").await {
            Ok(_) => Ok(true),
            Err(e) => {
                // Cancelling an already-gone order is not a failure worth
                // retrying; surface every other error.
                if format!("{e:#}").contains("Unknown order") {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl std::fmt::Debug for LiveExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveExchangeClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = LiveExchangeClient::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        let sig2 = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_carries_signature_and_window() {
        let client = LiveExchangeClient::new("key", "secret");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains(&format!("recvWindow={RECV_WINDOW}")));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn parse_levels_mixed_types() {
        let val = serde_json::json!([["100.5", "2.0"], [101.0, 3.5], ["bad"]]);
        let levels = parse_levels(&val);
        assert_eq!(levels, vec![(100.5, 2.0), (101.0, 3.5)]);
    }

    #[test]
    fn order_status_mapping() {
        assert_eq!(parse_order_status("NEW"), OrderStatus::Open);
        assert_eq!(parse_order_status("FILLED"), OrderStatus::Filled);
        assert_eq!(parse_order_status("PARTIALLY_FILLED"), OrderStatus::Partial);
        assert_eq!(parse_order_status("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(parse_order_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(parse_order_status("???"), OrderStatus::Pending);
    }
}

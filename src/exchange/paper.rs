// =============================================================================
// Paper Exchange — simulated broker with the live decision path
// =============================================================================
//
// Paper mode keeps real market data (delegated to an optional data source)
// and replaces only the broker: balances are simulated from the configured
// starting balance and orders fill synthetically at the last known price with
// a fixed slippage. Tests use the same type with fixture data loaded through
// the `set_*` helpers instead of a data source.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ExchangeClient, OrderAck, OrderBook, OrderRequest, Ticker};
use crate::error_handler::EngineError;
use crate::market_data::Candle;
use crate::types::{OrderStatus, OrderType};

/// One resting simulated order (limit orders that did not fill immediately).
#[derive(Debug, Clone)]
struct RestingOrder {
    symbol: String,
    qty: f64,
}

struct PaperInner {
    balances: HashMap<String, f64>,
    markets: Vec<String>,
    tickers: HashMap<String, Ticker>,
    candles: HashMap<(String, String), Vec<Candle>>,
    books: HashMap<String, OrderBook>,
    resting: HashMap<String, RestingOrder>,
    fill_count: u64,
}

/// Simulated broker. Cheap to clone via `Arc`.
pub struct PaperExchangeClient {
    inner: RwLock<PaperInner>,
    quote_asset: String,
    slippage_bps: f64,
    /// When false, limit orders rest instead of filling immediately. Used by
    /// slicing tests to exercise the deadman path.
    fill_limit_orders: RwLock<bool>,
    /// Optional real data source; order flow never reaches it.
    data_source: Option<Arc<dyn ExchangeClient>>,
}

impl PaperExchangeClient {
    pub fn new(quote_asset: &str, starting_balance: f64) -> Self {
        info!(quote_asset, starting_balance, "paper exchange initialised");
        let mut balances = HashMap::new();
        balances.insert(quote_asset.to_string(), starting_balance);

        Self {
            inner: RwLock::new(PaperInner {
                balances,
                markets: Vec::new(),
                tickers: HashMap::new(),
                candles: HashMap::new(),
                books: HashMap::new(),
                resting: HashMap::new(),
                fill_count: 0,
            }),
            quote_asset: quote_asset.to_string(),
            slippage_bps: 1.0,
            fill_limit_orders: RwLock::new(true),
            data_source: None,
        }
    }

    /// Use a real client for market data while keeping the simulated broker.
    pub fn with_data_source(mut self, source: Arc<dyn ExchangeClient>) -> Self {
        self.data_source = Some(source);
        self
    }

    // -------------------------------------------------------------------------
    // Fixture setters (tests and offline runs)
    // -------------------------------------------------------------------------

    pub fn set_markets(&self, markets: Vec<String>) {
        self.inner.write().markets = markets;
    }

    pub fn set_ticker(&self, ticker: Ticker) {
        let mut inner = self.inner.write();
        inner.tickers.insert(ticker.symbol.clone(), ticker);
    }

    pub fn set_candles(&self, symbol: &str, timeframe: &str, candles: Vec<Candle>) {
        self.inner
            .write()
            .candles
            .insert((symbol.to_string(), timeframe.to_string()), candles);
    }

    pub fn set_order_book(&self, symbol: &str, book: OrderBook) {
        self.inner.write().books.insert(symbol.to_string(), book);
    }

    pub fn set_fill_limit_orders(&self, fill: bool) {
        *self.fill_limit_orders.write() = fill;
    }

    /// Adjust the quote balance (realized PnL and fees on close).
    pub fn credit(&self, delta: f64) {
        let mut inner = self.inner.write();
        let balance = inner.balances.entry(self.quote_asset.clone()).or_insert(0.0);
        *balance += delta;
        debug!(delta, balance = *balance, "paper balance adjusted");
    }

    pub fn fill_count(&self) -> u64 {
        self.inner.read().fill_count
    }

    fn last_price(&self, symbol: &str) -> Option<f64> {
        let inner = self.inner.read();
        inner
            .tickers
            .get(symbol)
            .map(|t| t.last)
            .or_else(|| inner.books.get(symbol).and_then(|b| b.mid()))
    }
}

#[async_trait::async_trait]
impl ExchangeClient for PaperExchangeClient {
    async fn fetch_markets(&self) -> Result<Vec<String>> {
        if let Some(source) = &self.data_source {
            return source.fetch_markets().await;
        }
        Ok(self.inner.read().markets.clone())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        if let Some(source) = &self.data_source {
            return source.fetch_ticker(symbol).await;
        }
        self.inner
            .read()
            .tickers
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::MissingData(format!("no ticker fixture for {symbol}")).into())
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        if let Some(source) = &self.data_source {
            return source.fetch_ohlcv(symbol, timeframe, limit).await;
        }
        let inner = self.inner.read();
        let candles = inner
            .candles
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook> {
        if let Some(source) = &self.data_source {
            return source.fetch_order_book(symbol).await;
        }
        Ok(self.inner.read().books.get(symbol).cloned().unwrap_or_default())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>> {
        Ok(self.inner.read().balances.clone())
    }

    async fn create_order(&self, request: OrderRequest) -> Result<OrderAck> {
        let Some(reference) = request.price.or_else(|| self.last_price(&request.symbol)) else {
            warn!(symbol = %request.symbol, "paper order rejected: no reference price");
            return Ok(OrderAck {
                exchange_id: Uuid::new_v4().to_string(),
                status: OrderStatus::Rejected,
                filled_qty: 0.0,
                avg_fill_price: None,
            });
        };

        if request.qty <= 0.0 {
            return Ok(OrderAck {
                exchange_id: Uuid::new_v4().to_string(),
                status: OrderStatus::Rejected,
                filled_qty: 0.0,
                avg_fill_price: None,
            });
        }

        let exchange_id = Uuid::new_v4().to_string();

        // Limit orders may rest; market orders always cross with slippage.
        let fills_now = match request.order_type {
            OrderType::Market => true,
            OrderType::Limit => *self.fill_limit_orders.read(),
        };

        if !fills_now {
            let mut inner = self.inner.write();
            inner.resting.insert(
                exchange_id.clone(),
                RestingOrder {
                    symbol: request.symbol.clone(),
                    qty: request.qty,
                },
            );
            debug!(symbol = %request.symbol, exchange_id = %exchange_id, "paper limit order resting");
            return Ok(OrderAck {
                exchange_id,
                status: OrderStatus::Open,
                filled_qty: 0.0,
                avg_fill_price: None,
            });
        }

        let slip = reference * self.slippage_bps / 10_000.0;
        let fill_price = match (request.order_type, request.side) {
            (OrderType::Limit, _) => reference,
            (OrderType::Market, crate::types::OrderSide::Buy) => reference + slip,
            (OrderType::Market, crate::types::OrderSide::Sell) => reference - slip,
        };

        {
            let mut inner = self.inner.write();
            inner.fill_count += 1;
        }

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            qty = request.qty,
            fill_price,
            reduce_only = request.reduce_only,
            "paper fill"
        );

        Ok(OrderAck {
            exchange_id,
            status: OrderStatus::Filled,
            filled_qty: request.qty,
            avg_fill_price: Some(fill_price),
        })
    }

    async fn cancel_order(&self, exchange_id: &str, symbol: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.resting.remove(exchange_id) {
            Some(order) => {
                debug!(symbol, exchange_id, qty = order.qty, "paper order cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for PaperExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PaperExchangeClient")
            .field("quote_asset", &self.quote_asset)
            .field("balances", &inner.balances)
            .field("fill_count", &inner.fill_count)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn ticker(symbol: &str, last: f64) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last,
            volume_24h_usd: 1_000_000.0,
            open_interest_usd: 500_000.0,
            oi_change_24h_pct: 0.0,
            trades_per_minute: 10.0,
        }
    }

    fn request(symbol: &str, order_type: OrderType, price: Option<f64>) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type,
            qty: 2.0,
            price,
            reduce_only: false,
            client_order_id: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn balance_comes_from_configured_start() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        let balance = paper.fetch_balance().await.unwrap();
        assert_eq!(balance.get("USDT"), Some(&10_000.0));

        paper.credit(-250.0);
        let balance = paper.fetch_balance().await.unwrap();
        assert_eq!(balance.get("USDT"), Some(&9_750.0));
    }

    #[tokio::test]
    async fn market_order_fills_with_slippage() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        paper.set_ticker(ticker("BTCUSDT", 50_000.0));

        let ack = paper
            .create_order(request("BTCUSDT", OrderType::Market, None))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_qty, 2.0);
        // Buy slips upward.
        assert!(ack.avg_fill_price.unwrap() > 50_000.0);
    }

    #[tokio::test]
    async fn limit_order_fills_at_limit_price() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        paper.set_ticker(ticker("BTCUSDT", 50_000.0));

        let ack = paper
            .create_order(request("BTCUSDT", OrderType::Limit, Some(49_990.0)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_fill_price, Some(49_990.0));
    }

    #[tokio::test]
    async fn resting_limit_order_can_be_cancelled() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        paper.set_ticker(ticker("BTCUSDT", 50_000.0));
        paper.set_fill_limit_orders(false);

        let ack = paper
            .create_order(request("BTCUSDT", OrderType::Limit, Some(49_990.0)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Open);
        assert_eq!(ack.filled_qty, 0.0);

        assert!(paper.cancel_order(&ack.exchange_id, "BTCUSDT").await.unwrap());
        assert!(!paper.cancel_order(&ack.exchange_id, "BTCUSDT").await.unwrap());
    }

    #[tokio::test]
    async fn order_without_reference_price_is_rejected() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        let ack = paper
            .create_order(request("NOSUCH", OrderType::Market, None))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Rejected);
        assert_eq!(ack.filled_qty, 0.0);
    }

    #[tokio::test]
    async fn fixtures_serve_market_data() {
        let paper = PaperExchangeClient::new("USDT", 10_000.0);
        paper.set_markets(vec!["BTCUSDT".into(), "ETHUSDT".into()]);
        paper.set_candles(
            "BTCUSDT",
            "5m",
            vec![Candle {
                ts_ms: 0,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            }],
        );

        assert_eq!(paper.fetch_markets().await.unwrap().len(), 2);
        assert_eq!(paper.fetch_ohlcv("BTCUSDT", "5m", 10).await.unwrap().len(), 1);
        assert!(paper.fetch_ohlcv("ETHUSDT", "5m", 10).await.unwrap().is_empty());
    }
}

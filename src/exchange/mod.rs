// =============================================================================
// Exchange client capability trait and wire models
// =============================================================================
//
// The engine never talks to a concrete exchange type: every collaborator that
// needs market data or order placement holds an `Arc<dyn ExchangeClient>`.
// Implementations:
//
//   * `LiveExchangeClient`  — HMAC-signed REST against the derivatives API.
//   * `PaperExchangeClient` — simulated broker with the same decision path.
//   * test mocks            — fixtures implementing the same trait.
// =============================================================================

pub mod paper;
pub mod rest;

pub use paper::PaperExchangeClient;
pub use rest::LiveExchangeClient;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::{OrderSide, OrderStatus, OrderType};

/// 24h ticker snapshot for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub volume_24h_usd: f64,
    pub open_interest_usd: f64,
    pub oi_change_24h_pct: f64,
    pub trades_per_minute: f64,
}

/// Top-N order book levels, best first. Each level is `(price, qty)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let mid = self.mid()?;
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((ask - bid) / mid * 10_000.0)
    }

    /// USD notional resting within `pct` percent of mid on one side.
    pub fn depth_usd_within(&self, pct: f64, side: OrderSide) -> f64 {
        let Some(mid) = self.mid() else {
            return 0.0;
        };
        let band = mid * pct / 100.0;
        let levels = match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        };
        levels
            .iter()
            .filter(|(price, _)| (price - mid).abs() <= band)
            .map(|(price, qty)| price * qty)
            .sum()
    }

    /// Depth imbalance over the 0.5% band: (bid - ask) / (bid + ask).
    pub fn imbalance(&self) -> f64 {
        let bid = self.depth_usd_within(0.5, OrderSide::Buy);
        let ask = self.depth_usd_within(0.5, OrderSide::Sell);
        let total = bid + ask;
        if total > 0.0 {
            (bid - ask) / total
        } else {
            0.0
        }
    }
}

/// A new-order request on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Exchange acknowledgement of an order, including any immediate fill.
#[derive(Debug, Clone, Serialize)]
pub struct OrderAck {
    pub exchange_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: Option<f64>,
}

/// The operations the engine needs from an exchange. Paper, live, and mock
/// implementations are interchangeable behind this trait.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// All tradeable instrument symbols.
    async fn fetch_markets(&self) -> Result<Vec<String>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// OHLCV candles, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook>;

    /// Free balance per asset.
    async fn fetch_balance(&self) -> Result<HashMap<String, f64>>;

    async fn create_order(&self, request: OrderRequest) -> Result<OrderAck>;

    /// Returns `true` when the order existed and is now cancelled.
    async fn cancel_order(&self, exchange_id: &str, symbol: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBook {
        OrderBook {
            bids: vec![(99.9, 10.0), (99.5, 20.0), (98.0, 50.0)],
            asks: vec![(100.1, 8.0), (100.5, 15.0), (102.0, 40.0)],
        }
    }

    #[test]
    fn mid_and_spread() {
        let ob = book();
        assert!((ob.mid().unwrap() - 100.0).abs() < f64::EPSILON);
        let spread = ob.spread_bps().unwrap();
        assert!((spread - 20.0).abs() < 0.01, "got {spread}");
    }

    #[test]
    fn depth_within_band_excludes_far_levels() {
        let ob = book();
        // 0.5% band around 100.0 covers [99.5, 100.5].
        let bid_depth = ob.depth_usd_within(0.5, OrderSide::Buy);
        assert!((bid_depth - (99.9 * 10.0 + 99.5 * 20.0)).abs() < 1e-6);
        let ask_depth = ob.depth_usd_within(0.5, OrderSide::Sell);
        assert!((ask_depth - (100.1 * 8.0 + 100.5 * 15.0)).abs() < 1e-6);
    }

    #[test]
    fn imbalance_sign_follows_heavier_side() {
        let ob = book();
        // Bid depth within band (~2989) > ask depth (~2308).
        assert!(ob.imbalance() > 0.0);

        let empty = OrderBook::default();
        assert_eq!(empty.imbalance(), 0.0);
    }
}

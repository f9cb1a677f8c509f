// =============================================================================
// Market data models
// =============================================================================

pub mod cache;

pub use cache::MarketDataCache;

use serde::{Deserialize, Serialize};

/// A single OHLCV candle on a fixed-width timeframe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Body size as a fraction of the full candle range, 0 when the candle is
    /// a point.
    pub fn body_ratio(&self) -> f64 {
        let range = self.high - self.low;
        if range <= 0.0 {
            return 0.0;
        }
        (self.close - self.open).abs() / range
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }
}

/// Aggregated L2 depth snapshot around mid price.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct L2Depth {
    /// USD resting on the bid side within 0.3% of mid.
    pub bid_usd_0_3pct: f64,
    /// USD resting on the ask side within 0.3% of mid.
    pub ask_usd_0_3pct: f64,
    pub bid_usd_0_5pct: f64,
    pub ask_usd_0_5pct: f64,
    pub spread_bps: f64,
    /// (bid - ask) / (bid + ask) over the 0.5% band, in [-1, 1].
    pub imbalance: f64,
}

/// Everything the scanner and signal pipeline know about one instrument at a
/// moment in time. Snapshots are immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub price: f64,
    pub volume_24h_usd: f64,
    pub open_interest_usd: f64,
    pub oi_change_24h_pct: f64,
    pub trades_per_minute: f64,
    pub atr_5m: f64,
    pub atr_15m: f64,
    pub bb_width_pct: f64,
    /// Correlation of 5m returns against BTC, in [-1, 1].
    pub btc_correlation: f64,
    pub l2_depth: Option<L2Depth>,
    pub candles_5m: Vec<Candle>,
    pub ts_ms: i64,
}

impl MarketData {
    /// Check the structural invariants a snapshot must satisfy before the
    /// scanner will look at it.
    pub fn is_well_formed(&self, min_candles: usize) -> bool {
        if self.price <= 0.0 || self.atr_5m <= 0.0 {
            return false;
        }
        if self.candles_5m.len() < min_candles {
            return false;
        }
        // Candle timestamps must be monotonic.
        self.candles_5m.windows(2).all(|w| w[0].ts_ms < w[1].ts_ms)
    }

    /// ATR as a percentage of current price.
    pub fn atr_pct(&self) -> f64 {
        if self.price > 0.0 {
            self.atr_5m / self.price * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Build a plausible snapshot for unit tests.
    pub fn market_data(symbol: &str, price: f64, atr: f64, candle_count: usize) -> MarketData {
        let candles = (0..candle_count)
            .map(|i| Candle {
                ts_ms: (i as i64) * 300_000,
                open: price,
                high: price + atr,
                low: price - atr,
                close: price,
                volume: 1_000.0,
            })
            .collect();

        MarketData {
            symbol: symbol.to_string(),
            price,
            volume_24h_usd: 50_000_000.0,
            open_interest_usd: 10_000_000.0,
            oi_change_24h_pct: 2.0,
            trades_per_minute: 30.0,
            atr_5m: atr,
            atr_15m: atr * 1.6,
            bb_width_pct: 2.0,
            btc_correlation: 0.5,
            l2_depth: Some(L2Depth {
                bid_usd_0_3pct: 200_000.0,
                ask_usd_0_3pct: 200_000.0,
                bid_usd_0_5pct: 400_000.0,
                ask_usd_0_5pct: 400_000.0,
                spread_bps: 2.0,
                imbalance: 0.1,
            }),
            candles_5m: candles,
            ts_ms: (candle_count as i64) * 300_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_ratio_of_full_body_candle() {
        let c = Candle {
            ts_ms: 0,
            open: 100.0,
            high: 110.0,
            low: 100.0,
            close: 110.0,
            volume: 1.0,
        };
        assert!((c.body_ratio() - 1.0).abs() < 1e-9);
        assert!(c.is_bullish());
    }

    #[test]
    fn body_ratio_of_doji() {
        let c = Candle {
            ts_ms: 0,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 1.0,
        };
        assert!(c.body_ratio() < 1e-9);
    }

    #[test]
    fn well_formed_rejects_zero_atr() {
        let mut md = testing::market_data("BTCUSDT", 50_000.0, 100.0, 50);
        assert!(md.is_well_formed(30));
        md.atr_5m = 0.0;
        assert!(!md.is_well_formed(30));
    }

    #[test]
    fn well_formed_rejects_nonmonotonic_candles() {
        let mut md = testing::market_data("BTCUSDT", 50_000.0, 100.0, 50);
        md.candles_5m[10].ts_ms = md.candles_5m[9].ts_ms;
        assert!(!md.is_well_formed(30));
    }

    #[test]
    fn well_formed_rejects_short_history() {
        let md = testing::market_data("BTCUSDT", 50_000.0, 100.0, 10);
        assert!(!md.is_well_formed(30));
    }
}

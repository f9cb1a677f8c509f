// =============================================================================
// Trades Aggregator — rolling trade window, TPM, and activity decay
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::types::now_ms;

/// One observed trade.
#[derive(Debug, Clone, Copy)]
struct TradeTick {
    ts_ms: i64,
    price: f64,
    qty: f64,
    /// True when the buyer was the maker (taker was selling).
    is_buyer_maker: bool,
}

/// Activity summary for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityMetrics {
    pub tpm_60s: f64,
    /// Average TPM over the retained window (baseline).
    pub tpm_baseline: f64,
    /// True when short-term activity fell below the configured fraction of
    /// baseline.
    pub is_dropping: bool,
}

/// How much trade history to retain per symbol.
const WINDOW_MS: i64 = 10 * 60 * 1_000;

struct SymbolWindow {
    ticks: VecDeque<TradeTick>,
    last_price: f64,
}

/// Rolling per-symbol trade windows fed by WebSocket streams.
pub struct TradesAggregator {
    windows: RwLock<HashMap<String, SymbolWindow>>,
    /// Fractional drop from baseline that flags a symbol as dying.
    activity_drop_threshold: f64,
}

impl TradesAggregator {
    pub fn new(activity_drop_threshold: f64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            activity_drop_threshold,
        }
    }

    /// Register a symbol so that stream data has somewhere to land.
    pub fn subscribe(&self, symbol: &str) {
        let mut windows = self.windows.write();
        windows.entry(symbol.to_string()).or_insert_with(|| SymbolWindow {
            ticks: VecDeque::new(),
            last_price: 0.0,
        });
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.windows.read().contains_key(symbol)
    }

    /// Feed one trade into the window.
    pub fn process_trade(&self, symbol: &str, ts_ms: i64, price: f64, qty: f64, is_buyer_maker: bool) {
        let mut windows = self.windows.write();
        let window = windows.entry(symbol.to_string()).or_insert_with(|| SymbolWindow {
            ticks: VecDeque::new(),
            last_price: 0.0,
        });

        window.ticks.push_back(TradeTick {
            ts_ms,
            price,
            qty,
            is_buyer_maker,
        });
        window.last_price = price;

        let cutoff = ts_ms - WINDOW_MS;
        while window.ticks.front().is_some_and(|t| t.ts_ms < cutoff) {
            window.ticks.pop_front();
        }
    }

    /// Trades per minute over the trailing `window_secs`, or `None` when the
    /// symbol has no stream attached.
    pub fn tpm(&self, symbol: &str, window_secs: u64) -> Option<f64> {
        self.tpm_at(symbol, window_secs, now_ms())
    }

    fn tpm_at(&self, symbol: &str, window_secs: u64, now: i64) -> Option<f64> {
        let windows = self.windows.read();
        let window = windows.get(symbol)?;
        let cutoff = now - (window_secs as i64) * 1_000;
        let count = window.ticks.iter().filter(|t| t.ts_ms >= cutoff).count();
        Some(count as f64 * 60.0 / window_secs as f64)
    }

    /// Activity summary, or `None` when the symbol has no stream attached.
    pub fn activity(&self, symbol: &str) -> Option<ActivityMetrics> {
        self.activity_at(symbol, now_ms())
    }

    fn activity_at(&self, symbol: &str, now: i64) -> Option<ActivityMetrics> {
        let tpm_60s = self.tpm_at(symbol, 60, now)?;

        let windows = self.windows.read();
        let window = windows.get(symbol)?;
        let oldest = window.ticks.front()?.ts_ms;
        let span_secs = ((now - oldest) as f64 / 1_000.0).max(60.0);
        let tpm_baseline = window.ticks.len() as f64 * 60.0 / span_secs;

        // A symbol only counts as dropping with a meaningful baseline.
        let is_dropping =
            tpm_baseline >= 1.0 && tpm_60s < tpm_baseline * (1.0 - self.activity_drop_threshold);

        Some(ActivityMetrics {
            tpm_60s,
            tpm_baseline,
            is_dropping,
        })
    }

    /// Taker buy fraction of traded volume over the retained window.
    pub fn buy_volume_ratio(&self, symbol: &str) -> Option<f64> {
        let windows = self.windows.read();
        let window = windows.get(symbol)?;
        let (mut buy, mut total) = (0.0, 0.0);
        for tick in &window.ticks {
            let notional = tick.price * tick.qty;
            total += notional;
            if !tick.is_buyer_maker {
                buy += notional;
            }
        }
        if total > 0.0 {
            Some(buy / total)
        } else {
            None
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let windows = self.windows.read();
        windows.get(symbol).map(|w| w.last_price).filter(|p| *p > 0.0)
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.windows.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for TradesAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradesAggregator")
            .field("symbols", &self.windows.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trade WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the aggTrade WebSocket stream for a single symbol and feed
/// trades into `aggregator`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection.
pub async fn run_trade_stream(symbol: &str, aggregator: &Arc<TradesAggregator>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok((ts_ms, price, qty, is_buyer_maker)) => {
                            aggregator.process_trade(symbol, ts_ms, price, qty, is_buyer_maker);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse an aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "T": 1700000000000,
///   "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<(i64, f64, f64, bool)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let ts_ms = root["T"].as_i64().context("missing field T")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let qty: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;

    Ok((ts_ms, price, qty, is_buyer_maker))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tpm_counts_only_trailing_window() {
        let agg = TradesAggregator::new(0.4);
        let now = 1_000_000_000;
        // 5 trades in the last minute, 5 older ones.
        for i in 0..5 {
            agg.process_trade("BTCUSDT", now - 200_000 - i * 1_000, 100.0, 1.0, false);
        }
        for i in 0..5 {
            agg.process_trade("BTCUSDT", now - i * 1_000, 100.0, 1.0, false);
        }

        let tpm = agg.tpm_at("BTCUSDT", 60, now).unwrap();
        assert!((tpm - 5.0).abs() < f64::EPSILON, "got {tpm}");
    }

    #[test]
    fn tpm_is_none_without_subscription() {
        let agg = TradesAggregator::new(0.4);
        assert!(agg.tpm("NOSUCH", 60).is_none());

        agg.subscribe("ETHUSDT");
        assert_eq!(agg.tpm("ETHUSDT", 60), Some(0.0));
    }

    #[test]
    fn activity_drop_detected() {
        let agg = TradesAggregator::new(0.4);
        let now = 1_000_000_000;
        // Busy 9 minutes ago..1 minute ago, silent since.
        for i in 0..480 {
            agg.process_trade("BTCUSDT", now - 540_000 + i * 1_000, 100.0, 1.0, false);
        }

        let activity = agg.activity_at("BTCUSDT", now).unwrap();
        assert_eq!(activity.tpm_60s, 0.0);
        assert!(activity.tpm_baseline > 10.0);
        assert!(activity.is_dropping);
    }

    #[test]
    fn steady_activity_is_not_dropping() {
        let agg = TradesAggregator::new(0.4);
        let now = 1_000_000_000;
        for i in 0..600 {
            agg.process_trade("BTCUSDT", now - 600_000 + i * 1_000, 100.0, 1.0, false);
        }

        let activity = agg.activity_at("BTCUSDT", now).unwrap();
        assert!(!activity.is_dropping, "{activity:?}");
    }

    #[test]
    fn buy_volume_ratio_splits_takers() {
        let agg = TradesAggregator::new(0.4);
        let now = now_ms();
        // Taker buy of 300 notional, taker sell of 100.
        agg.process_trade("BTCUSDT", now, 100.0, 3.0, false);
        agg.process_trade("BTCUSDT", now, 100.0, 1.0, true);

        let ratio = agg.buy_volume_ratio("BTCUSDT").unwrap();
        assert!((ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn old_ticks_are_evicted() {
        let agg = TradesAggregator::new(0.4);
        agg.process_trade("BTCUSDT", 0, 100.0, 1.0, false);
        agg.process_trade("BTCUSDT", WINDOW_MS + 1_000, 101.0, 1.0, false);

        let tpm = agg.tpm_at("BTCUSDT", 60 * 60, WINDOW_MS + 1_000).unwrap();
        // Only the second trade survives the window trim.
        assert!((tpm - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn parse_agg_trade_message() {
        let json = r#"{ "e": "aggTrade", "s": "BTCUSDT", "T": 1700000000000,
                        "p": "37000.50", "q": "0.25", "m": true }"#;
        let (ts, price, qty, maker) = parse_agg_trade(json).unwrap();
        assert_eq!(ts, 1_700_000_000_000);
        assert!((price - 37_000.5).abs() < f64::EPSILON);
        assert!((qty - 0.25).abs() < f64::EPSILON);
        assert!(maker);
    }
}

// =============================================================================
// Order Book Tracker — depth aggregation and liquidity density zones
// =============================================================================
//
// Tracks the latest partial book per symbol and derives density zones: price
// bands where resting liquidity is materially above the book's average level
// size. A zone's `eaten_ratio` measures how much of its initial volume has
// been consumed since first detection; the momentum filter treats a mostly
// eaten zone in the breakout direction as confirmation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::exchange::OrderBook;
use crate::types::OrderSide;

/// A level-size multiple over the book average that qualifies as a density.
const DENSITY_VOLUME_MULTIPLE: f64 = 3.0;

/// Adjacent qualifying levels within this fraction of mid merge into a zone.
const ZONE_MERGE_PCT: f64 = 0.05;

/// One detected liquidity density zone.
#[derive(Debug, Clone, Serialize)]
pub struct DensityInfo {
    /// Which side of the book the zone rests on.
    pub side: OrderSide,
    pub price_start: f64,
    pub price_end: f64,
    /// Current resting USD notional in the zone.
    pub volume_usd: f64,
    /// Resting USD notional when the zone was first detected.
    pub initial_volume_usd: f64,
    /// Normalised strength relative to the strongest zone on the book.
    pub strength: f64,
    /// Fraction of the initial volume that has been consumed, in [0, 1].
    pub eaten_ratio: f64,
}

impl DensityInfo {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.price_start && price <= self.price_end
    }
}

#[derive(Debug, Clone, Default)]
struct BookState {
    best_bid: f64,
    best_ask: f64,
    spread_bps: f64,
    imbalance: f64,
    densities: Vec<DensityInfo>,
}

/// Latest book state per subscribed symbol.
pub struct OrderBookTracker {
    books: RwLock<HashMap<String, BookState>>,
}

impl OrderBookTracker {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Register a symbol so that stream data has somewhere to land.
    pub fn subscribe(&self, symbol: &str) {
        self.books.write().entry(symbol.to_string()).or_default();
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.books.read().contains_key(symbol)
    }

    /// Ingest a fresh book snapshot, recomputing aggregates and carrying
    /// forward density `initial_volume_usd` for zones that persist.
    pub fn update(&self, symbol: &str, book: &OrderBook) {
        let (Some(best_bid), Some(best_ask), Some(mid)) =
            (book.best_bid(), book.best_ask(), book.mid())
        else {
            return;
        };

        let spread_bps = book.spread_bps().unwrap_or(0.0);
        let imbalance = book.imbalance();

        let mut densities = detect_densities(book, mid);

        let mut books = self.books.write();
        let state = books.entry(symbol.to_string()).or_default();

        // Carry initial volumes from previously tracked overlapping zones.
        for zone in &mut densities {
            let prior = state.densities.iter().find(|old| {
                old.side == zone.side
                    && old.price_start <= zone.price_end
                    && zone.price_start <= old.price_end
            });
            if let Some(prior) = prior {
                zone.initial_volume_usd = prior.initial_volume_usd.max(zone.volume_usd);
                zone.eaten_ratio = if zone.initial_volume_usd > 0.0 {
                    (1.0 - zone.volume_usd / zone.initial_volume_usd).clamp(0.0, 1.0)
                } else {
                    0.0
                };
            }
        }

        // A wall eaten below the detection threshold is still a tracked zone:
        // its consumption is exactly the signal the filters care about. Keep
        // unmatched prior zones alive with volume re-read from their band.
        for old in &state.densities {
            let rediscovered = densities.iter().any(|z| {
                z.side == old.side && z.price_start <= old.price_end && old.price_start <= z.price_end
            });
            if rediscovered {
                continue;
            }
            let levels = match old.side {
                OrderSide::Buy => &book.bids,
                OrderSide::Sell => &book.asks,
            };
            let remaining: f64 = levels
                .iter()
                .filter(|(price, _)| *price >= old.price_start && *price <= old.price_end)
                .map(|(price, qty)| price * qty)
                .sum();

            let mut carried = old.clone();
            carried.volume_usd = remaining;
            carried.eaten_ratio = if carried.initial_volume_usd > 0.0 {
                (1.0 - remaining / carried.initial_volume_usd).clamp(0.0, 1.0)
            } else {
                0.0
            };
            densities.push(carried);
        }

        debug!(
            symbol,
            best_bid,
            best_ask,
            densities = densities.len(),
            "book updated"
        );

        *state = BookState {
            best_bid,
            best_ask,
            spread_bps,
            imbalance,
            densities,
        };
    }

    pub fn spread_bps(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.spread_bps)
    }

    pub fn imbalance(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).map(|s| s.imbalance)
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.books
            .read()
            .get(symbol)
            .filter(|s| s.best_bid > 0.0 && s.best_ask > 0.0)
            .map(|s| (s.best_bid + s.best_ask) / 2.0)
    }

    /// Density zones currently tracked for `symbol`.
    pub fn densities(&self, symbol: &str) -> Vec<DensityInfo> {
        self.books
            .read()
            .get(symbol)
            .map(|s| s.densities.clone())
            .unwrap_or_default()
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderBookTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBookTracker")
            .field("symbols", &self.books.read().len())
            .finish()
    }
}

/// Find price bands whose resting notional stands out from the book average.
fn detect_densities(book: &OrderBook, mid: f64) -> Vec<DensityInfo> {
    let mut zones = Vec::new();

    for (side, levels) in [(OrderSide::Buy, &book.bids), (OrderSide::Sell, &book.asks)] {
        if levels.is_empty() {
            continue;
        }

        let avg_notional: f64 = levels.iter().map(|(p, q)| p * q).sum::<f64>() / levels.len() as f64;
        if avg_notional <= 0.0 {
            continue;
        }

        let merge_band = mid * ZONE_MERGE_PCT / 100.0;
        let mut current: Option<DensityInfo> = None;

        for &(price, qty) in levels {
            let notional = price * qty;
            if notional < avg_notional * DENSITY_VOLUME_MULTIPLE {
                continue;
            }

            let extends = current.as_ref().is_some_and(|zone| {
                (price - zone.price_start).abs() <= merge_band
                    || (price - zone.price_end).abs() <= merge_band
            });

            if extends {
                let zone = current.as_mut().expect("checked above");
                zone.price_start = zone.price_start.min(price);
                zone.price_end = zone.price_end.max(price);
                zone.volume_usd += notional;
                zone.initial_volume_usd = zone.volume_usd;
            } else {
                if let Some(done) = current.take() {
                    zones.push(done);
                }
                current = Some(DensityInfo {
                    side,
                    price_start: price,
                    price_end: price,
                    volume_usd: notional,
                    initial_volume_usd: notional,
                    strength: 0.0,
                    eaten_ratio: 0.0,
                });
            }
        }
        if let Some(done) = current.take() {
            zones.push(done);
        }
    }

    // Normalise strength against the strongest zone.
    let max_volume = zones.iter().map(|z| z.volume_usd).fold(0.0, f64::max);
    if max_volume > 0.0 {
        for zone in &mut zones {
            zone.strength = zone.volume_usd / max_volume;
        }
    }

    zones
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the partial depth WebSocket stream for a single symbol and feed
/// book snapshots into `tracker`.
///
/// Uses the `@depth20@100ms` stream which provides the top 20 levels at 100ms
/// intervals. Runs until the stream disconnects or an error occurs, then
/// returns so that the caller (main.rs) can handle reconnection.
pub async fn run_depth_stream(symbol: &str, tracker: &Arc<OrderBookTracker>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok(book) => tracker.update(symbol, &book),
                        Err(e) => {
                            warn!(error = %e, "failed to parse depth message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a partial-depth message into an [`OrderBook`].
///
/// Expected shape:
/// ```json
/// { "b": [["37000.00", "1.5"], ...], "a": [["37001.00", "1.2"], ...] }
/// ```
fn parse_depth_message(text: &str) -> Result<OrderBook> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse depth JSON")?;

    // Futures streams use "b"/"a"; REST snapshots use "bids"/"asks".
    let bids = root.get("b").or_else(|| root.get("bids"));
    let asks = root.get("a").or_else(|| root.get("asks"));

    let parse = |val: Option<&serde_json::Value>| -> Vec<(f64, f64)> {
        val.and_then(|v| v.as_array())
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|level| {
                        let price: f64 = level.get(0)?.as_str()?.parse().ok()?;
                        let qty: f64 = level.get(1)?.as_str()?.parse().ok()?;
                        Some((price, qty))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(OrderBook {
        bids: parse(bids),
        asks: parse(asks),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat book with one oversized ask level at 102.0.
    fn book_with_ask_wall() -> OrderBook {
        OrderBook {
            bids: vec![(99.9, 1.0), (99.8, 1.0), (99.7, 1.0)],
            asks: vec![(100.1, 1.0), (101.0, 1.0), (102.0, 50.0), (103.0, 1.0)],
        }
    }

    #[test]
    fn density_detected_on_oversized_level() {
        let tracker = OrderBookTracker::new();
        tracker.update("BTCUSDT", &book_with_ask_wall());

        let densities = tracker.densities("BTCUSDT");
        assert_eq!(densities.len(), 1);
        let zone = &densities[0];
        assert_eq!(zone.side, OrderSide::Sell);
        assert!(zone.contains(102.0));
        assert!((zone.strength - 1.0).abs() < f64::EPSILON);
        assert_eq!(zone.eaten_ratio, 0.0);
    }

    #[test]
    fn eaten_ratio_tracks_consumed_volume() {
        let tracker = OrderBookTracker::new();
        tracker.update("BTCUSDT", &book_with_ask_wall());

        // Same wall, 80% consumed.
        let mut eaten = book_with_ask_wall();
        eaten.asks[2] = (102.0, 10.0);
        tracker.update("BTCUSDT", &eaten);

        let densities = tracker.densities("BTCUSDT");
        assert_eq!(densities.len(), 1);
        let ratio = densities[0].eaten_ratio;
        assert!((ratio - 0.8).abs() < 0.01, "got {ratio}");
    }

    #[test]
    fn aggregates_follow_book() {
        let tracker = OrderBookTracker::new();
        tracker.update("BTCUSDT", &book_with_ask_wall());

        assert!((tracker.mid("BTCUSDT").unwrap() - 100.0).abs() < f64::EPSILON);
        assert!(tracker.spread_bps("BTCUSDT").unwrap() > 0.0);
        // Heavy ask side pushes imbalance negative.
        assert!(tracker.imbalance("BTCUSDT").unwrap() <= 0.0);
    }

    #[test]
    fn no_density_on_flat_book() {
        let tracker = OrderBookTracker::new();
        let flat = OrderBook {
            bids: vec![(99.9, 1.0), (99.8, 1.1), (99.7, 0.9)],
            asks: vec![(100.1, 1.0), (100.2, 1.1), (100.3, 0.9)],
        };
        tracker.update("BTCUSDT", &flat);
        assert!(tracker.densities("BTCUSDT").is_empty());
    }

    #[test]
    fn unsubscribed_symbol_reports_none() {
        let tracker = OrderBookTracker::new();
        assert!(tracker.imbalance("NOSUCH").is_none());
        assert!(tracker.densities("NOSUCH").is_empty());
    }

    #[test]
    fn parse_depth_message_futures_shape() {
        let json = r#"{ "e": "depthUpdate", "b": [["100.0", "2.0"]], "a": [["101.0", "3.0"]] }"#;
        let book = parse_depth_message(json).unwrap();
        assert_eq!(book.bids, vec![(100.0, 2.0)]);
        assert_eq!(book.asks, vec![(101.0, 3.0)]);
    }
}

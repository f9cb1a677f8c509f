// =============================================================================
// Trading Levels — swing detection, touch clustering, strength
// =============================================================================
//
// A level is born from clustered swing points: swing highs make resistance,
// swing lows make support. Touches cluster when they sit within
// `touch_threshold_atr * ATR` of each other; a cluster qualifies as a level
// once it has `min_touches` touches. Strength combines touch count, recency
// of the last touch, and the base height between the level and the nearest
// opposing cluster. Levels are immutable once constructed.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::LevelsConfig;
use crate::market_data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelKind {
    Support,
    Resistance,
}

impl std::fmt::Display for LevelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Support => write!(f, "support"),
            Self::Resistance => write!(f, "resistance"),
        }
    }
}

/// One constructed support/resistance level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingLevel {
    pub price: f64,
    pub kind: LevelKind,
    pub touch_count: u32,
    /// Normalised strength in [0, 1].
    pub strength: f64,
    pub first_touch_ts: i64,
    pub last_touch_ts: i64,
    /// Range between this level and the opposing swing cluster.
    pub base_height: f64,
}

/// A raw swing point before clustering.
#[derive(Debug, Clone, Copy)]
struct SwingPoint {
    price: f64,
    ts_ms: i64,
    index: usize,
}

/// Candles on each side that a swing extreme must dominate.
const SWING_WINDOW: usize = 2;

/// Touch count at which the touch score saturates.
const TOUCH_SATURATION: f64 = 5.0;

/// ATR multiples at which the base-height score saturates.
const BASE_HEIGHT_SATURATION_ATR: f64 = 4.0;

/// Construct levels from the trailing `config.lookback_candles` candles.
///
/// Returns an empty vector when the series is too short or ATR is not
/// positive.
pub fn build_levels(candles: &[Candle], atr: f64, config: &LevelsConfig) -> Vec<TradingLevel> {
    if atr <= 0.0 || candles.len() < SWING_WINDOW * 2 + 1 {
        return Vec::new();
    }

    let start = candles.len().saturating_sub(config.lookback_candles);
    let window = &candles[start..];

    let (swing_highs, swing_lows) = find_swings(window);

    let high_clusters = cluster_swings(&swing_highs, atr * config.touch_threshold_atr);
    let low_clusters = cluster_swings(&swing_lows, atr * config.touch_threshold_atr);

    let total_bars = window.len();
    let last_ts = window.last().map(|c| c.ts_ms).unwrap_or(0);
    let bar_ms = window
        .windows(2)
        .map(|w| w[1].ts_ms - w[0].ts_ms)
        .find(|d| *d > 0)
        .unwrap_or(300_000);

    let mut levels = Vec::new();

    for (clusters, kind, opposing) in [
        (&high_clusters, LevelKind::Resistance, &low_clusters),
        (&low_clusters, LevelKind::Support, &high_clusters),
    ] {
        for cluster in clusters.iter() {
            let touch_count = cluster.len() as u32;
            if touch_count < config.min_touches {
                continue;
            }

            let price = cluster.iter().map(|s| s.price).sum::<f64>() / cluster.len() as f64;
            let first_touch_ts = cluster.iter().map(|s| s.ts_ms).min().unwrap_or(0);
            let last_touch_ts = cluster.iter().map(|s| s.ts_ms).max().unwrap_or(0);

            // Base height: distance to the nearest opposing cluster, falling
            // back to the full window range when no opposing swings exist.
            let base_height = opposing
                .iter()
                .map(|c| {
                    let opp = c.iter().map(|s| s.price).sum::<f64>() / c.len() as f64;
                    (price - opp).abs()
                })
                .fold(f64::NAN, f64::min);
            let base_height = if base_height.is_finite() {
                base_height
            } else {
                window_range(window)
            };

            let bars_since_last = ((last_ts - last_touch_ts) / bar_ms).max(0) as f64;
            let strength = level_strength(touch_count, bars_since_last, total_bars, base_height, atr);
            if strength < config.strength_threshold {
                continue;
            }

            levels.push(TradingLevel {
                price,
                kind,
                touch_count,
                strength,
                first_touch_ts,
                last_touch_ts,
                base_height,
            });
        }
    }

    merge_close_levels(&mut levels, atr * config.merge_threshold_atr);
    levels.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    levels
}

/// Swing highs and lows: bars whose extreme dominates `SWING_WINDOW`
/// neighbours on both sides.
fn find_swings(candles: &[Candle]) -> (Vec<SwingPoint>, Vec<SwingPoint>) {
    let mut highs = Vec::new();
    let mut lows = Vec::new();

    for i in SWING_WINDOW..candles.len().saturating_sub(SWING_WINDOW) {
        let candle = &candles[i];
        let neighbourhood = &candles[i - SWING_WINDOW..=i + SWING_WINDOW];

        if neighbourhood.iter().all(|c| candle.high >= c.high) {
            highs.push(SwingPoint {
                price: candle.high,
                ts_ms: candle.ts_ms,
                index: i,
            });
        }
        if neighbourhood.iter().all(|c| candle.low <= c.low) {
            lows.push(SwingPoint {
                price: candle.low,
                ts_ms: candle.ts_ms,
                index: i,
            });
        }
    }

    (highs, lows)
}

/// Group swing points whose prices sit within `threshold` of the cluster mean.
fn cluster_swings(swings: &[SwingPoint], threshold: f64) -> Vec<Vec<SwingPoint>> {
    let mut sorted: Vec<SwingPoint> = swings.to_vec();
    sorted.sort_by(|a, b| a.price.total_cmp(&b.price));

    let mut clusters: Vec<Vec<SwingPoint>> = Vec::new();
    for swing in sorted {
        match clusters.last_mut() {
            Some(cluster) => {
                let mean = cluster.iter().map(|s| s.price).sum::<f64>() / cluster.len() as f64;
                if (swing.price - mean).abs() <= threshold {
                    cluster.push(swing);
                } else {
                    clusters.push(vec![swing]);
                }
            }
            None => clusters.push(vec![swing]),
        }
    }

    // A touch is one bar; a cluster of swings from the same bar stays one touch.
    for cluster in &mut clusters {
        cluster.dedup_by_key(|s| s.index);
    }

    clusters
}

/// Strength is the geometric mean of three monotone components: touches,
/// recency of the last touch, and base height in ATR units.
fn level_strength(
    touch_count: u32,
    bars_since_last: f64,
    total_bars: usize,
    base_height: f64,
    atr: f64,
) -> f64 {
    let touch_score = (touch_count as f64 / TOUCH_SATURATION).min(1.0);
    let recency_score = (1.0 - bars_since_last / total_bars.max(1) as f64).clamp(0.0, 1.0);
    let base_score = (base_height / (atr * BASE_HEIGHT_SATURATION_ATR)).min(1.0);

    (touch_score * recency_score * base_score).cbrt().clamp(0.0, 1.0)
}

fn window_range(candles: &[Candle]) -> f64 {
    let high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    (high - low).max(0.0)
}

/// Merge same-kind levels closer than `threshold`, keeping the stronger one's
/// price and pooling touch counts.
fn merge_close_levels(levels: &mut Vec<TradingLevel>, threshold: f64) {
    levels.sort_by(|a, b| a.price.total_cmp(&b.price));

    let mut merged: Vec<TradingLevel> = Vec::new();
    for level in levels.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.kind == level.kind && (level.price - prev.price).abs() <= threshold => {
                let stronger = if level.strength > prev.strength {
                    &level
                } else {
                    &*prev
                };
                let mut combined = stronger.clone();
                combined.touch_count = prev.touch_count + level.touch_count;
                combined.first_touch_ts = prev.first_touch_ts.min(level.first_touch_ts);
                combined.last_touch_ts = prev.last_touch_ts.max(level.last_touch_ts);
                combined.strength = prev.strength.max(level.strength);
                *prev = combined;
            }
            _ => merged.push(level),
        }
    }

    *levels = merged;
}

// =============================================================================
// Tests
// =============================================================================

// =============================================================================
// Breakout Scanner — universe filters, candidate scoring, level construction
// =============================================================================
//
// The scanner reduces a batch of market-data snapshots to a ranked candidate
// list. A symbol must pass every liquidity/volatility/activity filter to be
// scored; every filter's boolean outcome is recorded for diagnostics either
// way. Survivors get a weighted score over normalised components and a set of
// support/resistance levels built from their 5m candles.
// =============================================================================

pub mod levels;

pub use levels::{build_levels, LevelKind, TradingLevel};

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::config::LevelsConfig;
use crate::indicators::correlation::return_correlation;
use crate::market_data::MarketData;
use crate::types::now_ms;

/// One scored scan candidate.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub symbol: String,
    /// Aggregate score in [0, 1].
    pub score: f64,
    /// 0-based rank after sorting by score descending.
    pub rank: usize,
    pub filter_results: BTreeMap<String, bool>,
    pub score_components: BTreeMap<String, f64>,
    pub levels: Vec<TradingLevel>,
    pub market_data: MarketData,
    pub ts_ms: i64,
    pub correlation_id: String,
}

/// Aggregate diagnostics for the most recent scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScannerSnapshot {
    pub markets_considered: usize,
    pub candidates: usize,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub filter_pass: BTreeMap<String, usize>,
    pub filter_fail: BTreeMap<String, usize>,
    pub signal_count: usize,
}

/// 5m candles per hour, for the 1h volume-surge window.
const CANDLES_PER_HOUR: usize = 12;

/// Trailing candles that form the volume baseline.
const VOLUME_BASELINE_CANDLES: usize = 48;

pub struct BreakoutScanner {
    scanner_config: ScannerConfig,
    levels_config: LevelsConfig,
    last_snapshot: RwLock<ScannerSnapshot>,
}

impl BreakoutScanner {
    pub fn new(scanner_config: ScannerConfig, levels_config: LevelsConfig) -> Self {
        Self {
            scanner_config,
            levels_config,
            last_snapshot: RwLock::new(ScannerSnapshot::default()),
        }
    }

    /// Filter, score, and rank a batch of snapshots. `btc` (when present)
    /// refreshes each candidate's BTC correlation before scoring.
    pub fn scan(&self, markets: &[MarketData], btc: Option<&MarketData>) -> Vec<ScanResult> {
        let mut snapshot = ScannerSnapshot {
            markets_considered: markets.len(),
            min_score: f64::MAX,
            ..Default::default()
        };

        let mut results = Vec::new();

        for md in markets {
            if !md.is_well_formed(self.levels_config.lookback_candles.min(30)) {
                debug!(symbol = %md.symbol, "skipping malformed snapshot");
                continue;
            }

            let mut md = md.clone();
            if let Some(btc) = btc {
                md.btc_correlation = return_correlation(&md.candles_5m, &btc.candles_5m);
            }

            let filter_results = self.apply_filters(&md);
            for (name, passed) in &filter_results {
                let bucket = if *passed {
                    &mut snapshot.filter_pass
                } else {
                    &mut snapshot.filter_fail
                };
                *bucket.entry(name.clone()).or_insert(0) += 1;
            }

            if !filter_results.values().all(|v| *v) {
                continue;
            }

            let score_components = self.score_components(&md);
            let score = self.weighted_score(&score_components);

            let levels = build_levels(&md.candles_5m, md.atr_5m, &self.levels_config);

            snapshot.min_score = snapshot.min_score.min(score);
            snapshot.max_score = snapshot.max_score.max(score);

            results.push(ScanResult {
                symbol: md.symbol.clone(),
                score,
                rank: 0,
                filter_results,
                score_components,
                levels,
                market_data: md,
                ts_ms: now_ms(),
                correlation_id: Uuid::new_v4().to_string(),
            });
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(self.scanner_config.max_candidates);
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank;
        }

        snapshot.candidates = results.len();
        if results.is_empty() {
            snapshot.min_score = 0.0;
        } else {
            snapshot.avg_score =
                results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64;
        }

        info!(
            considered = snapshot.markets_considered,
            candidates = snapshot.candidates,
            avg_score = snapshot.avg_score,
            "scan complete"
        );

        *self.last_snapshot.write() = snapshot;
        results
    }

    /// Record how many signals the last scan ultimately produced.
    pub fn note_signal_count(&self, count: usize) {
        self.last_snapshot.write().signal_count = count;
    }

    pub fn snapshot(&self) -> ScannerSnapshot {
        self.last_snapshot.read().clone()
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    fn apply_filters(&self, md: &MarketData) -> BTreeMap<String, bool> {
        let cfg = &self.scanner_config;
        let mut results = BTreeMap::new();

        results.insert(
            "min_24h_volume".to_string(),
            md.volume_24h_usd >= cfg.min_24h_volume_usd,
        );
        results.insert("min_oi".to_string(), md.open_interest_usd >= cfg.min_oi_usd);

        let (spread_ok, depth_0_3_ok, depth_0_5_ok) = match &md.l2_depth {
            Some(depth) => (
                depth.spread_bps <= cfg.max_spread_pct * 100.0,
                depth.bid_usd_0_3pct.min(depth.ask_usd_0_3pct) >= cfg.min_depth_0_3pct_usd,
                depth.bid_usd_0_5pct.min(depth.ask_usd_0_5pct) >= cfg.min_depth_0_5pct_usd,
            ),
            None => (false, false, false),
        };
        results.insert("spread".to_string(), spread_ok);
        results.insert("depth_0_3".to_string(), depth_0_3_ok);
        results.insert("depth_0_5".to_string(), depth_0_5_ok);

        results.insert(
            "trades_per_minute".to_string(),
            md.trades_per_minute >= cfg.min_trades_per_minute,
        );

        let atr_pct = md.atr_pct();
        let (atr_min, atr_max) = cfg.atr_range_pct;
        results.insert(
            "atr_range".to_string(),
            atr_pct >= atr_min && atr_pct <= atr_max,
        );

        results.insert(
            "volume_surge_1h".to_string(),
            volume_surge(&md.candles_5m, CANDLES_PER_HOUR) >= cfg.volume_surge_1h,
        );
        results.insert(
            "volume_surge_5m".to_string(),
            volume_surge(&md.candles_5m, 1) >= cfg.volume_surge_5m,
        );

        results
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    fn score_components(&self, md: &MarketData) -> BTreeMap<String, f64> {
        let cfg = &self.scanner_config;
        let mut components = BTreeMap::new();

        // Liquidity: volume and depth headroom over the filter minimums.
        let volume_headroom = (md.volume_24h_usd / (cfg.min_24h_volume_usd * 10.0)).min(1.0);
        let depth_headroom = md
            .l2_depth
            .as_ref()
            .map(|d| {
                (d.bid_usd_0_5pct.min(d.ask_usd_0_5pct) / (cfg.min_depth_0_5pct_usd * 10.0)).min(1.0)
            })
            .unwrap_or(0.0);
        components.insert("liquidity".to_string(), (volume_headroom + depth_headroom) / 2.0);

        // Volatility: position of ATR inside the accepted band, peaking at
        // the band centre.
        let (atr_min, atr_max) = cfg.atr_range_pct;
        let atr_pct = md.atr_pct();
        let band = (atr_max - atr_min).max(f64::EPSILON);
        let centred = 1.0 - ((atr_pct - (atr_min + band / 2.0)).abs() / (band / 2.0));
        components.insert("volatility".to_string(), centred.clamp(0.0, 1.0));

        // Momentum: net move over the last hour in ATR units.
        let momentum = momentum_in_atr(md).min(1.0);
        components.insert("momentum".to_string(), momentum);

        // Volume: 1h surge, saturating at 2x the required multiple.
        let surge = volume_surge(&md.candles_5m, CANDLES_PER_HOUR);
        let volume_score = (surge / (cfg.volume_surge_1h * 2.0)).min(1.0);
        components.insert("volume".to_string(), volume_score);

        components
    }

    fn weighted_score(&self, components: &BTreeMap<String, f64>) -> f64 {
        let w = &self.scanner_config.score_weights;
        let total_weight = w.liquidity + w.volatility + w.momentum + w.volume;
        if total_weight <= 0.0 {
            return 0.0;
        }

        let get = |name: &str| components.get(name).copied().unwrap_or(0.0);
        let raw = get("liquidity") * w.liquidity
            + get("volatility") * w.volatility
            + get("momentum") * w.momentum
            + get("volume") * w.volume;

        (raw / total_weight).clamp(0.0, 1.0)
    }
}

/// Ratio of the trailing `window` candles' volume to the baseline average of
/// the same window length over `VOLUME_BASELINE_CANDLES` prior candles.
fn volume_surge(candles: &[crate::market_data::Candle], window: usize) -> f64 {
    if candles.len() < window + window {
        return 0.0;
    }

    let recent: f64 = candles[candles.len() - window..].iter().map(|c| c.volume).sum();

    let baseline_start = candles
        .len()
        .saturating_sub(window + VOLUME_BASELINE_CANDLES)
        .min(candles.len() - window - 1);
    let baseline = &candles[baseline_start..candles.len() - window];
    if baseline.is_empty() {
        return 0.0;
    }
    let baseline_avg: f64 =
        baseline.iter().map(|c| c.volume).sum::<f64>() / baseline.len() as f64 * window as f64;

    if baseline_avg > 0.0 {
        recent / baseline_avg
    } else {
        0.0
    }
}

/// Net close-to-close move over the last hour, in ATR units.
fn momentum_in_atr(md: &MarketData) -> f64 {
    let candles = &md.candles_5m;
    if candles.len() <= CANDLES_PER_HOUR || md.atr_5m <= 0.0 {
        return 0.0;
    }
    let now = candles[candles.len() - 1].close;
    let then = candles[candles.len() - 1 - CANDLES_PER_HOUR].close;
    ((now - then).abs() / md.atr_5m / CANDLES_PER_HOUR as f64 * 4.0).clamp(0.0, 1.0)
}

// =============================================================================
// Tests
// =============================================================================

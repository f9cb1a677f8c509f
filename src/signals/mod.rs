// =============================================================================
// Signal model and Signal Manager
// =============================================================================
//
// The manager owns the pool of active signals. Per generation pass it:
//
//   1. expires signals older than the configured timeout into history,
//   2. runs both strategies over each scan candidate,
//   3. drops duplicates of already-active signals,
//   4. applies the microstructure filters, and
//   5. attaches the originating market-data snapshot.
//
// The active pool is hard-capped; history is bounded.
// =============================================================================

pub mod momentum;
pub mod retest;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Preset;
use crate::market_data::MarketData;
use crate::microstructure::{DensityInfo, OrderBookTracker, TradesAggregator};
use crate::risk::PositionSize;
use crate::scanner::ScanResult;
use crate::tp_optimizer::{DensityZone, SrLevel, TpOptimizer};
use crate::types::{now_ms, Side, StrategyKind};

/// Milliseconds per 5-minute bar, for touch-recency arithmetic.
const BAR_MS: i64 = 300_000;

/// Lifecycle status of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Executed,
    Failed,
    Expired,
    Removed,
}

/// Attachments that ride along with a signal between phases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalMeta {
    /// Market-data snapshot the signal was generated from.
    pub market_data: Option<MarketData>,
    /// Pre-computed size from the sizing phase.
    pub position_size: Option<PositionSize>,
    /// Momentum only: whether a density wall in the breakout direction was
    /// mostly consumed when the signal fired.
    pub density_consumed: Option<bool>,
    pub removal_reason: Option<String>,
}

/// A directional entry signal.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub strategy: StrategyKind,
    pub entry: f64,
    pub stop_loss: f64,
    /// Take-profit prices ordered in the direction of travel.
    pub take_profits: Vec<f64>,
    pub confidence: f64,
    pub reason: String,
    pub created_ts: i64,
    pub executed_ts: Option<i64>,
    pub status: SignalStatus,
    pub correlation_id: String,
    pub meta: SignalMeta,
}

impl Signal {
    /// Long: stop < entry < tp[0] < tp[1] < ... — mirrored for short.
    pub fn prices_are_ordered(&self) -> bool {
        let mut chain = Vec::with_capacity(self.take_profits.len() + 2);
        chain.push(self.stop_loss);
        chain.push(self.entry);
        chain.extend(&self.take_profits);

        match self.side {
            Side::Long => chain.windows(2).all(|w| w[0] < w[1]),
            Side::Short => chain.windows(2).all(|w| w[0] > w[1]),
        }
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.created_ts
    }
}

/// Scan levels double as the S/R obstacles for take-profit placement.
pub(crate) fn sr_levels_from_scan(scan: &ScanResult) -> Vec<SrLevel> {
    let latest_ts = scan
        .market_data
        .candles_5m
        .last()
        .map(|c| c.ts_ms)
        .unwrap_or(scan.ts_ms);

    scan.levels
        .iter()
        .map(|level| SrLevel {
            price: level.price,
            touches: level.touch_count,
            last_touch_bars_ago: ((latest_ts - level.last_touch_ts) / BAR_MS).max(0) as u32,
            strength: level.strength,
        })
        .collect()
}

/// Map tracked book densities into the optimizer's zone model.
fn density_zones_from(densities: &[DensityInfo]) -> Vec<DensityZone> {
    densities
        .iter()
        .map(|d| DensityZone {
            price_start: d.price_start,
            price_end: d.price_end,
            volume: d.volume_usd,
            strength: d.strength,
        })
        .collect()
}

/// Optimize the ladder against the known obstacles. A nudged ladder that
/// fails validation degrades to the base ladder.
pub(crate) fn optimized_take_profits(
    tp_optimizer: &TpOptimizer,
    entry: f64,
    stop_loss: f64,
    is_long: bool,
    density_zones: Option<&[DensityZone]>,
    sr_levels: &[SrLevel],
) -> Option<Vec<f64>> {
    let levels = match tp_optimizer.optimize(entry, stop_loss, is_long, density_zones, Some(sr_levels))
    {
        Ok(levels) => levels,
        Err(e) => {
            warn!(error = %e, "smart take-profit placement failed, using base ladder");
            tp_optimizer.optimize(entry, stop_loss, is_long, None, None).ok()?
        }
    };
    Some(levels.into_iter().map(|l| l.optimized_price).collect())
}

/// Counters exposed on the status API.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SignalMetrics {
    pub total_generated: u64,
    pub filtered_out: u64,
    pub expired: u64,
    pub executed: u64,
    pub failed: u64,
}

/// Manages the active signal pool and signal lifecycle.
pub struct SignalManager {
    preset: Preset,
    tp_optimizer: TpOptimizer,
    timeout_ms: i64,
    max_active: usize,
    max_history: usize,

    active: RwLock<Vec<Signal>>,
    history: RwLock<Vec<Signal>>,
    metrics: RwLock<SignalMetrics>,

    trades: Option<Arc<TradesAggregator>>,
    books: Option<Arc<OrderBookTracker>>,
}

impl SignalManager {
    pub fn new(
        preset: &Preset,
        trades: Option<Arc<TradesAggregator>>,
        books: Option<Arc<OrderBookTracker>>,
    ) -> Result<Self> {
        Ok(Self {
            preset: preset.clone(),
            tp_optimizer: TpOptimizer::new(&preset.position)?,
            timeout_ms: (preset.engine.signal_timeout_minutes * 60 * 1_000) as i64,
            max_active: preset.engine.max_active_signals,
            max_history: 1_000,
            active: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            metrics: RwLock::new(SignalMetrics::default()),
            trades,
            books,
        })
    }

    /// One generation pass over the latest scan results. Returns the signals
    /// newly added to the active pool.
    pub fn generate_from_scan(&self, scan_results: &[ScanResult]) -> Vec<Signal> {
        self.expire_stale();

        let mut added = Vec::new();

        for scan in scan_results {
            // Tracked liquidity walls feed straight into take-profit
            // placement alongside the candidate's own levels.
            let density_zones = self
                .books
                .as_ref()
                .map(|books| density_zones_from(&books.densities(&scan.symbol)));

            let raw = momentum::evaluate(
                scan,
                &self.preset.momentum,
                &self.tp_optimizer,
                density_zones.as_deref(),
            )
            .or_else(|| {
                retest::evaluate(
                    scan,
                    &self.preset.retest,
                    &self.tp_optimizer,
                    density_zones.as_deref(),
                )
            });

            let Some(mut signal) = raw else {
                continue;
            };
            self.metrics.write().total_generated += 1;

            if self.is_duplicate(&signal) {
                debug!(symbol = %signal.symbol, "duplicate signal dropped");
                self.metrics.write().filtered_out += 1;
                continue;
            }

            if self.active.read().len() >= self.max_active {
                warn!(cap = self.max_active, "active signal cap reached, dropping remainder");
                break;
            }

            if let Err(reason) = self.check_microstructure(&mut signal) {
                debug!(symbol = %signal.symbol, reason, "signal rejected by microstructure filter");
                self.metrics.write().filtered_out += 1;
                continue;
            }

            signal.meta.market_data = Some(scan.market_data.clone());

            info!(
                symbol = %signal.symbol,
                side = %signal.side,
                strategy = %signal.strategy,
                entry = signal.entry,
                confidence = signal.confidence,
                "signal activated"
            );

            self.active.write().push(signal.clone());
            added.push(signal);
        }

        added
    }

    /// Move signals past the timeout into history as expired. Returns the
    /// number expired.
    pub fn expire_stale(&self) -> usize {
        let now = now_ms();
        let mut expired = Vec::new();
        {
            let mut active = self.active.write();
            active.retain(|signal| {
                if signal.age_ms(now) > self.timeout_ms {
                    let mut signal = signal.clone();
                    signal.status = SignalStatus::Expired;
                    expired.push(signal);
                    false
                } else {
                    true
                }
            });
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "signals expired");
            self.metrics.write().expired += expired.len() as u64;
            for signal in expired.iter() {
                self.push_history(signal.clone());
            }
        }
        expired.len()
    }

    fn is_duplicate(&self, signal: &Signal) -> bool {
        self.active.read().iter().any(|active| {
            active.symbol == signal.symbol
                && active.side == signal.side
                && (active.entry - signal.entry).abs() <= active.entry.abs() * 0.001
        })
    }

    /// Microstructure gates. `Err(reason)` rejects the signal.
    fn check_microstructure(&self, signal: &mut Signal) -> Result<(), &'static str> {
        // Dead tape rejects a retest: a retest without participation is noise.
        if signal.strategy == StrategyKind::Retest {
            if let Some(trades) = &self.trades {
                if let Some(tpm) = trades.tpm(&signal.symbol, 60) {
                    if tpm == 0.0 {
                        return Err("no trading activity on retest (tpm=0)");
                    }
                }
            }
        }

        // Momentum: record whether the wall in the breakout direction was
        // mostly consumed. Informational only.
        if signal.strategy == StrategyKind::Momentum {
            if let Some(books) = &self.books {
                let wall_side = crate::types::OrderSide::closing(signal.side);
                let eat_ratio = self.preset.microstructure.enter_on_density_eat_ratio;
                let consumed = books
                    .densities(&signal.symbol)
                    .iter()
                    .any(|zone| zone.side == wall_side && zone.eaten_ratio >= eat_ratio);
                signal.meta.density_consumed = Some(consumed);
            }
        }

        // Fading activity rejects everything.
        if let Some(trades) = &self.trades {
            if let Some(activity) = trades.activity(&signal.symbol) {
                if activity.is_dropping {
                    return Err("activity dropping");
                }
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lifecycle updates
    // -------------------------------------------------------------------------

    pub fn active_signals(&self) -> Vec<Signal> {
        self.active.read().clone()
    }

    /// Attach a computed size to an active signal.
    pub fn set_position_size(&self, signal_id: &str, size: PositionSize) {
        let mut active = self.active.write();
        if let Some(signal) = active.iter_mut().find(|s| s.id == signal_id) {
            signal.meta.position_size = Some(size);
        }
    }

    /// Move an active signal to history as executed or failed.
    pub fn mark_executed(&self, signal_id: &str, success: bool) {
        let mut active = self.active.write();
        let Some(idx) = active.iter().position(|s| s.id == signal_id) else {
            return;
        };
        let mut signal = active.remove(idx);
        drop(active);

        signal.status = if success {
            SignalStatus::Executed
        } else {
            SignalStatus::Failed
        };
        signal.executed_ts = Some(now_ms());

        let mut metrics = self.metrics.write();
        if success {
            metrics.executed += 1;
        } else {
            metrics.failed += 1;
        }
        drop(metrics);

        debug!(signal_id, success, "signal resolved");
        self.push_history(signal);
    }

    /// Remove an active signal with a reason (risk rejection and the like).
    pub fn remove_signal(&self, signal_id: &str, reason: &str) {
        let mut active = self.active.write();
        let Some(idx) = active.iter().position(|s| s.id == signal_id) else {
            return;
        };
        let mut signal = active.remove(idx);
        drop(active);

        signal.status = SignalStatus::Removed;
        signal.meta.removal_reason = Some(reason.to_string());
        debug!(signal_id, reason, "signal removed");
        self.push_history(signal);
    }

    fn push_history(&self, signal: Signal) {
        let mut history = self.history.write();
        history.push(signal);
        while history.len() > self.max_history {
            history.remove(0);
        }
    }

    pub fn recent_history(&self, limit: usize) -> Vec<Signal> {
        let history = self.history.read();
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub fn metrics(&self) -> SignalMetrics {
        *self.metrics.read()
    }
}

impl std::fmt::Debug for SignalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalManager")
            .field("active", &self.active.read().len())
            .field("history", &self.history.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::testing::market_data;
    use crate::market_data::Candle;
    use crate::scanner::{LevelKind, TradingLevel};
    use std::collections::BTreeMap;

    /// A scan result whose last candle is a clean momentum breakout.
    fn breakout_scan(symbol: &str) -> ScanResult {
        let mut md = market_data(symbol, 50_000.0, 100.0, 40);
        let ts = md.candles_5m.last().unwrap().ts_ms + 300_000;
        md.candles_5m.push(Candle {
            ts_ms: ts,
            open: 49_900.0,
            high: 50_350.0,
            low: 49_850.0,
            close: 50_300.0,
            volume: 3_000.0,
        });
        md.price = 50_300.0;

        ScanResult {
            symbol: symbol.to_string(),
            score: 0.9,
            rank: 0,
            filter_results: BTreeMap::new(),
            score_components: BTreeMap::new(),
            levels: vec![TradingLevel {
                price: 50_000.0,
                kind: LevelKind::Resistance,
                touch_count: 5,
                strength: 0.85,
                first_touch_ts: 0,
                last_touch_ts: ts - 300_000,
                base_height: 400.0,
            }],
            market_data: md,
            ts_ms: now_ms(),
            correlation_id: "corr".to_string(),
        }
    }

    fn manager() -> SignalManager {
        SignalManager::new(&Preset::default(), None, None).unwrap()
    }

    #[test]
    fn generates_signal_with_market_data_attached() {
        let manager = manager();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        assert_eq!(added.len(), 1);
        let signal = &added[0];
        assert_eq!(signal.status, SignalStatus::Active);
        assert!(signal.meta.market_data.is_some());
        assert_eq!(manager.active_signals().len(), 1);
    }

    #[test]
    fn duplicate_signals_are_dropped() {
        let manager = manager();
        manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        assert!(added.is_empty());
        assert_eq!(manager.active_signals().len(), 1);
        assert_eq!(manager.metrics().filtered_out, 1);
    }

    #[test]
    fn stale_signals_expire_to_history() {
        let manager = manager();
        manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        // Age the signal past the timeout.
        manager.active.write()[0].created_ts = now_ms() - manager.timeout_ms - 1;
        let expired = manager.expire_stale();

        assert_eq!(expired, 1);
        assert!(manager.active_signals().is_empty());
        let history = manager.recent_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SignalStatus::Expired);
    }

    #[test]
    fn executed_and_failed_move_to_history() {
        let manager = manager();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);
        let id = added[0].id.clone();

        manager.mark_executed(&id, true);
        assert!(manager.active_signals().is_empty());
        assert_eq!(manager.recent_history(10)[0].status, SignalStatus::Executed);
        assert_eq!(manager.metrics().executed, 1);

        let added = manager.generate_from_scan(&[breakout_scan("ETHUSDT")]);
        manager.mark_executed(&added[0].id, false);
        assert_eq!(manager.recent_history(10).last().unwrap().status, SignalStatus::Failed);
    }

    #[test]
    fn active_cap_is_enforced() {
        let mut preset = Preset::default();
        preset.engine.max_active_signals = 2;
        let manager = SignalManager::new(&preset, None, None).unwrap();

        let scans: Vec<ScanResult> =
            (0..4).map(|i| breakout_scan(&format!("SYM{i}USDT"))).collect();
        let added = manager.generate_from_scan(&scans);

        assert_eq!(added.len(), 2);
        assert_eq!(manager.active_signals().len(), 2);
    }

    #[test]
    fn dropping_activity_rejects_signal() {
        let trades = Arc::new(TradesAggregator::new(0.4));
        // Busy history, dead last minute.
        let now = now_ms();
        for i in 0..480 {
            trades.process_trade("BTCUSDT", now - 540_000 + i * 1_000, 50_000.0, 1.0, false);
        }

        let manager = SignalManager::new(&Preset::default(), Some(trades), None).unwrap();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        assert!(added.is_empty());
        assert_eq!(manager.metrics().filtered_out, 1);
    }

    #[test]
    fn momentum_records_density_consumption() {
        let books = Arc::new(OrderBookTracker::new());
        // Ask wall at 50 200, 80% eaten across updates.
        let wall = crate::exchange::OrderBook {
            bids: vec![(49_990.0, 1.0), (49_980.0, 1.0), (49_970.0, 1.0)],
            asks: vec![(50_010.0, 1.0), (50_100.0, 1.0), (50_200.0, 50.0), (50_300.0, 1.0)],
        };
        books.update("BTCUSDT", &wall);
        let mut eaten = wall.clone();
        eaten.asks[2] = (50_200.0, 5.0);
        books.update("BTCUSDT", &eaten);

        let manager = SignalManager::new(&Preset::default(), None, Some(books)).unwrap();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].meta.density_consumed, Some(true));
    }

    #[test]
    fn density_zones_reach_tp_ladder() {
        let books = Arc::new(OrderBookTracker::new());
        // Ask wall sitting exactly on the 1R target (entry 50 300, risk 450).
        books.update(
            "BTCUSDT",
            &crate::exchange::OrderBook {
                bids: vec![(50_250.0, 1.0), (50_200.0, 1.0), (50_100.0, 1.0)],
                asks: vec![(50_310.0, 1.0), (50_500.0, 1.0), (50_750.0, 50.0), (51_000.0, 1.0)],
            },
        );

        let manager = SignalManager::new(&Preset::default(), None, Some(books)).unwrap();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);

        assert_eq!(added.len(), 1);
        let tp1 = added[0].take_profits[0];
        assert!(tp1 < 50_750.0, "tp1 {tp1} should be nudged below the wall");
        assert!(added[0].prices_are_ordered());
    }

    #[test]
    fn position_size_attaches_to_active_signal() {
        let manager = manager();
        let added = manager.generate_from_scan(&[breakout_scan("BTCUSDT")]);
        let id = added[0].id.clone();

        manager.set_position_size(
            &id,
            PositionSize {
                quantity: 0.1,
                notional_usd: 5_000.0,
                risk_usd: 100.0,
                risk_r: 0.01,
                stop_distance: 1_000.0,
                is_valid: true,
                reason: "sized".to_string(),
            },
        );

        let active = manager.active_signals();
        assert!(active[0].meta.position_size.is_some());
    }
}

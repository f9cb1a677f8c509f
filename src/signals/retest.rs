// =============================================================================
// Retest strategy
// =============================================================================
//
// After a breakout candle clears a level, the retest setup fires when price
// pierces back into the level by no more than `max_pierce_atr * ATR` and the
// candle closes back beyond within `pierce_tolerance_bps` of the level. Entry
// is the close of the retest candle; take-profit targets come from the ladder
// optimizer, which avoids the candidate's own levels and any tracked
// liquidity walls.

use tracing::debug;
use uuid::Uuid;

use crate::config::RetestConfig;
use crate::scanner::{LevelKind, ScanResult, TradingLevel};
use crate::signals::{optimized_take_profits, sr_levels_from_scan, Signal, SignalMeta, SignalStatus};
use crate::tp_optimizer::{DensityZone, TpOptimizer};
use crate::types::{now_ms, Side, StrategyKind};

/// How many bars back a breakout remains fresh enough to retest.
const BREAKOUT_LOOKBACK: usize = 12;

/// Evaluate the retest setup for one scan candidate.
pub fn evaluate(
    scan: &ScanResult,
    config: &RetestConfig,
    tp_optimizer: &TpOptimizer,
    density_zones: Option<&[DensityZone]>,
) -> Option<Signal> {
    let candles = &scan.market_data.candles_5m;
    let atr = scan.market_data.atr_5m;
    if candles.len() < BREAKOUT_LOOKBACK + 2 || atr <= 0.0 {
        return None;
    }

    let retest = candles.last()?;
    let history = &candles[..candles.len() - 1];
    let recent = &history[history.len() - BREAKOUT_LOOKBACK..];

    let tolerance = config.pierce_tolerance_bps / 10_000.0;
    let max_pierce = config.max_pierce_atr * atr;

    for level in &scan.levels {
        let (side, breakout_happened, pierce_depth, closed_back_beyond) = match level.kind {
            LevelKind::Resistance => {
                let broke = recent.iter().any(|c| c.close > level.price);
                let pierce = (level.price - retest.low).max(0.0);
                let closed = retest.close >= level.price * (1.0 - tolerance);
                (Side::Long, broke, pierce, closed)
            }
            LevelKind::Support => {
                let broke = recent.iter().any(|c| c.close < level.price);
                let pierce = (retest.high - level.price).max(0.0);
                let closed = retest.close <= level.price * (1.0 + tolerance);
                (Side::Short, broke, pierce, closed)
            }
        };

        // A retest needs an actual touch of the level, a bounded pierce, and
        // a close resuming the breakout direction.
        if !breakout_happened || pierce_depth <= 0.0 || pierce_depth > max_pierce || !closed_back_beyond
        {
            continue;
        }

        let entry = retest.close;
        let stop_loss = stop_for(side, level, max_pierce);
        if (entry - stop_loss).abs() <= 0.0 {
            continue;
        }

        let sr_levels = sr_levels_from_scan(scan);
        let take_profits = optimized_take_profits(
            tp_optimizer,
            entry,
            stop_loss,
            side.is_long(),
            density_zones,
            &sr_levels,
        )?;

        // Shallower pierces are cleaner retests.
        let pierce_score = 1.0 - (pierce_depth / max_pierce).clamp(0.0, 1.0);
        let confidence = (0.55 * level.strength + 0.45 * pierce_score).clamp(0.0, 1.0);

        debug!(
            symbol = %scan.symbol,
            side = %side,
            entry,
            stop_loss,
            level = level.price,
            pierce_depth,
            confidence,
            "retest signal"
        );

        return Some(Signal {
            id: Uuid::new_v4().to_string(),
            symbol: scan.symbol.clone(),
            side,
            strategy: StrategyKind::Retest,
            entry,
            stop_loss,
            take_profits,
            confidence,
            reason: format!(
                "retest of {} {:.4} (pierce {:.4} of {:.4} allowed)",
                level.kind, level.price, pierce_depth, max_pierce
            ),
            created_ts: now_ms(),
            executed_ts: None,
            status: SignalStatus::Active,
            correlation_id: scan.correlation_id.clone(),
            meta: SignalMeta::default(),
        });
    }

    None
}

/// Stop beyond the deepest tolerated pierce of the level.
fn stop_for(side: Side, level: &TradingLevel, max_pierce: f64) -> f64 {
    match side {
        Side::Long => level.price - max_pierce,
        Side::Short => level.price + max_pierce,
    }
}

// =============================================================================
// Tests
// =============================================================================

// =============================================================================
// Momentum breakout strategy
// =============================================================================
//
// Fires when the latest 5m candle:
//   (a) closes beyond an identified level by at least `epsilon_bps`,
//   (b) prints volume >= `volume_multiplier` x the recent average, and
//   (c) has a body-to-range ratio >= `body_ratio_min`.
//
// Entry is the breakout close; the stop sits at the further of the breakout
// candle's opposite extreme and the broken level. Take-profit targets come
// from the ladder optimizer, which avoids the candidate's own levels and any
// tracked liquidity walls.

use tracing::debug;
use uuid::Uuid;

use crate::config::MomentumConfig;
use crate::scanner::{LevelKind, ScanResult, TradingLevel};
use crate::signals::{optimized_take_profits, sr_levels_from_scan, Signal, SignalMeta, SignalStatus};
use crate::tp_optimizer::{DensityZone, TpOptimizer};
use crate::types::{now_ms, Side, StrategyKind};

/// Candles used for the breakout volume baseline.
const VOLUME_BASELINE: usize = 20;

/// Evaluate the momentum setup for one scan candidate.
pub fn evaluate(
    scan: &ScanResult,
    config: &MomentumConfig,
    tp_optimizer: &TpOptimizer,
    density_zones: Option<&[DensityZone]>,
) -> Option<Signal> {
    let candles = &scan.market_data.candles_5m;
    let breakout = candles.last()?;
    if candles.len() < VOLUME_BASELINE + 1 {
        return None;
    }

    // Volume confirmation against the trailing baseline.
    let baseline = &candles[candles.len() - 1 - VOLUME_BASELINE..candles.len() - 1];
    let avg_volume = baseline.iter().map(|c| c.volume).sum::<f64>() / baseline.len() as f64;
    if avg_volume <= 0.0 {
        return None;
    }
    let volume_ratio = breakout.volume / avg_volume;
    if volume_ratio < config.volume_multiplier {
        return None;
    }

    // Body confirmation: no breakout on a wick.
    let body_ratio = breakout.body_ratio();
    if body_ratio < config.body_ratio_min {
        return None;
    }

    // Find the broken level: the strongest level the close cleared by epsilon.
    let epsilon = config.epsilon_bps / 10_000.0;
    let (level, side) = scan.levels.iter().find_map(|level| {
        let cleared = match level.kind {
            LevelKind::Resistance if breakout.close >= level.price * (1.0 + epsilon) => {
                // The breakout must have happened on this candle, not bars ago.
                (breakout.open <= level.price * (1.0 + epsilon)).then_some(Side::Long)
            }
            LevelKind::Support if breakout.close <= level.price * (1.0 - epsilon) => {
                (breakout.open >= level.price * (1.0 - epsilon)).then_some(Side::Short)
            }
            _ => None,
        };
        cleared.map(|side| (level, side))
    })?;

    let entry = breakout.close;
    let stop_loss = stop_for(side, breakout.low, breakout.high, level);
    if (entry - stop_loss).abs() <= 0.0 {
        return None;
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

    let volume_score = (volume_ratio / config.volume_multiplier).min(1.0);
    let confidence = (0.5 * level.strength + 0.25 * volume_score + 0.25 * body_ratio).clamp(0.0, 1.0);

    debug!(
        symbol = %scan.symbol,
        side = %side,
        entry,
        stop_loss,
        level = level.price,
        volume_ratio,
        body_ratio,
        confidence,
        "momentum breakout signal"
    );

    Some(Signal {
        id: Uuid::new_v4().to_string(),
        symbol: scan.symbol.clone(),
        side,
        strategy: StrategyKind::Momentum,
        entry,
        stop_loss,
        take_profits,
        confidence,
        reason: format!(
            "momentum breakout of {} {:.4} ({}x volume, body {:.2})",
            level.kind, level.price, volume_ratio as u64, body_ratio
        ),
        created_ts: now_ms(),
        executed_ts: None,
        status: SignalStatus::Active,
        correlation_id: scan.correlation_id.clone(),
        meta: SignalMeta::default(),
    })
}

/// The stop sits at the further of the breakout candle's opposite extreme and
/// the broken level.
fn stop_for(side: Side, candle_low: f64, candle_high: f64, level: &TradingLevel) -> f64 {
    match side {
        Side::Long => candle_low.min(level.price),
        Side::Short => candle_high.max(level.price),
    }
}

// =============================================================================
// Tests
// =============================================================================

// =============================================================================
// Take-Profit Optimizer — ladder generation with density / S-R avoidance
// =============================================================================
//
// Base take-profit prices come from the preset ladder as reward multiples of
// the initial risk. With smart placement enabled, each rung is nudged off
// obstacles in the direction of travel:
//
//   1. Density zones — a rung inside a zone moves just in front of it
//      (zone start for longs, zone end for shorts) minus/plus a buffer.
//   2. S/R levels — a rung sitting within the buffer distance past a level
//      moves to just before that level.
//
// Validation enforces the structural invariants: sizes sum to 100% (±0.01),
// prices strictly monotone in the direction of travel, rung order preserved.
// =============================================================================

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{PositionConfig, TakeProfitSmartPlacement};

/// A price band holding materially elevated resting or traded volume.
#[derive(Debug, Clone, Serialize)]
pub struct DensityZone {
    pub price_start: f64,
    pub price_end: f64,
    pub volume: f64,
    /// Normalised strength in [0, 1].
    pub strength: f64,
}

impl DensityZone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.price_start && price <= self.price_end
    }
}

/// A support/resistance level considered during placement.
#[derive(Debug, Clone, Serialize)]
pub struct SrLevel {
    pub price: f64,
    pub touches: u32,
    pub last_touch_bars_ago: u32,
    /// Normalised strength in [0, 1].
    pub strength: f64,
}

/// One optimized rung of the ladder.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizedTpLevel {
    /// Index into the configured ladder (0, 1, 2, ...).
    pub level_index: usize,
    pub original_price: f64,
    pub optimized_price: f64,
    /// Size to close at this rung, in percent (0-100).
    pub size_percent: f64,
    /// Configured reward multiple for this rung.
    pub reward_multiple: f64,
    pub was_adjusted: bool,
    pub adjustment_reason: Option<String>,
}

/// Smart take-profit placement over a configured ladder.
pub struct TpOptimizer {
    ladder: PositionConfig,
    smart: TakeProfitSmartPlacement,
}

impl TpOptimizer {
    /// Fails on an empty ladder — a position without any exit target is a
    /// configuration bug, not a runtime condition.
    pub fn new(position_config: &PositionConfig) -> Result<Self> {
        if position_config.tp_levels.is_empty() {
            bail!("take-profit ladder must have at least one level");
        }

        debug!(
            levels = position_config.tp_levels.len(),
            smart = position_config.tp_smart_placement.enabled,
            "take-profit optimizer initialised"
        );

        Ok(Self {
            ladder: position_config.clone(),
            smart: position_config.tp_smart_placement.clone(),
        })
    }

    /// Build the optimized ladder for a position.
    pub fn optimize(
        &self,
        entry: f64,
        stop_loss: f64,
        is_long: bool,
        density_zones: Option<&[DensityZone]>,
        sr_levels: Option<&[SrLevel]>,
    ) -> Result<Vec<OptimizedTpLevel>> {
        let risk = (entry - stop_loss).abs();
        if risk <= 0.0 {
            bail!("risk (entry - stop_loss) cannot be zero");
        }

        let mut levels = self.base_levels(entry, risk, is_long);

        let has_obstacles = density_zones.is_some_and(|z| !z.is_empty())
            || sr_levels.is_some_and(|l| !l.is_empty());
        if self.smart.enabled && has_obstacles {
            for level in &mut levels {
                self.nudge_level(
                    level,
                    is_long,
                    density_zones.unwrap_or(&[]),
                    sr_levels.unwrap_or(&[]),
                );
            }

            let adjusted = levels.iter().filter(|l| l.was_adjusted).count();
            info!(adjusted, total = levels.len(), "take-profit optimization complete");
        }

        self.validate(&levels, is_long)?;
        Ok(levels)
    }

    /// Size-weighted expected reward of an optimized ladder, in R.
    pub fn expected_reward(
        &self,
        levels: &[OptimizedTpLevel],
        entry: f64,
        stop_loss: f64,
    ) -> f64 {
        let risk = (entry - stop_loss).abs();
        if risk <= 0.0 {
            return 0.0;
        }

        levels
            .iter()
            .map(|level| {
                let actual_r = (level.optimized_price - entry).abs() / risk;
                level.size_percent / 100.0 * actual_r
            })
            .sum()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn base_levels(&self, entry: f64, risk: f64, is_long: bool) -> Vec<OptimizedTpLevel> {
        self.ladder
            .tp_levels
            .iter()
            .enumerate()
            .map(|(i, rung)| {
                let distance = risk * rung.reward_multiple;
                let price = if is_long { entry + distance } else { entry - distance };
                OptimizedTpLevel {
                    level_index: i,
                    original_price: price,
                    optimized_price: price,
                    size_percent: rung.size_pct * 100.0,
                    reward_multiple: rung.reward_multiple,
                    was_adjusted: false,
                    adjustment_reason: None,
                }
            })
            .collect()
    }

    fn nudge_level(
        &self,
        level: &mut OptimizedTpLevel,
        is_long: bool,
        density_zones: &[DensityZone],
        sr_levels: &[SrLevel],
    ) {
        let price = level.original_price;

        // Density avoidance takes priority: a rung inside a zone moves to
        // just before it in the direction of travel.
        if self.smart.avoid_density_zones {
            if let Some(zone) = density_zones.iter().find(|z| z.contains(price)) {
                let buffer = price * self.smart.density_zone_buffer_bps / 10_000.0;
                level.optimized_price = if is_long {
                    zone.price_start - buffer
                } else {
                    zone.price_end + buffer
                };
                level.was_adjusted = true;
                level.adjustment_reason = Some(format!(
                    "density zone avoidance: {price:.4} -> {:.4} (zone {:.4}-{:.4}, strength {:.2})",
                    level.optimized_price, zone.price_start, zone.price_end, zone.strength
                ));
                debug!(reason = %level.adjustment_reason.as_deref().unwrap_or(""), "tp adjusted");
                return;
            }
        }

        // S/R avoidance: a rung within the buffer distance on the far side of
        // a level moves to just before that level.
        if self.smart.avoid_sr_levels {
            let buffer = price * self.smart.sr_level_buffer_bps / 10_000.0;
            for sr in sr_levels {
                if (price - sr.price).abs() > buffer {
                    continue;
                }
                let wrong_side = if is_long { price > sr.price } else { price < sr.price };
                if !wrong_side {
                    continue;
                }

                level.optimized_price = if is_long {
                    sr.price - buffer
                } else {
                    sr.price + buffer
                };
                level.was_adjusted = true;
                level.adjustment_reason = Some(format!(
                    "sr level avoidance: {price:.4} -> {:.4} (level {:.4}, touches {})",
                    level.optimized_price, sr.price, sr.touches
                ));
                debug!(reason = %level.adjustment_reason.as_deref().unwrap_or(""), "tp adjusted");
                return;
            }
        }
    }

    fn validate(&self, levels: &[OptimizedTpLevel], is_long: bool) -> Result<()> {
        if levels.is_empty() {
            bail!("no take-profit levels to validate");
        }

        let total_size: f64 = levels.iter().map(|l| l.size_percent).sum();
        if (total_size - 100.0).abs() > 0.01 {
            bail!("take-profit sizes must sum to 100%, got {total_size}%");
        }

        // Prices strictly monotone in the direction of travel, rung order
        // preserved.
        for pair in levels.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.level_index != a.level_index + 1 {
                bail!(
                    "take-profit rungs out of order: {} then {}",
                    a.level_index,
                    b.level_index
                );
            }
            let ordered = if is_long {
                b.optimized_price > a.optimized_price
            } else {
                b.optimized_price < a.optimized_price
            };
            if !ordered {
                bail!(
                    "take-profit prices not monotone: {:.4} then {:.4}",
                    a.optimized_price,
                    b.optimized_price
                );
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

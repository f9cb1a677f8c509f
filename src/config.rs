// =============================================================================
// Preset Configuration — every tunable of the engine in one hot-loadable file
// =============================================================================
//
// The preset is a JSON document grouped by concern (risk, scanner, levels,
// signals, execution, positions, position FSM). Every field carries a serde
// default so that older preset files missing new fields still deserialise.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Environment overrides are applied after loading:
//
//   ENGINE_MARKET_FETCH_LIMIT  — truncate the scan universe
//   MARKET_DATA_TIMEOUT        — market-data fan-out timeout (seconds)
//   LIVE_SCAN_CONCURRENCY      — parallel market-data fetches
//   TRADING_MODE               — "paper" | "live"
//   PAPER_STARTING_BALANCE     — simulated quote balance for paper mode
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_daily_risk_limit() -> f64 {
    0.05
}

fn default_kill_switch_loss_limit() -> f64 {
    0.10
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_correlation_limit() -> f64 {
    0.75
}

fn default_per_trade_risk_r() -> f64 {
    0.01
}

fn default_min_24h_volume_usd() -> f64 {
    10_000_000.0
}

fn default_min_oi_usd() -> f64 {
    1_000_000.0
}

fn default_max_spread_pct() -> f64 {
    0.10
}

fn default_min_depth_0_3pct_usd() -> f64 {
    50_000.0
}

fn default_min_depth_0_5pct_usd() -> f64 {
    100_000.0
}

fn default_min_trades_per_minute() -> f64 {
    5.0
}

fn default_atr_range_pct() -> (f64, f64) {
    (0.3, 8.0)
}

fn default_volume_surge_1h() -> f64 {
    1.5
}

fn default_volume_surge_5m() -> f64 {
    2.0
}

fn default_max_candidates() -> usize {
    20
}

fn default_score_weights() -> ScoreWeights {
    ScoreWeights::default()
}

fn default_lookback_candles() -> usize {
    120
}

fn default_min_touches() -> u32 {
    2
}

fn default_touch_threshold_atr() -> f64 {
    0.25
}

fn default_merge_threshold_atr() -> f64 {
    0.5
}

fn default_strength_threshold() -> f64 {
    0.4
}

fn default_momentum_epsilon_bps() -> f64 {
    8.0
}

fn default_momentum_volume_multiplier() -> f64 {
    2.5
}

fn default_momentum_body_ratio_min() -> f64 {
    0.5
}

fn default_retest_pierce_tolerance_bps() -> f64 {
    15.0
}

fn default_retest_max_pierce_atr() -> f64 {
    0.25
}

fn default_l2_imbalance_threshold() -> f64 {
    0.30
}

fn default_vwap_gap_max_atr() -> f64 {
    1.5
}

fn default_enter_on_density_eat_ratio() -> f64 {
    0.75
}

fn default_activity_drop_threshold() -> f64 {
    0.40
}

fn default_twap_min_slices() -> usize {
    4
}

fn default_twap_max_slices() -> usize {
    12
}

fn default_twap_interval_seconds() -> f64 {
    2.5
}

fn default_twap_notional_threshold_usd() -> f64 {
    10_000.0
}

fn default_iceberg_min_notional_usd() -> f64 {
    25_000.0
}

fn default_max_depth_fraction() -> f64 {
    0.25
}

fn default_limit_offset_bps() -> f64 {
    2.0
}

fn default_spread_widen_bps() -> f64 {
    10.0
}

fn default_deadman_timeout_ms() -> u64 {
    8_000
}

fn default_taker_fee_bps() -> f64 {
    5.0
}

fn default_maker_fee_bps() -> f64 {
    2.0
}

fn default_tp_levels() -> Vec<TakeProfitLevel> {
    vec![
        TakeProfitLevel {
            reward_multiple: 1.0,
            size_pct: 0.5,
        },
        TakeProfitLevel {
            reward_multiple: 2.0,
            size_pct: 0.3,
        },
        TakeProfitLevel {
            reward_multiple: 3.0,
            size_pct: 0.2,
        },
    ]
}

fn default_density_zone_buffer_bps() -> f64 {
    10.0
}

fn default_sr_level_buffer_bps() -> f64 {
    15.0
}

fn default_entry_confirmation_bars() -> u32 {
    2
}

fn default_running_breakeven_trigger_r() -> f64 {
    1.5
}

fn default_breakeven_buffer_bps() -> f64 {
    5.0
}

fn default_trailing_activation_r() -> f64 {
    2.0
}

fn default_trailing_step_bps() -> f64 {
    50.0
}

fn default_partial_closed_trail_step_bps() -> Option<f64> {
    Some(30.0)
}

fn default_signal_timeout_minutes() -> u64 {
    15
}

fn default_max_active_signals() -> usize {
    50
}

fn default_max_cache_size() -> usize {
    500
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_market_data_timeout_secs() -> u64 {
    120
}

fn default_scan_concurrency() -> usize {
    (num_cpus::get() * 2).clamp(4, 32)
}

fn default_paper_starting_balance() -> f64 {
    10_000.0
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_optimization_interval_secs() -> u64 {
    300
}

// =============================================================================
// Section structs
// =============================================================================

/// Capital-preservation limits enforced by the risk gate and health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Daily loss that pauses trading, as a fraction of equity base.
    #[serde(default = "default_daily_risk_limit")]
    pub daily_risk_limit: f64,

    /// Daily loss that latches the kill switch, as a fraction of equity base.
    #[serde(default = "default_kill_switch_loss_limit")]
    pub kill_switch_loss_limit: f64,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Maximum |BTC correlation| allowed against any other open position.
    #[serde(default = "default_correlation_limit")]
    pub correlation_limit: f64,

    /// Fraction of equity risked per trade (the "R" unit).
    #[serde(default = "default_per_trade_risk_r")]
    pub per_trade_risk_r: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Weights for the candidate score components. Normalised at use time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub liquidity: f64,
    pub volatility: f64,
    pub momentum: f64,
    pub volume: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            liquidity: 0.30,
            volatility: 0.25,
            momentum: 0.25,
            volume: 0.20,
        }
    }
}

/// Market-universe filters and candidate scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_min_24h_volume_usd")]
    pub min_24h_volume_usd: f64,

    #[serde(default = "default_min_oi_usd")]
    pub min_oi_usd: f64,

    /// Maximum allowed spread as a percentage of mid.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    #[serde(default = "default_min_depth_0_3pct_usd")]
    pub min_depth_0_3pct_usd: f64,

    #[serde(default = "default_min_depth_0_5pct_usd")]
    pub min_depth_0_5pct_usd: f64,

    #[serde(default = "default_min_trades_per_minute")]
    pub min_trades_per_minute: f64,

    /// Acceptable 5m ATR band as (min_pct, max_pct) of price.
    #[serde(default = "default_atr_range_pct")]
    pub atr_range_pct: (f64, f64),

    /// Required 1h volume surge multiple over baseline.
    #[serde(default = "default_volume_surge_1h")]
    pub volume_surge_1h: f64,

    /// Required 5m volume surge multiple over baseline.
    #[serde(default = "default_volume_surge_5m")]
    pub volume_surge_5m: f64,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    #[serde(default = "default_score_weights")]
    pub score_weights: ScoreWeights,

    /// Optional whitelist; when present the universe is intersected with it.
    #[serde(default)]
    pub symbols_whitelist: Option<Vec<String>>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Swing-level construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelsConfig {
    #[serde(default = "default_lookback_candles")]
    pub lookback_candles: usize,

    #[serde(default = "default_min_touches")]
    pub min_touches: u32,

    /// Touches cluster into one level when within this multiple of ATR.
    #[serde(default = "default_touch_threshold_atr")]
    pub touch_threshold_atr: f64,

    /// Adjacent levels merge when closer than this multiple of ATR.
    #[serde(default = "default_merge_threshold_atr")]
    pub merge_threshold_atr: f64,

    /// Levels weaker than this are dropped.
    #[serde(default = "default_strength_threshold")]
    pub strength_threshold: f64,
}

impl Default for LevelsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Momentum breakout strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    /// Close must clear the level by at least this many basis points.
    #[serde(default = "default_momentum_epsilon_bps")]
    pub epsilon_bps: f64,

    /// Breakout candle volume vs recent average.
    #[serde(default = "default_momentum_volume_multiplier")]
    pub volume_multiplier: f64,

    /// Minimum body-to-range ratio of the breakout candle.
    #[serde(default = "default_momentum_body_ratio_min")]
    pub body_ratio_min: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Retest strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetestConfig {
    /// Close must settle back within this many bps of the level.
    #[serde(default = "default_retest_pierce_tolerance_bps")]
    pub pierce_tolerance_bps: f64,

    /// Maximum pierce back into the level, in ATR multiples.
    #[serde(default = "default_retest_max_pierce_atr")]
    pub max_pierce_atr: f64,
}

impl Default for RetestConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Microstructure filter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrostructureConfig {
    #[serde(default = "default_l2_imbalance_threshold")]
    pub l2_imbalance_threshold: f64,

    #[serde(default = "default_vwap_gap_max_atr")]
    pub vwap_gap_max_atr: f64,

    /// Density in breakout direction counts as consumed at this eaten ratio.
    #[serde(default = "default_enter_on_density_eat_ratio")]
    pub enter_on_density_eat_ratio: f64,

    /// Relative activity drop that marks a symbol as dying.
    #[serde(default = "default_activity_drop_threshold")]
    pub activity_drop_threshold: f64,
}

impl Default for MicrostructureConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Order slicing and fee parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_true")]
    pub enable_twap: bool,

    #[serde(default = "default_true")]
    pub enable_iceberg: bool,

    #[serde(default = "default_twap_min_slices")]
    pub twap_min_slices: usize,

    #[serde(default = "default_twap_max_slices")]
    pub twap_max_slices: usize,

    #[serde(default = "default_twap_interval_seconds")]
    pub twap_interval_seconds: f64,

    /// Notional above which an order is sliced at all.
    #[serde(default = "default_twap_notional_threshold_usd")]
    pub twap_notional_threshold_usd: f64,

    /// Notional above which slices post as limit orders near mid.
    #[serde(default = "default_iceberg_min_notional_usd")]
    pub iceberg_min_notional_usd: f64,

    /// Each displayed slice must stay below this fraction of book depth.
    #[serde(default = "default_max_depth_fraction")]
    pub max_depth_fraction: f64,

    #[serde(default = "default_limit_offset_bps")]
    pub limit_offset_bps: f64,

    /// Abort posting passively when the spread widens beyond this.
    #[serde(default = "default_spread_widen_bps")]
    pub spread_widen_bps: f64,

    #[serde(default = "default_deadman_timeout_ms")]
    pub deadman_timeout_ms: u64,

    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,

    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// One rung of the take-profit ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    /// Distance from entry in R multiples.
    pub reward_multiple: f64,
    /// Fraction of the position closed at this rung (0.0–1.0).
    pub size_pct: f64,
}

/// Smart take-profit placement toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitSmartPlacement {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub avoid_density_zones: bool,

    #[serde(default = "default_true")]
    pub avoid_sr_levels: bool,

    #[serde(default = "default_density_zone_buffer_bps")]
    pub density_zone_buffer_bps: f64,

    #[serde(default = "default_sr_level_buffer_bps")]
    pub sr_level_buffer_bps: f64,
}

impl Default for TakeProfitSmartPlacement {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Position and take-profit ladder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    #[serde(default = "default_tp_levels")]
    pub tp_levels: Vec<TakeProfitLevel>,

    #[serde(default)]
    pub tp_smart_placement: TakeProfitSmartPlacement,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            tp_levels: default_tp_levels(),
            tp_smart_placement: TakeProfitSmartPlacement::default(),
        }
    }
}

/// Position lifecycle FSM thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmConfig {
    #[serde(default = "default_entry_confirmation_bars")]
    pub entry_confirmation_bars: u32,

    #[serde(default = "default_true")]
    pub breakeven_lock_profit_enabled: bool,

    /// R multiple at which the stop moves to breakeven.
    #[serde(default = "default_running_breakeven_trigger_r")]
    pub running_breakeven_trigger_r: f64,

    #[serde(default = "default_breakeven_buffer_bps")]
    pub breakeven_buffer_bps: f64,

    /// R multiple at which trailing activates; <= 0 disables trailing.
    #[serde(default = "default_trailing_activation_r")]
    pub trailing_activation_r: f64,

    #[serde(default = "default_trailing_step_bps")]
    pub trailing_step_bps: f64,

    #[serde(default = "default_true")]
    pub partial_closed_trail_enabled: bool,

    /// Tighter trail step once a TP rung has been realised.
    #[serde(default = "default_partial_closed_trail_step_bps")]
    pub partial_closed_trail_step_bps: Option<f64>,
}

impl Default for FsmConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

/// Engine-level operational settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default = "default_paper_starting_balance")]
    pub paper_starting_balance: f64,

    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    #[serde(default = "default_signal_timeout_minutes")]
    pub signal_timeout_minutes: u64,

    #[serde(default = "default_max_active_signals")]
    pub max_active_signals: usize,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// 0 means no truncation of the scan universe.
    #[serde(default)]
    pub market_fetch_limit: usize,

    #[serde(default = "default_market_data_timeout_secs")]
    pub market_data_timeout_secs: u64,

    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    #[serde(default = "default_optimization_interval_secs")]
    pub optimization_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}

// =============================================================================
// Preset
// =============================================================================

/// Top-level preset for the Kairos engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preset {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub levels: LevelsConfig,

    #[serde(default)]
    pub momentum: MomentumConfig,

    #[serde(default)]
    pub retest: RetestConfig,

    #[serde(default)]
    pub microstructure: MicrostructureConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub position: PositionConfig,

    #[serde(default)]
    pub fsm: FsmConfig,
}

impl Preset {
    /// Load a preset from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read preset from {}", path.display()))?;

        let preset: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse preset from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %preset.engine.trading_mode,
            max_candidates = preset.scanner.max_candidates,
            "preset loaded"
        );

        Ok(preset)
    }

    /// Persist the preset to `path` using an atomic write (write to `.tmp`,
    /// then rename). This prevents corruption if the process crashes
    /// mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise preset to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp preset to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp preset to {}", path.display()))?;

        info!(path = %path.display(), "preset saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides on top of the loaded preset.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ENGINE_MARKET_FETCH_LIMIT") {
            match v.parse::<usize>() {
                Ok(limit) => {
                    info!(limit, "ENGINE_MARKET_FETCH_LIMIT override applied");
                    self.engine.market_fetch_limit = limit;
                }
                Err(_) => warn!(value = %v, "invalid ENGINE_MARKET_FETCH_LIMIT ignored"),
            }
        }

        if let Ok(v) = std::env::var("MARKET_DATA_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(secs) => {
                    info!(secs, "MARKET_DATA_TIMEOUT override applied");
                    self.engine.market_data_timeout_secs = secs;
                }
                Err(_) => warn!(value = %v, "invalid MARKET_DATA_TIMEOUT ignored"),
            }
        }

        if let Ok(v) = std::env::var("LIVE_SCAN_CONCURRENCY") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => {
                    info!(concurrency = n, "LIVE_SCAN_CONCURRENCY override applied");
                    self.engine.scan_concurrency = n;
                }
                _ => warn!(value = %v, "invalid LIVE_SCAN_CONCURRENCY ignored"),
            }
        }

        if let Ok(v) = std::env::var("TRADING_MODE") {
            match v.to_lowercase().as_str() {
                "paper" => self.engine.trading_mode = TradingMode::Paper,
                "live" => self.engine.trading_mode = TradingMode::Live,
                _ => warn!(value = %v, "invalid TRADING_MODE ignored"),
            }
        }

        if let Ok(v) = std::env::var("PAPER_STARTING_BALANCE") {
            match v.parse::<f64>() {
                Ok(bal) if bal > 0.0 => self.engine.paper_starting_balance = bal,
                _ => warn!(value = %v, "invalid PAPER_STARTING_BALANCE ignored"),
            }
        }
    }

    /// Sanity-check cross-field constraints that serde defaults cannot see.
    pub fn validate(&self) -> Result<()> {
        if self.position.tp_levels.is_empty() {
            anyhow::bail!("preset must configure at least one take-profit level");
        }

        let size_sum: f64 = self.position.tp_levels.iter().map(|l| l.size_pct).sum();
        if (size_sum - 1.0).abs() > 1e-4 {
            anyhow::bail!("take-profit sizes must sum to 1.0, got {size_sum}");
        }

        if self.execution.twap_min_slices == 0
            || self.execution.twap_min_slices > self.execution.twap_max_slices
        {
            anyhow::bail!(
                "invalid TWAP slice bounds: min {} max {}",
                self.execution.twap_min_slices,
                self.execution.twap_max_slices
            );
        }

        if self.risk.per_trade_risk_r <= 0.0 {
            anyhow::bail!("per_trade_risk_r must be positive");
        }

        let (atr_min, atr_max) = self.scanner.atr_range_pct;
        if atr_min < 0.0 || atr_min >= atr_max {
            anyhow::bail!("invalid ATR range: ({atr_min}, {atr_max})");
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_has_expected_values() {
        let preset = Preset::default();
        assert_eq!(preset.engine.trading_mode, TradingMode::Paper);
        assert!((preset.engine.paper_starting_balance - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(preset.risk.max_concurrent_positions, 3);
        assert!((preset.risk.per_trade_risk_r - 0.01).abs() < f64::EPSILON);
        assert_eq!(preset.scanner.max_candidates, 20);
        assert_eq!(preset.levels.min_touches, 2);
        assert!((preset.momentum.epsilon_bps - 8.0).abs() < f64::EPSILON);
        assert!((preset.retest.max_pierce_atr - 0.25).abs() < f64::EPSILON);
        assert_eq!(preset.execution.deadman_timeout_ms, 8_000);
        assert_eq!(preset.position.tp_levels.len(), 3);
        assert_eq!(preset.fsm.entry_confirmation_bars, 2);
        preset.validate().unwrap();
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let preset: Preset = serde_json::from_str("{}").unwrap();
        assert_eq!(preset.engine.trading_mode, TradingMode::Paper);
        assert_eq!(preset.engine.signal_timeout_minutes, 15);
        assert_eq!(preset.engine.max_active_signals, 50);
        assert!(preset.execution.enable_twap);
        assert!(preset.position.tp_smart_placement.enabled);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "engine": { "trading_mode": "live" },
            "risk": { "max_concurrent_positions": 5 }
        }"#;
        let preset: Preset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.engine.trading_mode, TradingMode::Live);
        assert_eq!(preset.risk.max_concurrent_positions, 5);
        assert!((preset.risk.daily_risk_limit - 0.05).abs() < f64::EPSILON);
        assert_eq!(preset.scanner.max_candidates, 20);
    }

    #[test]
    fn roundtrip_serialisation() {
        let preset = Preset::default();
        let json = serde_json::to_string(&preset).unwrap();
        let back: Preset = serde_json::from_str(&json).unwrap();
        assert_eq!(back.engine.trading_mode, preset.engine.trading_mode);
        assert_eq!(back.position.tp_levels.len(), preset.position.tp_levels.len());
        assert_eq!(back.scanner.max_candidates, preset.scanner.max_candidates);
    }

    #[test]
    fn validate_rejects_bad_tp_ladder() {
        let mut preset = Preset::default();
        preset.position.tp_levels = vec![TakeProfitLevel {
            reward_multiple: 2.0,
            size_pct: 0.5,
        }];
        assert!(preset.validate().is_err());

        preset.position.tp_levels.clear();
        assert!(preset.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_slice_bounds() {
        let mut preset = Preset::default();
        preset.execution.twap_min_slices = 20;
        preset.execution.twap_max_slices = 10;
        assert!(preset.validate().is_err());
    }
}

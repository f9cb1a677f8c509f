// =============================================================================
// Risk Manager — pre-trade gate and position sizing
// =============================================================================
//
// Every signal passes through `evaluate` before execution. Checks run in
// order: kill switch, concurrency cap, BTC-correlation clustering, stop
// sanity, then sizing against equity. Sizing is deterministic: identical
// inputs always produce the identical `PositionSize`.
//
// When several signals are sized in one phase, each evaluation receives the
// previously approved sizes as `pending` so the batch cannot over-commit
// equity.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::position::Position;
use crate::signals::Signal;

/// Exchange quantity step used for rounding sizes down.
const QTY_STEP: f64 = 1e-6;

/// Result of sizing one signal.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSize {
    pub quantity: f64,
    pub notional_usd: f64,
    pub risk_usd: f64,
    /// Fraction of equity committed to this trade.
    pub risk_r: f64,
    pub stop_distance: f64,
    pub is_valid: bool,
    pub reason: String,
}

/// Verdict of the risk gate for one signal.
#[derive(Debug, Clone, Serialize)]
pub struct RiskEvaluation {
    pub approved: bool,
    pub reason: String,
    pub position_size: Option<PositionSize>,
}

impl RiskEvaluation {
    fn rejected(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug!(reason = %reason, "signal rejected by risk gate");
        Self {
            approved: false,
            reason,
            position_size: None,
        }
    }
}

/// Latch that forbids new entries while set. Shared between the health
/// monitor (which trips and clears it) and the risk gate (which honours it).
pub struct KillSwitch {
    reason: RwLock<Option<String>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            reason: RwLock::new(None),
        }
    }

    pub fn activate(&self, reason: &str) {
        let mut guard = self.reason.write();
        if guard.is_none() {
            warn!(reason, "kill switch activated");
        }
        *guard = Some(reason.to_string());
    }

    pub fn clear(&self) {
        let mut guard = self.reason.write();
        if guard.is_some() {
            info!("kill switch cleared");
        }
        *guard = None;
    }

    pub fn is_active(&self) -> bool {
        self.reason.read().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-trade gate and sizer.
pub struct RiskManager {
    config: RiskConfig,
    kill_switch: Arc<KillSwitch>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, kill_switch: Arc<KillSwitch>) -> Self {
        info!(
            max_concurrent = config.max_concurrent_positions,
            per_trade_risk_r = config.per_trade_risk_r,
            correlation_limit = config.correlation_limit,
            "risk manager initialised"
        );
        Self {
            config,
            kill_switch,
        }
    }

    /// Evaluate one signal. `pending` holds sizes already approved earlier in
    /// the same sizing phase.
    pub fn evaluate(
        &self,
        signal: &Signal,
        equity: f64,
        open_positions: &[Position],
        pending: &[PositionSize],
    ) -> RiskEvaluation {
        // 1. Kill switch forbids every new entry.
        if self.kill_switch.is_active() {
            let reason = self
                .kill_switch
                .reason()
                .unwrap_or_else(|| "kill switch active".to_string());
            return RiskEvaluation::rejected(format!("kill switch active: {reason}"));
        }

        // 2. Concurrency cap counts open positions plus the batch so far.
        let committed = open_positions.iter().filter(|p| p.is_open()).count() + pending.len();
        if committed >= self.config.max_concurrent_positions {
            return RiskEvaluation::rejected(format!(
                "max concurrent positions reached ({committed}/{})",
                self.config.max_concurrent_positions
            ));
        }

        // 3. Correlation clustering against any other open position.
        if !open_positions.is_empty() {
            let correlation = signal
                .meta
                .market_data
                .as_ref()
                .map(|md| md.btc_correlation)
                .unwrap_or(0.0);
            if correlation.abs() > self.config.correlation_limit {
                return RiskEvaluation::rejected(format!(
                    "btc correlation {correlation:.2} exceeds limit {:.2}",
                    self.config.correlation_limit
                ));
            }
        }

        // 4. Stop sanity.
        let stop_distance = (signal.entry - signal.stop_loss).abs();
        if stop_distance <= 0.0 {
            return RiskEvaluation::rejected("zero stop distance");
        }

        if equity <= 0.0 {
            return RiskEvaluation::rejected(format!("non-positive equity {equity:.2}"));
        }

        // 5. Size from the per-trade risk budget.
        let risk_usd = equity * self.config.per_trade_risk_r;
        let quantity = round_down_to_step(risk_usd / stop_distance, QTY_STEP);
        if quantity <= 0.0 {
            return RiskEvaluation::rejected("computed quantity is zero");
        }

        // 6. The batch must not over-commit equity.
        let notional_usd = quantity * signal.entry;
        let already_committed: f64 = pending.iter().map(|p| p.notional_usd).sum();
        let remaining_equity = equity - already_committed;
        if notional_usd > remaining_equity {
            return RiskEvaluation::rejected(format!(
                "insufficient equity: notional {notional_usd:.2} > remaining {remaining_equity:.2}"
            ));
        }

        let size = PositionSize {
            quantity,
            notional_usd,
            risk_usd,
            risk_r: self.config.per_trade_risk_r,
            stop_distance,
            is_valid: true,
            reason: format!(
                "risk {risk_usd:.2} USD over stop distance {stop_distance:.4}"
            ),
        };

        info!(
            symbol = %signal.symbol,
            quantity = size.quantity,
            notional = size.notional_usd,
            risk_usd = size.risk_usd,
            "signal approved by risk gate"
        );

        RiskEvaluation {
            approved: true,
            reason: "approved".to_string(),
            position_size: Some(size),
        }
    }

    pub fn kill_switch(&self) -> Arc<KillSwitch> {
        self.kill_switch.clone()
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("max_concurrent", &self.config.max_concurrent_positions)
            .field("kill_switch_active", &self.kill_switch.is_active())
            .finish()
    }
}

fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::testing::market_data;
    use crate::signals::{SignalMeta, SignalStatus};
    use crate::types::{now_ms, Side, StrategyKind};

    fn signal(entry: f64, stop_loss: f64) -> Signal {
        Signal {
            id: "sig".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            strategy: StrategyKind::Momentum,
            entry,
            stop_loss,
            take_profits: vec![entry + 1_000.0, entry + 2_000.0],
            confidence: 0.9,
            reason: "test".to_string(),
            created_ts: now_ms(),
            executed_ts: None,
            status: SignalStatus::Active,
            correlation_id: "corr".to_string(),
            meta: SignalMeta {
                market_data: Some(market_data("BTCUSDT", entry, 100.0, 40)),
                ..Default::default()
            },
        }
    }

    fn open_position() -> Position {
        Position::open(
            "ETHUSDT",
            Side::Long,
            StrategyKind::Momentum,
            1.0,
            3_000.0,
            2_900.0,
            None,
            0.0,
            None,
        )
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default(), Arc::new(KillSwitch::new()))
    }

    #[test]
    fn sizing_formula_matches_budget() {
        // equity 100 000, risk 1% = 1 000 USD over a 1 000 stop distance.
        let eval = manager().evaluate(&signal(50_000.0, 49_000.0), 100_000.0, &[], &[]);
        assert!(eval.approved, "{}", eval.reason);

        let size = eval.position_size.unwrap();
        assert!((size.quantity - 1.0).abs() < 1e-9);
        assert!((size.risk_usd - 1_000.0).abs() < 1e-9);
        assert!((size.stop_distance - 1_000.0).abs() < 1e-9);
        assert!((size.quantity * size.stop_distance - size.risk_usd).abs() < 1e-6);
        assert!((size.notional_usd - 50_000.0).abs() < 1e-9);
    }

    #[test]
    fn sizing_is_deterministic() {
        let manager = manager();
        let sig = signal(50_000.0, 49_000.0);
        let a = manager.evaluate(&sig, 100_000.0, &[], &[]).position_size.unwrap();
        let b = manager.evaluate(&sig, 100_000.0, &[], &[]).position_size.unwrap();
        assert_eq!(a.quantity, b.quantity);
        assert_eq!(a.notional_usd, b.notional_usd);
        assert_eq!(a.risk_usd, b.risk_usd);
    }

    #[test]
    fn kill_switch_rejects_everything() {
        let kill = Arc::new(KillSwitch::new());
        let manager = RiskManager::new(RiskConfig::default(), kill.clone());
        kill.activate("daily loss limit");

        let eval = manager.evaluate(&signal(50_000.0, 49_000.0), 100_000.0, &[], &[]);
        assert!(!eval.approved);
        assert!(eval.reason.contains("kill switch"));

        kill.clear();
        let eval = manager.evaluate(&signal(50_000.0, 49_000.0), 100_000.0, &[], &[]);
        assert!(eval.approved);
    }

    #[test]
    fn concurrency_cap_counts_open_and_pending() {
        let manager = manager();
        let open = vec![open_position(), open_position()];
        let pending = vec![PositionSize {
            quantity: 1.0,
            notional_usd: 10_000.0,
            risk_usd: 1_000.0,
            risk_r: 0.01,
            stop_distance: 1_000.0,
            is_valid: true,
            reason: "pending".to_string(),
        }];

        // 2 open + 1 pending = cap of 3.
        let eval = manager.evaluate(&signal(50_000.0, 49_000.0), 100_000.0, &open, &pending);
        assert!(!eval.approved);
        assert!(eval.reason.contains("max concurrent"));
    }

    #[test]
    fn correlation_limit_applies_with_open_positions() {
        let manager = manager();
        let mut sig = signal(50_000.0, 49_000.0);
        sig.meta.market_data.as_mut().unwrap().btc_correlation = 0.9;

        // No open positions: correlation is irrelevant.
        assert!(manager.evaluate(&sig, 100_000.0, &[], &[]).approved);

        // With an open position: rejected.
        let open = vec![open_position()];
        let eval = manager.evaluate(&sig, 100_000.0, &open, &[]);
        assert!(!eval.approved);
        assert!(eval.reason.contains("correlation"));
    }

    #[test]
    fn zero_stop_distance_rejected() {
        let eval = manager().evaluate(&signal(50_000.0, 50_000.0), 100_000.0, &[], &[]);
        assert!(!eval.approved);
        assert!(eval.reason.contains("stop distance"));
    }

    #[test]
    fn non_positive_equity_rejected() {
        let eval = manager().evaluate(&signal(50_000.0, 49_000.0), 0.0, &[], &[]);
        assert!(!eval.approved);
    }

    #[test]
    fn batch_cannot_overcommit_equity() {
        let manager = manager();
        // Tight stop forces a large notional: equity 10 000, risk 100 USD,
        // stop distance 10 -> qty 10 -> notional 500 000 > equity.
        let eval = manager.evaluate(&signal(50_000.0, 49_990.0), 10_000.0, &[], &[]);
        assert!(!eval.approved);
        assert!(eval.reason.contains("insufficient equity"));
    }

    #[test]
    fn sequential_sizing_sees_prior_notional() {
        let manager = manager();
        // Wide stop keeps the notional small: equity 100 000, stop 25 000
        // -> qty 0.04 -> notional 2 000.
        let sig = signal(50_000.0, 25_000.0);
        let first = manager.evaluate(&sig, 100_000.0, &[], &[]);
        assert!(first.approved);
        let first_size = first.position_size.unwrap();

        // With 99 000 already committed, the second one does not fit.
        let mut committed = first_size.clone();
        committed.notional_usd = 99_000.0;
        let second = manager.evaluate(&sig, 100_000.0, &[], &[committed]);
        assert!(!second.approved);
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        let rounded = round_down_to_step(1.23456789, QTY_STEP);
        assert!((rounded - 1.234567).abs() < 1e-12);
        assert!(rounded <= 1.23456789);
    }
}

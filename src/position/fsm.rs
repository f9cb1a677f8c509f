// =============================================================================
// Position State Machine — per-position lifecycle and stop proposals
// =============================================================================
//
// One instance per open position:
//
//   entry_confirmation -> running -> { breakeven, trailing, partial_closed }
//                                                         -> closed
//
// The machine only *proposes* stop-loss moves; the orchestrator applies them
// and performs the actual closes. Stop proposals ratchet: a proposal is only
// actionable when strictly better than the current stop (higher for longs,
// lower for shorts). The machine never closes on a stop violation itself —
// that observation belongs to the orchestrator.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};

use crate::config::FsmConfig;
use crate::types::now_ms;

/// Lifecycle phase of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionPhase {
    EntryConfirmation,
    Running,
    Breakeven,
    Trailing,
    PartialClosed,
    Closed,
}

impl std::fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EntryConfirmation => "entry_confirmation",
            Self::Running => "running",
            Self::Breakeven => "breakeven",
            Self::Trailing => "trailing",
            Self::PartialClosed => "partial_closed",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time view of the position the machine evaluates against.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub current_price: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub is_long: bool,
    pub bars_since_entry: u32,
    pub highest_price: f64,
    pub lowest_price: f64,
    /// Indices of take-profit rungs already realised.
    pub tp_levels_hit: Vec<usize>,
    /// Percentage of the initial size still open (0-100).
    pub remaining_size_pct: f64,
    pub unrealized_pnl_r: f64,
    pub max_unrealized_pnl_r: f64,
}

impl PositionSnapshot {
    /// Profit in units of initial risk. Zero when the risk is degenerate.
    pub fn current_r(&self) -> f64 {
        let risk = (self.entry_price - self.stop_loss).abs();
        if risk <= 0.0 {
            return 0.0;
        }
        let pnl = if self.is_long {
            self.current_price - self.entry_price
        } else {
            self.entry_price - self.current_price
        };
        pnl / risk
    }
}

/// One recorded phase change.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseChange {
    pub from: PositionPhase,
    pub to: PositionPhase,
    pub reason: String,
    pub ts_ms: i64,
}

/// Config-driven lifecycle machine for one position.
#[derive(Debug)]
pub struct PositionStateMachine {
    config: FsmConfig,
    phase: PositionPhase,
    history: Vec<PhaseChange>,
    /// Initial risk captured at entry; the R reference never moves with the
    /// stop.
    initial_risk: f64,
}

impl PositionStateMachine {
    pub fn new(config: FsmConfig, entry_price: f64, initial_stop: f64) -> Self {
        Self {
            config,
            phase: PositionPhase::EntryConfirmation,
            history: Vec::new(),
            initial_risk: (entry_price - initial_stop).abs(),
        }
    }

    pub fn phase(&self) -> PositionPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == PositionPhase::Closed
    }

    pub fn history(&self) -> &[PhaseChange] {
        &self.history
    }

    /// Evaluate the snapshot and perform at most one phase change.
    ///
    /// Also refreshes `snapshot.unrealized_pnl_r` / `max_unrealized_pnl_r`
    /// in place.
    pub fn update(&mut self, snapshot: &mut PositionSnapshot) -> Option<PhaseChange> {
        let current_r = self.current_r_from_initial(snapshot);
        snapshot.unrealized_pnl_r = current_r;
        if current_r > snapshot.max_unrealized_pnl_r {
            snapshot.max_unrealized_pnl_r = current_r;
        }

        let change = match self.phase {
            PositionPhase::EntryConfirmation => self.check_entry_confirmation(snapshot),
            PositionPhase::Running => self
                .check_breakeven(current_r)
                .or_else(|| self.check_trailing(current_r))
                .or_else(|| self.check_partial_close(snapshot)),
            PositionPhase::Breakeven => self
                .check_trailing(current_r)
                .or_else(|| self.check_partial_close(snapshot)),
            PositionPhase::Trailing => self.check_partial_close(snapshot),
            PositionPhase::PartialClosed | PositionPhase::Closed => None,
        };

        if let Some(change) = change {
            self.record(change.clone());
            info!(
                from = %change.from,
                to = %change.to,
                reason = %change.reason,
                "position phase change"
            );
            return Some(change);
        }
        None
    }

    /// External close (stop violation, ladder exhausted, manual).
    pub fn close_position(&mut self, reason: &str) -> PhaseChange {
        let change = PhaseChange {
            from: self.phase,
            to: PositionPhase::Closed,
            reason: reason.to_string(),
            ts_ms: now_ms(),
        };
        self.record(change.clone());
        info!(reason, "position closed");
        change
    }

    // -------------------------------------------------------------------------
    // Transition checks
    // -------------------------------------------------------------------------

    fn check_entry_confirmation(&self, snapshot: &PositionSnapshot) -> Option<PhaseChange> {
        if snapshot.bars_since_entry >= self.config.entry_confirmation_bars {
            return Some(self.change(
                PositionPhase::Running,
                format!("entry confirmed after {} bars", snapshot.bars_since_entry),
            ));
        }
        None
    }

    fn check_breakeven(&self, current_r: f64) -> Option<PhaseChange> {
        if !self.config.breakeven_lock_profit_enabled {
            return None;
        }
        if current_r >= self.config.running_breakeven_trigger_r {
            return Some(self.change(
                PositionPhase::Breakeven,
                format!(
                    "breakeven trigger at {current_r:.2}R (threshold {:.2}R)",
                    self.config.running_breakeven_trigger_r
                ),
            ));
        }
        None
    }

    fn check_trailing(&self, current_r: f64) -> Option<PhaseChange> {
        if self.config.trailing_activation_r <= 0.0 {
            return None;
        }
        if current_r >= self.config.trailing_activation_r {
            return Some(self.change(
                PositionPhase::Trailing,
                format!(
                    "trailing activated at {current_r:.2}R (threshold {:.2}R)",
                    self.config.trailing_activation_r
                ),
            ));
        }
        None
    }

    fn check_partial_close(&self, snapshot: &PositionSnapshot) -> Option<PhaseChange> {
        if !self.config.partial_closed_trail_enabled {
            return None;
        }
        if !snapshot.tp_levels_hit.is_empty() && snapshot.remaining_size_pct < 100.0 {
            return Some(self.change(
                PositionPhase::PartialClosed,
                format!(
                    "{} take-profit rungs hit, {:.1}% remaining",
                    snapshot.tp_levels_hit.len(),
                    snapshot.remaining_size_pct
                ),
            ));
        }
        None
    }

    // -------------------------------------------------------------------------
    // Stop-loss proposals
    // -------------------------------------------------------------------------

    /// Propose a new stop for the current phase, or `None` when the phase
    /// does not manage the stop.
    pub fn calculate_new_stop_loss(&self, snapshot: &PositionSnapshot) -> Option<f64> {
        match self.phase {
            PositionPhase::Breakeven => {
                let buffer = snapshot.entry_price * self.config.breakeven_buffer_bps / 10_000.0;
                Some(if snapshot.is_long {
                    snapshot.entry_price + buffer
                } else {
                    snapshot.entry_price - buffer
                })
            }
            PositionPhase::Trailing => {
                let step = snapshot.current_price * self.config.trailing_step_bps / 10_000.0;
                Some(if snapshot.is_long {
                    snapshot.current_price - step
                } else {
                    snapshot.current_price + step
                })
            }
            PositionPhase::PartialClosed => {
                let step_bps = self.config.partial_closed_trail_step_bps?;
                let step = snapshot.current_price * step_bps / 10_000.0;
                Some(if snapshot.is_long {
                    snapshot.current_price - step
                } else {
                    snapshot.current_price + step
                })
            }
            _ => None,
        }
    }

    /// The ratchet: a proposal is actionable only when strictly better than
    /// the current stop.
    pub fn should_update_stop_loss(&self, snapshot: &PositionSnapshot, current_stop: f64) -> Option<f64> {
        let proposal = self.calculate_new_stop_loss(snapshot)?;
        let better = if snapshot.is_long {
            proposal > current_stop
        } else {
            proposal < current_stop
        };
        if better {
            debug!(proposal, current_stop, "stop-loss proposal accepted");
            Some(proposal)
        } else {
            None
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// R against the *initial* risk so that moving the stop to breakeven does
    /// not inflate later R readings.
    fn current_r_from_initial(&self, snapshot: &PositionSnapshot) -> f64 {
        if self.initial_risk <= 0.0 {
            return snapshot.current_r();
        }
        let pnl = if snapshot.is_long {
            snapshot.current_price - snapshot.entry_price
        } else {
            snapshot.entry_price - snapshot.current_price
        };
        pnl / self.initial_risk
    }

    fn change(&self, to: PositionPhase, reason: String) -> PhaseChange {
        PhaseChange {
            from: self.phase,
            to,
            reason,
            ts_ms: now_ms(),
        }
    }

    fn record(&mut self, change: PhaseChange) {
        self.phase = change.to;
        self.history.push(change);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FsmConfig {
        FsmConfig {
            entry_confirmation_bars: 2,
            breakeven_lock_profit_enabled: true,
            running_breakeven_trigger_r: 1.5,
            breakeven_buffer_bps: 5.0,
            trailing_activation_r: 2.0,
            trailing_step_bps: 50.0,
            partial_closed_trail_enabled: true,
            partial_closed_trail_step_bps: Some(30.0),
        }
    }

    /// Long from 50 000 with the initial stop at 49 000 (risk 1 000).
    fn snapshot(price: f64, bars: u32) -> PositionSnapshot {
        PositionSnapshot {
            current_price: price,
            entry_price: 50_000.0,
            stop_loss: 49_000.0,
            is_long: true,
            bars_since_entry: bars,
            highest_price: price.max(50_000.0),
            lowest_price: price.min(50_000.0),
            tp_levels_hit: Vec::new(),
            remaining_size_pct: 100.0,
            unrealized_pnl_r: 0.0,
            max_unrealized_pnl_r: 0.0,
        }
    }

    fn machine() -> PositionStateMachine {
        PositionStateMachine::new(config(), 50_000.0, 49_000.0)
    }

    #[test]
    fn entry_confirmation_waits_for_bars() {
        let mut psm = machine();
        let mut snap = snapshot(50_100.0, 1);
        assert!(psm.update(&mut snap).is_none());
        assert_eq!(psm.phase(), PositionPhase::EntryConfirmation);

        let mut snap = snapshot(50_100.0, 2);
        let change = psm.update(&mut snap).unwrap();
        assert_eq!(change.to, PositionPhase::Running);
    }

    #[test]
    fn breakeven_then_trailing_progression() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();

        // 1.5R = 51 500.
        let change = psm.update(&mut snapshot(51_500.0, 5)).unwrap();
        assert_eq!(change.to, PositionPhase::Breakeven);

        // 2.0R = 52 000.
        let change = psm.update(&mut snapshot(52_000.0, 8)).unwrap();
        assert_eq!(change.to, PositionPhase::Trailing);
    }

    #[test]
    fn running_jumps_straight_to_trailing_past_both_triggers() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();

        // Breakeven is checked first even when trailing is also reached.
        let change = psm.update(&mut snapshot(52_500.0, 3)).unwrap();
        assert_eq!(change.to, PositionPhase::Breakeven);
        let change = psm.update(&mut snapshot(52_500.0, 4)).unwrap();
        assert_eq!(change.to, PositionPhase::Trailing);
    }

    #[test]
    fn partial_close_transition() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();

        let mut snap = snapshot(51_000.0, 6);
        snap.tp_levels_hit = vec![0];
        snap.remaining_size_pct = 50.0;
        let change = psm.update(&mut snap).unwrap();
        assert_eq!(change.to, PositionPhase::PartialClosed);
    }

    #[test]
    fn breakeven_stop_proposal_adds_buffer() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();
        psm.update(&mut snapshot(51_500.0, 5)).unwrap();
        assert_eq!(psm.phase(), PositionPhase::Breakeven);

        let proposal = psm.calculate_new_stop_loss(&snapshot(51_500.0, 5)).unwrap();
        // entry + 5 bps = 50 025.
        assert!((proposal - 50_025.0).abs() < 1e-9, "got {proposal}");
    }

    #[test]
    fn trailing_stop_follows_price() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();
        psm.update(&mut snapshot(52_000.0, 5)).unwrap();
        psm.update(&mut snapshot(52_000.0, 6));
        assert_eq!(psm.phase(), PositionPhase::Trailing);

        let proposal = psm.calculate_new_stop_loss(&snapshot(52_000.0, 6)).unwrap();
        // 52 000 - 50 bps of 52 000 = 51 740.
        assert!((proposal - 51_740.0).abs() < 1e-9, "got {proposal}");
    }

    #[test]
    fn stop_ratchet_never_loosens_long() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();
        psm.update(&mut snapshot(52_000.0, 5)).unwrap();
        psm.update(&mut snapshot(52_000.0, 6));
        assert_eq!(psm.phase(), PositionPhase::Trailing);

        // Stop already above the trailing proposal: no update.
        let snap = snapshot(52_000.0, 7);
        assert!(psm.should_update_stop_loss(&snap, 51_900.0).is_none());
        // Stop below the proposal: update allowed.
        let updated = psm.should_update_stop_loss(&snap, 51_000.0).unwrap();
        assert!(updated > 51_000.0);
    }

    #[test]
    fn stop_ratchet_mirrors_for_short() {
        let cfg = config();
        let mut psm = PositionStateMachine::new(cfg, 50_000.0, 51_000.0);
        let mut snap = PositionSnapshot {
            current_price: 48_000.0,
            entry_price: 50_000.0,
            stop_loss: 51_000.0,
            is_long: false,
            bars_since_entry: 3,
            highest_price: 50_000.0,
            lowest_price: 48_000.0,
            tp_levels_hit: Vec::new(),
            remaining_size_pct: 100.0,
            unrealized_pnl_r: 0.0,
            max_unrealized_pnl_r: 0.0,
        };
        psm.update(&mut snap); // -> running
        psm.update(&mut snap); // -> breakeven (2R)
        psm.update(&mut snap); // -> trailing

        assert_eq!(psm.phase(), PositionPhase::Trailing);
        // Proposal = 48 000 + 50 bps = 48 240; better (lower) than 49 000.
        let updated = psm.should_update_stop_loss(&snap, 49_000.0).unwrap();
        assert!((updated - 48_240.0).abs() < 1e-9);
        // Not better than an already-tighter stop.
        assert!(psm.should_update_stop_loss(&snap, 48_100.0).is_none());
    }

    #[test]
    fn r_reference_stays_on_initial_risk() {
        let mut psm = machine();
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();
        psm.update(&mut snapshot(51_500.0, 5)).unwrap();
        assert_eq!(psm.phase(), PositionPhase::Breakeven);

        // Stop moved to breakeven; R must still measure against the initial
        // 1 000 risk: 52 000 -> 2R -> trailing trigger.
        let mut snap = snapshot(52_000.0, 6);
        snap.stop_loss = 50_025.0;
        let change = psm.update(&mut snap).unwrap();
        assert_eq!(change.to, PositionPhase::Trailing);
        assert!((snap.unrealized_pnl_r - 2.0).abs() < 1e-9);
    }

    #[test]
    fn external_close_from_any_phase() {
        let mut psm = machine();
        let change = psm.close_position("stop violated");
        assert_eq!(change.to, PositionPhase::Closed);
        assert!(psm.is_closed());
        // Further updates are inert.
        assert!(psm.update(&mut snapshot(55_000.0, 10)).is_none());
    }

    #[test]
    fn disabled_features_do_not_transition() {
        let cfg = FsmConfig {
            breakeven_lock_profit_enabled: false,
            trailing_activation_r: 0.0,
            partial_closed_trail_enabled: false,
            ..config()
        };
        let mut psm = PositionStateMachine::new(cfg, 50_000.0, 49_000.0);
        psm.update(&mut snapshot(50_100.0, 2)).unwrap();

        let mut snap = snapshot(55_000.0, 10);
        snap.tp_levels_hit = vec![0];
        snap.remaining_size_pct = 40.0;
        assert!(psm.update(&mut snap).is_none());
        assert_eq!(psm.phase(), PositionPhase::Running);
    }

    #[test]
    fn max_r_high_water_mark() {
        let mut psm = machine();
        let mut snap = snapshot(52_000.0, 2);
        psm.update(&mut snap);
        assert!((snap.max_unrealized_pnl_r - 2.0).abs() < 1e-9);

        let mut pullback = snapshot(51_000.0, 3);
        pullback.max_unrealized_pnl_r = snap.max_unrealized_pnl_r;
        psm.update(&mut pullback);
        assert!((pullback.unrealized_pnl_r - 1.0).abs() < 1e-9);
        assert!((pullback.max_unrealized_pnl_r - 2.0).abs() < 1e-9);
    }
}

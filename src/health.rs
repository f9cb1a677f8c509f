// =============================================================================
// Health Monitor — daily P&L gates, kill switch, connectivity
// =============================================================================
//
// Evaluated once per engine cycle before the phase handler runs:
//
//   1. Daily loss beyond `daily_risk_limit`          -> pause
//   2. Daily loss beyond `kill_switch_loss_limit`    -> pause + kill switch
//   3. Consecutive losses >= `max_consecutive_losses`-> pause
//   4. Repeated balance-fetch failures               -> error phase
//
// The kill switch clears automatically once its trigger condition no longer
// holds; while it is set the risk gate rejects every new entry.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::monitoring::{EngineEvent, NotificationSink};
use crate::risk::KillSwitch;
use crate::types::now_ms;

/// Balance-fetch failures in a row before connectivity counts as lost.
const CONNECTIVITY_FAILURE_LIMIT: u32 = 3;

/// What the orchestrator should do with the engine this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAction {
    Continue,
    Pause,
    Error,
}

/// One cycle's health verdict.
#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub action: HealthAction,
    pub reason: Option<String>,
    pub kill_switch_active: bool,
}

/// Serialisable health state for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub daily_pnl_usd: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub connectivity_failures: u32,
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
}

struct HealthInner {
    last_daily_pnl: f64,
    last_consecutive_losses: u32,
    connectivity_failures: u32,
}

/// Cycle-level health evaluation.
pub struct HealthMonitor {
    config: RiskConfig,
    /// Equity base that loss limits are measured against.
    equity_base: f64,
    kill_switch: Arc<KillSwitch>,
    sink: Arc<dyn NotificationSink>,
    inner: RwLock<HealthInner>,
}

impl HealthMonitor {
    pub fn new(
        config: RiskConfig,
        equity_base: f64,
        kill_switch: Arc<KillSwitch>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            equity_base,
            kill_switch,
            sink,
            inner: RwLock::new(HealthInner {
                last_daily_pnl: 0.0,
                last_consecutive_losses: 0,
                connectivity_failures: 0,
            }),
        }
    }

    /// Record the outcome of this cycle's balance fetch.
    pub fn record_connectivity(&self, ok: bool) {
        let mut inner = self.inner.write();
        if ok {
            inner.connectivity_failures = 0;
        } else {
            inner.connectivity_failures += 1;
            warn!(
                failures = inner.connectivity_failures,
                "balance fetch failed"
            );
        }
    }

    /// Evaluate all gates for this cycle.
    pub fn check(&self, daily_pnl: f64, consecutive_losses: u32) -> HealthVerdict {
        {
            let mut inner = self.inner.write();
            inner.last_daily_pnl = daily_pnl;
            inner.last_consecutive_losses = consecutive_losses;
        }

        let daily_limit = self.equity_base * self.config.daily_risk_limit;
        let kill_limit = self.equity_base * self.config.kill_switch_loss_limit;

        // Kill-switch loss: the harder limit, latches the switch.
        if daily_pnl <= -kill_limit {
            let reason = format!(
                "daily loss {:.2} beyond kill-switch limit {:.2}",
                daily_pnl, -kill_limit
            );
            if !self.kill_switch.is_active() {
                self.kill_switch.activate(&reason);
                self.sink.notify(EngineEvent::KillSwitch {
                    reason: reason.clone(),
                    ts_ms: now_ms(),
                });
            }
            return HealthVerdict {
                action: HealthAction::Pause,
                reason: Some(reason),
                kill_switch_active: true,
            };
        }

        // The trigger condition no longer holds: the latch clears itself.
        if self.kill_switch.is_active() {
            info!("kill-switch trigger cleared, releasing latch");
            self.kill_switch.clear();
        }

        // Daily loss trigger.
        if daily_pnl <= -daily_limit {
            let reason = format!(
                "daily loss {:.2} beyond daily limit {:.2}",
                daily_pnl, -daily_limit
            );
            self.sink.notify(EngineEvent::KillSwitch {
                reason: reason.clone(),
                ts_ms: now_ms(),
            });
            return HealthVerdict {
                action: HealthAction::Pause,
                reason: Some(reason),
                kill_switch_active: false,
            };
        }

        // Consecutive losses.
        if consecutive_losses >= self.config.max_consecutive_losses {
            let reason = format!(
                "{consecutive_losses} consecutive losses (limit {})",
                self.config.max_consecutive_losses
            );
            return HealthVerdict {
                action: HealthAction::Pause,
                reason: Some(reason),
                kill_switch_active: false,
            };
        }

        // Connectivity.
        let failures = self.inner.read().connectivity_failures;
        if failures >= CONNECTIVITY_FAILURE_LIMIT {
            return HealthVerdict {
                action: HealthAction::Error,
                reason: Some(format!("connectivity lost ({failures} balance failures)")),
                kill_switch_active: false,
            };
        }

        HealthVerdict {
            action: HealthAction::Continue,
            reason: None,
            kill_switch_active: false,
        }
    }

    pub fn status(&self) -> HealthStatus {
        let inner = self.inner.read();
        HealthStatus {
            daily_pnl_usd: inner.last_daily_pnl,
            daily_pnl_pct: if self.equity_base > 0.0 {
                inner.last_daily_pnl / self.equity_base * 100.0
            } else {
                0.0
            },
            consecutive_losses: inner.last_consecutive_losses,
            connectivity_failures: inner.connectivity_failures,
            kill_switch_active: self.kill_switch.is_active(),
            kill_switch_reason: self.kill_switch.reason(),
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("equity_base", &self.equity_base)
            .field("kill_switch_active", &self.kill_switch.is_active())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::EventLog;

    fn monitor() -> (HealthMonitor, Arc<KillSwitch>, Arc<EventLog>) {
        let kill = Arc::new(KillSwitch::new());
        let log = Arc::new(EventLog::new(50));
        // equity base 10 000: daily limit 500, kill limit 1 000.
        let monitor = HealthMonitor::new(RiskConfig::default(), 10_000.0, kill.clone(), log.clone());
        (monitor, kill, log)
    }

    #[test]
    fn healthy_cycle_continues() {
        let (monitor, kill, _) = monitor();
        let verdict = monitor.check(100.0, 0);
        assert_eq!(verdict.action, HealthAction::Continue);
        assert!(!kill.is_active());
    }

    #[test]
    fn daily_loss_pauses_without_latch() {
        let (monitor, kill, log) = monitor();
        // -6% of 10 000 base = -600, beyond the 5% daily limit.
        let verdict = monitor.check(-600.0, 0);
        assert_eq!(verdict.action, HealthAction::Pause);
        assert!(!verdict.kill_switch_active);
        assert!(!kill.is_active());
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn kill_switch_latches_and_auto_clears() {
        let (monitor, kill, log) = monitor();

        let verdict = monitor.check(-1_200.0, 0);
        assert_eq!(verdict.action, HealthAction::Pause);
        assert!(verdict.kill_switch_active);
        assert!(kill.is_active());
        assert_eq!(log.events().len(), 1);

        // Loss recovers above the kill limit: the latch releases.
        let verdict = monitor.check(-100.0, 0);
        assert_eq!(verdict.action, HealthAction::Continue);
        assert!(!kill.is_active());
    }

    #[test]
    fn kill_switch_event_emitted_once_per_trip() {
        let (monitor, _, log) = monitor();
        monitor.check(-1_200.0, 0);
        monitor.check(-1_300.0, 0);
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn consecutive_losses_pause() {
        let (monitor, _, _) = monitor();
        let verdict = monitor.check(0.0, 5);
        assert_eq!(verdict.action, HealthAction::Pause);
        assert!(verdict.reason.unwrap().contains("consecutive"));
    }

    #[test]
    fn connectivity_failures_escalate_to_error() {
        let (monitor, _, _) = monitor();
        monitor.record_connectivity(false);
        monitor.record_connectivity(false);
        assert_eq!(monitor.check(0.0, 0).action, HealthAction::Continue);

        monitor.record_connectivity(false);
        assert_eq!(monitor.check(0.0, 0).action, HealthAction::Error);

        // A successful fetch resets the streak.
        monitor.record_connectivity(true);
        assert_eq!(monitor.check(0.0, 0).action, HealthAction::Continue);
    }
}

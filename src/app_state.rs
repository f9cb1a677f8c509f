// =============================================================================
// Engine Context — shared state behind the status API
// =============================================================================
//
// Ties the engine components together for the dashboard surface. Everything
// here is read-mostly: the API reads snapshots, and the only mutations it may
// trigger are the pause/resume/stop/kill commands routed through the state
// machine and kill switch.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;

use crate::error_handler::{ErrorHandler, ErrorRecord, ErrorStatistics};
use crate::health::{HealthMonitor, HealthStatus};
use crate::monitoring::{CheckpointLog, EngineEvent, EventLog};
use crate::position::{Position, PositionBook};
use crate::resource_monitor::{ResourceMonitor, ResourceSample};
use crate::risk::KillSwitch;
use crate::scanner::ScannerSnapshot;
use crate::scanning::ScanningManager;
use crate::signals::{SignalManager, SignalMetrics};
use crate::state_machine::{StateMachine, StateMachineStatus};
use crate::types::TradingMode;

/// Shared handle the API serves from.
pub struct EngineContext {
    pub trading_mode: TradingMode,
    pub state_machine: Arc<StateMachine>,
    pub error_handler: Arc<ErrorHandler>,
    pub scanning: Arc<ScanningManager>,
    pub signals: Arc<SignalManager>,
    pub positions: Arc<PositionBook>,
    pub health: Arc<HealthMonitor>,
    pub resources: Arc<ResourceMonitor>,
    pub kill_switch: Arc<KillSwitch>,
    pub events: Arc<EventLog>,
    pub checkpoints: Arc<CheckpointLog>,
    pub stop: Arc<Notify>,
    pub start_time: std::time::Instant,
}

/// Full engine snapshot served by `GET /api/v1/state`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub trading_mode: TradingMode,
    pub uptime_secs: u64,
    pub state_machine: StateMachineStatus,
    pub open_positions: Vec<Position>,
    pub closed_positions: Vec<Position>,
    pub health: HealthStatus,
    pub scanner: ScannerSnapshot,
    pub signal_metrics: SignalMetrics,
    pub errors: ErrorStatistics,
    pub resources: ResourceSample,
}

impl EngineContext {
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            trading_mode: self.trading_mode,
            uptime_secs: self.start_time.elapsed().as_secs(),
            state_machine: self.state_machine.status(),
            open_positions: self.positions.open_positions(),
            closed_positions: self.positions.closed_positions(50),
            health: self.health.status(),
            scanner: self.scanning.diagnostics(),
            signal_metrics: self.signals.metrics(),
            errors: self.error_handler.statistics(),
            resources: self.resources.latest(),
        }
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.error_handler.recent_errors(limit)
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EngineEvent> {
        self.events.recent(limit)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("trading_mode", &self.trading_mode)
            .field("phase", &self.state_machine.current())
            .field("open_positions", &self.positions.open_count())
            .finish()
    }
}

// =============================================================================
// Monitoring — typed engine events and trading-cycle checkpoints
// =============================================================================
//
// Two observer seams:
//
//   * `NotificationSink` — discrete engine events (phase transitions, errors,
//     kill switch, stop moves, take profits).
//   * `MonitoringSink`   — coarse trading-cycle checkpoints on every phase
//     edge, carrying optional metrics for the dashboard.
//
// Both ship with in-memory ring-buffer implementations used by the status API
// and by tests. The engine core never persists anything itself.
// =============================================================================

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::types::now_ms;

// =============================================================================
// Engine events
// =============================================================================

/// A typed event emitted by the engine core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    FsmTransition {
        from: String,
        to: String,
        reason: String,
        ts_ms: i64,
    },
    Error {
        component: String,
        operation: String,
        error_kind: String,
        message: String,
        severity: String,
        category: String,
        ts_ms: i64,
        retry_count: u32,
    },
    KillSwitch {
        reason: String,
        ts_ms: i64,
    },
    StopMoved {
        position_id: String,
        old_stop: f64,
        new_stop: f64,
        ts_ms: i64,
    },
    TakeProfit {
        position_id: String,
        price: f64,
        pnl: f64,
        ts_ms: i64,
    },
}

/// Observer seam for engine events. Implementations must be cheap and
/// non-blocking; anything slow belongs behind a channel.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: EngineEvent);
}

/// In-memory ring buffer of recent events.
pub struct EventLog {
    events: RwLock<Vec<EngineEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<EngineEvent> {
        let events = self.events.read();
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }
}

impl NotificationSink for EventLog {
    fn notify(&self, event: EngineEvent) {
        let mut events = self.events.write();
        events.push(event);
        while events.len() > self.capacity {
            events.remove(0);
        }
    }
}

/// Sink that drops everything. Used where notifications are irrelevant.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: EngineEvent) {}
}

// =============================================================================
// Trading-cycle checkpoints
// =============================================================================

/// Where in the trading cycle a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    ScanStart,
    ScanComplete,
    LevelBuildingStart,
    LevelBuildingComplete,
    SignalDetected,
    PositionSizing,
    OrderPlaced,
    OrderFilled,
    PositionOpened,
    PositionManaged,
    PositionClosed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

/// One checkpoint record.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub kind: CheckpointType,
    pub status: CheckpointStatus,
    pub message: String,
    pub session_id: String,
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
}

/// Observer seam for trading-cycle checkpoints.
pub trait MonitoringSink: Send + Sync {
    fn checkpoint(&self, checkpoint: Checkpoint);
}

/// In-memory recorder for checkpoints.
pub struct CheckpointLog {
    checkpoints: RwLock<Vec<Checkpoint>>,
    capacity: usize,
}

impl CheckpointLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            checkpoints: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Convenience constructor for a checkpoint without metrics.
    pub fn record(
        sink: &dyn MonitoringSink,
        kind: CheckpointType,
        status: CheckpointStatus,
        message: impl Into<String>,
        session_id: &str,
    ) {
        sink.checkpoint(Checkpoint {
            kind,
            status,
            message: message.into(),
            session_id: session_id.to_string(),
            ts_ms: now_ms(),
            metrics: None,
        });
    }

    pub fn recent(&self, limit: usize) -> Vec<Checkpoint> {
        let cps = self.checkpoints.read();
        let start = cps.len().saturating_sub(limit);
        cps[start..].to_vec()
    }

    pub fn count_of(&self, kind: CheckpointType) -> usize {
        self.checkpoints.read().iter().filter(|c| c.kind == kind).count()
    }
}

impl MonitoringSink for CheckpointLog {
    fn checkpoint(&self, checkpoint: Checkpoint) {
        debug!(
            kind = ?checkpoint.kind,
            status = ?checkpoint.status,
            message = %checkpoint.message,
            "checkpoint"
        );
        let mut cps = self.checkpoints.write();
        cps.push(checkpoint);
        while cps.len() > self.capacity {
            cps.remove(0);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_is_bounded() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.notify(EngineEvent::KillSwitch {
                reason: format!("r{i}"),
                ts_ms: i,
            });
        }
        let events = log.events();
        assert_eq!(events.len(), 3);
        match &events[0] {
            EngineEvent::KillSwitch { reason, .. } => assert_eq!(reason, "r2"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn checkpoint_log_counts_by_kind() {
        let log = CheckpointLog::new(10);
        CheckpointLog::record(
            &log,
            CheckpointType::ScanStart,
            CheckpointStatus::InProgress,
            "scan",
            "session",
        );
        CheckpointLog::record(
            &log,
            CheckpointType::ScanComplete,
            CheckpointStatus::Completed,
            "scan done",
            "session",
        );
        CheckpointLog::record(
            &log,
            CheckpointType::ScanStart,
            CheckpointStatus::InProgress,
            "scan 2",
            "session",
        );
        assert_eq!(log.count_of(CheckpointType::ScanStart), 2);
        assert_eq!(log.count_of(CheckpointType::ScanComplete), 1);
        assert_eq!(log.count_of(CheckpointType::PositionOpened), 0);
    }

    #[test]
    fn event_serialises_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::StopMoved {
            position_id: "p1".into(),
            old_stop: 99.0,
            new_stop: 100.0,
            ts_ms: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "STOP_MOVED");
        assert_eq!(json["new_stop"], 100.0);
    }
}

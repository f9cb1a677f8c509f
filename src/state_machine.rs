// =============================================================================
// Engine State Machine — phase ownership and guarded transitions
// =============================================================================
//
// Every phase change in the engine goes through `transition_to`, which
// validates the move against a static transition matrix, records it in a
// bounded history, and notifies the event sink. Invalid transitions without
// `force` are rejected and logged at warning level.
//
// Transitions are serialised by an async mutex with a 5-second acquisition
// timeout; a timeout returns `false` without mutating state.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::monitoring::{EngineEvent, NotificationSink};
use crate::types::now_ms;

/// Phases of the engine trading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    Initializing,
    Scanning,
    LevelBuilding,
    SignalWait,
    Sizing,
    Execution,
    Managing,
    Paused,
    Error,
    Emergency,
    Stopped,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Scanning => "scanning",
            Self::LevelBuilding => "level_building",
            Self::SignalWait => "signal_wait",
            Self::Sizing => "sizing",
            Self::Execution => "execution",
            Self::Managing => "managing",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Emergency => "emergency",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl EnginePhase {
    /// Phases reachable from `self` without forcing.
    pub fn allowed_next(&self) -> &'static [EnginePhase] {
        use EnginePhase::*;
        match self {
            Idle => &[Initializing, Scanning, Stopped, Error],
            Initializing => &[Scanning, Error, Emergency, Stopped],
            Scanning => &[LevelBuilding, Managing, Paused, Error, Emergency, Stopped],
            LevelBuilding => &[SignalWait, Scanning, Error, Emergency, Stopped],
            SignalWait => &[Sizing, Managing, Scanning, Paused, Error, Emergency, Stopped],
            Sizing => &[Execution, Scanning, Error, Emergency, Stopped],
            Execution => &[Managing, Scanning, Error, Emergency, Stopped],
            Managing => &[Scanning, Managing, Paused, Error, Emergency, Stopped],
            Paused => &[Scanning, Managing, Idle, Error, Emergency, Stopped],
            Error => &[Scanning, Managing, Idle, Emergency, Stopped],
            Emergency => &[Stopped, Idle],
            Stopped => &[Idle, Initializing],
        }
    }
}

/// Record of one accepted transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: EnginePhase,
    pub to: EnginePhase,
    pub reason: String,
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Serialisable status of the state machine for the dashboard API.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineStatus {
    pub current_phase: EnginePhase,
    pub previous_phase: Option<EnginePhase>,
    pub is_terminal: bool,
    pub is_error: bool,
    pub is_trading_active: bool,
    pub valid_next_phases: Vec<EnginePhase>,
    pub transition_count: usize,
}

/// How many accepted transitions to retain.
const MAX_HISTORY: usize = 100;

/// How long `transition_to` waits for the transition lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    current: EnginePhase,
    previous: Option<EnginePhase>,
    history: Vec<TransitionRecord>,
}

/// Centralised phase manager for the trading engine.
pub struct StateMachine {
    inner: RwLock<Inner>,
    /// Serialises transition attempts across tasks.
    transition_lock: Mutex<()>,
    sink: Arc<dyn NotificationSink>,
}

impl StateMachine {
    pub fn new(initial: EnginePhase, sink: Arc<dyn NotificationSink>) -> Self {
        info!(phase = %initial, "state machine initialised");
        Self {
            inner: RwLock::new(Inner {
                current: initial,
                previous: None,
                history: Vec::new(),
            }),
            transition_lock: Mutex::new(()),
            sink,
        }
    }

    pub fn current(&self) -> EnginePhase {
        self.inner.read().current
    }

    pub fn previous(&self) -> Option<EnginePhase> {
        self.inner.read().previous
    }

    /// Whether a transition to `to` would be accepted without forcing.
    pub fn can_transition(&self, to: EnginePhase) -> bool {
        self.inner.read().current.allowed_next().contains(&to)
    }

    /// Attempt a phase transition.
    ///
    /// Returns `true` when the machine is in `to` after the call (including
    /// the no-op case of a repeated same-phase request), `false` when the
    /// transition was rejected or the lock could not be acquired in time.
    pub async fn transition_to(
        &self,
        to: EnginePhase,
        reason: &str,
        metadata: Option<serde_json::Value>,
        force: bool,
    ) -> bool {
        let _guard = match tokio::time::timeout(LOCK_TIMEOUT, self.transition_lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                error!(to = %to, reason, "timed out waiting for transition lock");
                return false;
            }
        };

        let from = self.inner.read().current;

        // Same-phase requests are accepted no-ops, except the managing
        // keep-alive which is recorded like any other transition.
        if from == to && !(force || to == EnginePhase::Managing) {
            debug!(phase = %to, "ignoring transition to same phase");
            return true;
        }

        if !force && !from.allowed_next().contains(&to) {
            warn!(from = %from, to = %to, reason, "invalid transition attempt rejected");
            return false;
        }

        let record = TransitionRecord {
            from,
            to,
            reason: reason.to_string(),
            ts_ms: now_ms(),
            metadata,
        };

        {
            let mut inner = self.inner.write();
            inner.previous = Some(from);
            inner.current = to;
            inner.history.push(record.clone());
            if inner.history.len() > MAX_HISTORY {
                let excess = inner.history.len() - MAX_HISTORY;
                inner.history.drain(..excess);
            }
        }

        info!(from = %from, to = %to, reason, "phase transition");

        self.sink.notify(EngineEvent::FsmTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: record.reason.clone(),
            ts_ms: record.ts_ms,
        });

        true
    }

    /// The most recent `limit` transitions, oldest first.
    pub fn history(&self, limit: usize) -> Vec<TransitionRecord> {
        let inner = self.inner.read();
        let start = inner.history.len().saturating_sub(limit);
        inner.history[start..].to_vec()
    }

    pub fn valid_next_states(&self) -> Vec<EnginePhase> {
        self.inner.read().current.allowed_next().to_vec()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.current(), EnginePhase::Stopped | EnginePhase::Emergency)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.current(), EnginePhase::Error | EnginePhase::Emergency)
    }

    pub fn is_trading_active(&self) -> bool {
        matches!(
            self.current(),
            EnginePhase::Scanning
                | EnginePhase::LevelBuilding
                | EnginePhase::SignalWait
                | EnginePhase::Sizing
                | EnginePhase::Execution
                | EnginePhase::Managing
        )
    }

    pub fn status(&self) -> StateMachineStatus {
        let inner = self.inner.read();
        StateMachineStatus {
            current_phase: inner.current,
            previous_phase: inner.previous,
            is_terminal: matches!(inner.current, EnginePhase::Stopped | EnginePhase::Emergency),
            is_error: matches!(inner.current, EnginePhase::Error | EnginePhase::Emergency),
            is_trading_active: matches!(
                inner.current,
                EnginePhase::Scanning
                    | EnginePhase::LevelBuilding
                    | EnginePhase::SignalWait
                    | EnginePhase::Sizing
                    | EnginePhase::Execution
                    | EnginePhase::Managing
            ),
            valid_next_phases: inner.current.allowed_next().to_vec(),
            transition_count: inner.history.len(),
        }
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StateMachine")
            .field("current", &inner.current)
            .field("previous", &inner.previous)
            .field("history_len", &inner.history.len())
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

    fn machine(initial: EnginePhase) -> (StateMachine, Arc<EventLog>) {
        let log = Arc::new(EventLog::new(100));
        (StateMachine::new(initial, log.clone()), log)
    }

    #[tokio::test]
    async fn valid_transition_accepted() {
        let (sm, log) = machine(EnginePhase::Idle);
        assert!(sm.transition_to(EnginePhase::Scanning, "start", None, false).await);
        assert_eq!(sm.current(), EnginePhase::Scanning);
        assert_eq!(sm.previous(), Some(EnginePhase::Idle));
        assert_eq!(log.events().len(), 1);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let (sm, log) = machine(EnginePhase::Idle);
        assert!(!sm.transition_to(EnginePhase::Managing, "bad", None, false).await);
        assert_eq!(sm.current(), EnginePhase::Idle);
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn forced_transition_bypasses_matrix() {
        let (sm, _) = machine(EnginePhase::Idle);
        assert!(sm.transition_to(EnginePhase::Managing, "forced", None, true).await);
        assert_eq!(sm.current(), EnginePhase::Managing);
    }

    #[tokio::test]
    async fn same_phase_is_noop_except_managing() {
        let (sm, log) = machine(EnginePhase::Scanning);
        assert!(sm.transition_to(EnginePhase::Scanning, "again", None, false).await);
        assert!(log.events().is_empty());

        let (sm, log) = machine(EnginePhase::Managing);
        assert!(sm.transition_to(EnginePhase::Managing, "keep-alive", None, false).await);
        assert_eq!(log.events().len(), 1);
        assert_eq!(sm.history(10).len(), 1);
    }

    #[tokio::test]
    async fn emergency_only_reaches_stopped_or_idle() {
        let (sm, _) = machine(EnginePhase::Emergency);
        assert!(!sm.can_transition(EnginePhase::Scanning));
        assert!(!sm.can_transition(EnginePhase::Managing));
        assert!(sm.can_transition(EnginePhase::Stopped));
        assert!(sm.can_transition(EnginePhase::Idle));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (sm, _) = machine(EnginePhase::Managing);
        for i in 0..150 {
            assert!(
                sm.transition_to(EnginePhase::Managing, &format!("tick {i}"), None, false).await
            );
        }
        assert_eq!(sm.history(1000).len(), MAX_HISTORY);
        // Newest record survives trimming.
        let last = sm.history(1).pop().unwrap();
        assert_eq!(last.reason, "tick 149");
    }

    #[tokio::test]
    async fn full_cycle_path_is_valid() {
        use EnginePhase::*;
        let (sm, _) = machine(Idle);
        for (to, reason) in [
            (Initializing, "boot"),
            (Scanning, "initialised"),
            (LevelBuilding, "candidates found"),
            (SignalWait, "levels built"),
            (Sizing, "signals found"),
            (Execution, "sizing complete"),
            (Managing, "positions opened"),
            (Scanning, "slots free"),
        ] {
            assert!(sm.transition_to(to, reason, None, false).await, "step to {to}");
        }
        assert!(sm.is_trading_active());
        assert!(!sm.is_terminal());
    }

    #[tokio::test]
    async fn predicates_reflect_phase() {
        let (sm, _) = machine(EnginePhase::Stopped);
        assert!(sm.is_terminal());
        assert!(!sm.is_trading_active());

        let (sm, _) = machine(EnginePhase::Error);
        assert!(sm.is_error());
        assert!(!sm.is_terminal());
    }
}

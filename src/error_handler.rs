// =============================================================================
// Error Handler — classification, retry/backoff, circuit breakers
// =============================================================================
//
// Every failure inside the engine funnels through `ErrorHandler::handle`,
// which classifies it into (severity, category, recovery strategy), records
// it against a per-(component, operation) circuit breaker, and returns a
// recovery verdict the orchestrator acts on.
//
// Classification is structural first (typed `EngineError` variants), then by
// message keywords for anything wrapped in a plain `anyhow::Error`.
//
// Circuit breaker: closed -> open after `failure_threshold` failures;
// open -> half-open after `recovery_timeout`; half-open -> closed after
// `success_threshold` consecutive successes. While open, the verdict
// short-circuits to an error-phase transition with no retry.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::monitoring::{EngineEvent, NotificationSink};
use crate::state_machine::EnginePhase;
use crate::types::now_ms;

// =============================================================================
// Typed engine errors
// =============================================================================

/// Structured failure produced by engine components. Anything that reaches the
/// error handler as a bare `anyhow::Error` falls back to keyword
/// classification.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Failed to reach the exchange or a stream dropped.
    Connection(String),
    /// An external call exceeded its deadline.
    Timeout(String),
    /// Data failed validation (bad candle series, negative ATR, ...).
    Validation(String),
    /// A required field or symbol was absent.
    MissingData(String),
    /// Authentication / permission failure from the exchange.
    Auth(String),
    /// Out of memory, file descriptors, or similar.
    Resource(String),
    /// The exchange rejected an operation with a broker-side reason.
    Exchange(String),
    /// Preset or environment configuration is unusable.
    Config(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::MissingData(msg) => write!(f, "missing data: {msg}"),
            Self::Auth(msg) => write!(f, "auth error: {msg}"),
            Self::Resource(msg) => write!(f, "resource error: {msg}"),
            Self::Exchange(msg) => write!(f, "exchange error: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::Validation(_) => "validation",
            Self::MissingData(_) => "missing_data",
            Self::Auth(_) => "auth",
            Self::Resource(_) => "resource",
            Self::Exchange(_) => "exchange",
            Self::Config(_) => "config",
        }
    }
}

// =============================================================================
// Taxonomy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Data,
    Trading,
    System,
    External,
    Logic,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Reset,
    Emergency,
    Ignore,
}

/// Classify an error into (severity, category, recovery strategy).
pub fn classify(error: &anyhow::Error) -> (ErrorSeverity, ErrorCategory, RecoveryStrategy) {
    if let Some(engine_err) = error.downcast_ref::<EngineError>() {
        return match engine_err {
            EngineError::Connection(_) => (
                ErrorSeverity::High,
                ErrorCategory::Network,
                RecoveryStrategy::Retry,
            ),
            EngineError::Timeout(_) => (
                ErrorSeverity::Medium,
                ErrorCategory::Network,
                RecoveryStrategy::Retry,
            ),
            EngineError::Validation(_) | EngineError::MissingData(_) => (
                ErrorSeverity::Medium,
                ErrorCategory::Data,
                RecoveryStrategy::Skip,
            ),
            EngineError::Auth(_) | EngineError::Resource(_) => (
                ErrorSeverity::Critical,
                ErrorCategory::System,
                RecoveryStrategy::Emergency,
            ),
            EngineError::Exchange(_) => (
                ErrorSeverity::Medium,
                ErrorCategory::External,
                RecoveryStrategy::Retry,
            ),
            EngineError::Config(_) => (
                ErrorSeverity::High,
                ErrorCategory::Configuration,
                RecoveryStrategy::Reset,
            ),
        };
    }

    // Keyword fallback for untyped errors.
    let msg = format!("{error:#}").to_lowercase();
    if ["timeout", "connection", "network"].iter().any(|w| msg.contains(w)) {
        (
            ErrorSeverity::Medium,
            ErrorCategory::Network,
            RecoveryStrategy::Retry,
        )
    } else if ["permission", "access", "forbidden", "unauthorized"]
        .iter()
        .any(|w| msg.contains(w))
    {
        (
            ErrorSeverity::High,
            ErrorCategory::System,
            RecoveryStrategy::Emergency,
        )
    } else {
        (
            ErrorSeverity::Medium,
            ErrorCategory::Logic,
            RecoveryStrategy::Reset,
        )
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-(component, operation) failure latch.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout_ms: i64,
    success_threshold: u32,

    failure_count: u32,
    success_count: u32,
    last_failure_ts: Option<i64>,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout_secs: u64, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms: (recovery_timeout_secs * 1_000) as i64,
            success_threshold,
            failure_count: 0,
            success_count: 0,
            last_failure_ts: None,
            state: BreakerState::Closed,
        }
    }

    /// Current state, promoting open -> half-open once the recovery timeout
    /// has elapsed. `now_ts` is an epoch-milliseconds timestamp.
    pub fn state_at(&mut self, now_ts: i64) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(last) = self.last_failure_ts {
                if now_ts - last > self.recovery_timeout_ms {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                }
            }
        }
        self.state
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                }
            }
            BreakerState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure_at(&mut self, now_ts: i64) {
        self.failure_count += 1;
        self.last_failure_ts = Some(now_ts);

        if self.failure_count >= self.failure_threshold {
            self.state = BreakerState::Open;
        }
    }

    pub fn can_execute_at(&mut self, now_ts: i64) -> bool {
        matches!(self.state_at(now_ts), BreakerState::Closed | BreakerState::HalfOpen)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT_SECS, DEFAULT_SUCCESS_THRESHOLD)
    }
}

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;

// =============================================================================
// Recovery verdict
// =============================================================================

/// What the orchestrator should do after a handled error.
#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub should_retry: bool,
    pub delay: Duration,
    pub next_phase: Option<EnginePhase>,
    pub emergency: bool,
    /// True when the verdict came from an open circuit breaker rather than
    /// the error's own classification.
    pub circuit_open: bool,
}

/// One recorded error for the bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub component: String,
    pub operation: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub strategy: RecoveryStrategy,
    pub retry_count: u32,
    pub ts_ms: i64,
}

/// Aggregate counters for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub errors_by_category: HashMap<String, u64>,
    pub circuit_breakers: HashMap<String, BreakerState>,
    pub recent_errors_count: usize,
}

// =============================================================================
// Error handler
// =============================================================================

struct HandlerInner {
    history: Vec<ErrorRecord>,
    breakers: HashMap<String, CircuitBreaker>,
    counts: HashMap<ErrorCategory, u64>,
    total: u64,
}

/// Centralised error processor shared by all engine components.
pub struct ErrorHandler {
    max_retries: u32,
    retry_backoff: f64,
    max_history: usize,
    inner: RwLock<HandlerInner>,
    sink: Arc<dyn NotificationSink>,
}

/// Hard ceiling on any computed retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

impl ErrorHandler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_limits(3, 2.0, 1000, sink)
    }

    pub fn with_limits(
        max_retries: u32,
        retry_backoff: f64,
        max_history: usize,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            max_retries,
            retry_backoff,
            max_history,
            inner: RwLock::new(HandlerInner {
                history: Vec::new(),
                breakers: HashMap::new(),
                counts: HashMap::new(),
                total: 0,
            }),
            sink,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Process an error from `component`/`operation` that has already been
    /// retried `retry_count` times, and decide what happens next.
    pub fn handle(
        &self,
        err: &anyhow::Error,
        component: &str,
        operation: &str,
        retry_count: u32,
    ) -> RecoveryAction {
        let (severity, category, strategy) = classify(err);
        let ts = now_ms();
        let message = format!("{err:#}");

        let breaker_key = format!("{component}:{operation}");
        let breaker_open = {
            let mut inner = self.inner.write();

            inner.history.push(ErrorRecord {
                component: component.to_string(),
                operation: operation.to_string(),
                message: message.clone(),
                severity,
                category,
                strategy,
                retry_count,
                ts_ms: ts,
            });
            if inner.history.len() > self.max_history {
                let excess = inner.history.len() - self.max_history;
                inner.history.drain(..excess);
            }

            *inner.counts.entry(category).or_insert(0) += 1;
            inner.total += 1;

            let breaker = inner.breakers.entry(breaker_key.clone()).or_default();
            breaker.record_failure_at(ts);
            !breaker.can_execute_at(ts)
        };

        self.sink.notify(EngineEvent::Error {
            component: component.to_string(),
            operation: operation.to_string(),
            error_kind: err
                .downcast_ref::<EngineError>()
                .map(|e| e.kind().to_string())
                .unwrap_or_else(|| "unclassified".to_string()),
            message: message.clone(),
            severity: format!("{severity:?}").to_lowercase(),
            category: format!("{category:?}").to_lowercase(),
            ts_ms: ts,
            retry_count,
        });

        let action = if breaker_open {
            RecoveryAction {
                strategy,
                should_retry: false,
                delay: Duration::ZERO,
                next_phase: Some(EnginePhase::Error),
                emergency: false,
                circuit_open: true,
            }
        } else {
            self.action_for(strategy, severity, retry_count)
        };

        self.log_error(component, &message, severity, &action);
        action
    }

    fn action_for(
        &self,
        strategy: RecoveryStrategy,
        severity: ErrorSeverity,
        retry_count: u32,
    ) -> RecoveryAction {
        let mut action = RecoveryAction {
            strategy,
            should_retry: false,
            delay: Duration::ZERO,
            next_phase: None,
            emergency: false,
            circuit_open: false,
        };

        if severity == ErrorSeverity::Critical || strategy == RecoveryStrategy::Emergency {
            action.emergency = true;
            action.next_phase = Some(EnginePhase::Emergency);
            return action;
        }

        match strategy {
            RecoveryStrategy::Retry => {
                if retry_count < self.max_retries {
                    action.should_retry = true;
                    let secs = self.retry_backoff.powi(retry_count as i32);
                    action.delay = Duration::from_secs_f64(secs).min(MAX_RETRY_DELAY);
                } else {
                    action.next_phase = Some(EnginePhase::Error);
                }
            }
            RecoveryStrategy::Reset => {
                action.next_phase = Some(EnginePhase::Error);
            }
            // Skip/Ignore: keep going; the caller drops the failed item.
            RecoveryStrategy::Skip | RecoveryStrategy::Ignore => {}
            RecoveryStrategy::Emergency => unreachable!("handled above"),
        }

        action
    }

    /// Record a successful operation for the matching circuit breaker.
    pub fn record_success(&self, component: &str, operation: &str) {
        let key = format!("{component}:{operation}");
        let mut inner = self.inner.write();
        if let Some(breaker) = inner.breakers.get_mut(&key) {
            breaker.record_success();
        }
    }

    /// Current breaker state for a (component, operation) pair.
    pub fn breaker_state(&self, component: &str, operation: &str) -> BreakerState {
        let key = format!("{component}:{operation}");
        let mut inner = self.inner.write();
        match inner.breakers.get_mut(&key) {
            Some(breaker) => breaker.state_at(now_ms()),
            None => BreakerState::Closed,
        }
    }

    /// Whether calls for this pair may currently execute.
    pub fn can_execute(&self, component: &str, operation: &str) -> bool {
        !matches!(self.breaker_state(component, operation), BreakerState::Open)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let mut inner = self.inner.write();
        let ts = now_ms();
        let breakers = inner
            .breakers
            .iter_mut()
            .map(|(k, b)| (k.clone(), b.state_at(ts)))
            .collect();
        ErrorStatistics {
            total_errors: inner.total,
            errors_by_category: inner
                .counts
                .iter()
                .map(|(cat, n)| (format!("{cat:?}").to_lowercase(), *n))
                .collect(),
            circuit_breakers: breakers,
            recent_errors_count: inner.history.len(),
        }
    }

    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let inner = self.inner.read();
        let start = inner.history.len().saturating_sub(limit);
        inner.history[start..].to_vec()
    }

    #[cfg(test)]
    pub fn backdate_breaker_failure(&self, component: &str, operation: &str, by_ms: i64) {
        let key = format!("{component}:{operation}");
        let mut inner = self.inner.write();
        if let Some(breaker) = inner.breakers.get_mut(&key) {
            if let Some(ts) = breaker.last_failure_ts.as_mut() {
                *ts -= by_ms;
            }
        }
    }

    fn log_error(
        &self,
        component: &str,
        message: &str,
        severity: ErrorSeverity,
        action: &RecoveryAction,
    ) {
        match severity {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    component,
                    severity = ?severity,
                    strategy = ?action.strategy,
                    circuit_open = action.circuit_open,
                    "{message}"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    component,
                    strategy = ?action.strategy,
                    should_retry = action.should_retry,
                    "{message}"
                );
            }
            ErrorSeverity::Low => {
                debug!(component, "{message}");
            }
        }
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ErrorHandler")
            .field("max_retries", &self.max_retries)
            .field("total_errors", &inner.total)
            .field("breakers", &inner.breakers.len())
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

    fn handler() -> (ErrorHandler, Arc<EventLog>) {
        let log = Arc::new(EventLog::new(100));
        (ErrorHandler::new(log.clone()), log)
    }

    #[test]
    fn classify_typed_errors() {
        let err = anyhow::Error::new(EngineError::Connection("refused".into()));
        let (sev, cat, rec) = classify(&err);
        assert_eq!(sev, ErrorSeverity::High);
        assert_eq!(cat, ErrorCategory::Network);
        assert_eq!(rec, RecoveryStrategy::Retry);

        let err = anyhow::Error::new(EngineError::Auth("bad key".into()));
        let (sev, cat, rec) = classify(&err);
        assert_eq!(sev, ErrorSeverity::Critical);
        assert_eq!(cat, ErrorCategory::System);
        assert_eq!(rec, RecoveryStrategy::Emergency);

        let err = anyhow::Error::new(EngineError::Validation("bad candle".into()));
        let (_, cat, rec) = classify(&err);
        assert_eq!(cat, ErrorCategory::Data);
        assert_eq!(rec, RecoveryStrategy::Skip);
    }

    #[test]
    fn classify_by_message_keywords() {
        let err = anyhow::anyhow!("request timeout while fetching ticker");
        let (_, cat, rec) = classify(&err);
        assert_eq!(cat, ErrorCategory::Network);
        assert_eq!(rec, RecoveryStrategy::Retry);

        let err = anyhow::anyhow!("access forbidden for this endpoint");
        let (_, cat, rec) = classify(&err);
        assert_eq!(cat, ErrorCategory::System);
        assert_eq!(rec, RecoveryStrategy::Emergency);

        let err = anyhow::anyhow!("something unexpected");
        let (sev, cat, rec) = classify(&err);
        assert_eq!(sev, ErrorSeverity::Medium);
        assert_eq!(cat, ErrorCategory::Logic);
        assert_eq!(rec, RecoveryStrategy::Reset);
    }

    #[test]
    fn retry_uses_exponential_backoff_with_cap() {
        let (handler, _) = handler();
        let err = anyhow::Error::new(EngineError::Timeout("slow".into()));

        let a0 = handler.handle(&err, "scanner", "fetch", 0);
        assert!(a0.should_retry);
        assert_eq!(a0.delay, Duration::from_secs(1));

        let a2 = handler.handle(&err, "scanner", "fetch", 2);
        assert!(a2.should_retry);
        assert_eq!(a2.delay, Duration::from_secs(4));

        let a3 = handler.handle(&err, "scanner", "fetch", 3);
        assert!(!a3.should_retry);
        assert_eq!(a3.next_phase, Some(EnginePhase::Error));
    }

    #[test]
    fn emergency_on_critical() {
        let (handler, _) = handler();
        let err = anyhow::Error::new(EngineError::Resource("out of memory".into()));
        let action = handler.handle(&err, "engine", "cycle", 0);
        assert!(action.emergency);
        assert_eq!(action.next_phase, Some(EnginePhase::Emergency));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let (handler, _) = handler();
        let err = anyhow::Error::new(EngineError::Connection("refused".into()));

        for _ in 0..4 {
            handler.handle(&err, "exchange", "fetch_markets", 0);
        }
        assert_eq!(handler.breaker_state("exchange", "fetch_markets"), BreakerState::Closed);

        handler.handle(&err, "exchange", "fetch_markets", 0);
        assert_eq!(handler.breaker_state("exchange", "fetch_markets"), BreakerState::Open);

        // Any further error for the pair short-circuits.
        let action = handler.handle(&err, "exchange", "fetch_markets", 0);
        assert!(action.circuit_open);
        assert!(!action.should_retry);
        assert_eq!(action.next_phase, Some(EnginePhase::Error));
    }

    #[test]
    fn breaker_half_opens_then_closes() {
        let (handler, _) = handler();
        let err = anyhow::Error::new(EngineError::Connection("refused".into()));

        for _ in 0..5 {
            handler.handle(&err, "exchange", "ticker", 0);
        }
        assert_eq!(handler.breaker_state("exchange", "ticker"), BreakerState::Open);

        // Simulate the recovery timeout elapsing.
        handler.backdate_breaker_failure("exchange", "ticker", 61_000);
        assert_eq!(handler.breaker_state("exchange", "ticker"), BreakerState::HalfOpen);

        for _ in 0..3 {
            handler.record_success("exchange", "ticker");
        }
        assert_eq!(handler.breaker_state("exchange", "ticker"), BreakerState::Closed);
    }

    #[test]
    fn history_is_bounded_and_counted() {
        let log = Arc::new(EventLog::new(10));
        let handler = ErrorHandler::with_limits(3, 2.0, 5, log);
        let err = anyhow::anyhow!("weird logic issue");

        for _ in 0..8 {
            handler.handle(&err, "engine", "cycle", 0);
        }

        let stats = handler.statistics();
        assert_eq!(stats.total_errors, 8);
        assert_eq!(stats.recent_errors_count, 5);
        assert_eq!(stats.errors_by_category.get("logic"), Some(&8));
    }

    #[test]
    fn error_events_reach_sink() {
        let (handler, log) = handler();
        let err = anyhow::Error::new(EngineError::Timeout("slow".into()));
        handler.handle(&err, "scanner", "fetch", 1);

        let events = log.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::Error {
                component,
                retry_count,
                category,
                ..
            } => {
                assert_eq!(component, "scanner");
                assert_eq!(*retry_count, 1);
                assert_eq!(category, "network");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

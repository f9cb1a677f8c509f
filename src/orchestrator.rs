// =============================================================================
// Trading Orchestrator — the engine loop and its phase handlers
// =============================================================================
//
// A single task drives the trading cycle. Each iteration:
//
//   1. reads the current phase from the state machine (terminal -> break),
//   2. skips the cycle when the resource hard cap is exceeded,
//   3. runs the health and kill-switch checks,
//   4. dispatches to the phase handler, and
//   5. maps any failure through the error handler onto a phase transition.
//
// Pacing between iterations is phase-dependent and always interruptible: the
// stop event preempts every sleep.
//
// The orchestrator — not the position state machine — closes positions on
// stop violation and realises take-profit rungs.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Preset;
use crate::error_handler::ErrorHandler;
use crate::exchange::ExchangeClient;
use crate::execution::ExecutionManager;
use crate::health::{HealthAction, HealthMonitor};
use crate::monitoring::{
    CheckpointLog, CheckpointStatus, CheckpointType, EngineEvent, MonitoringSink, NotificationSink,
};
use crate::position::{
    Position, PositionBook, PositionSnapshot, PositionStateMachine,
};
use crate::resource_monitor::ResourceMonitor;
use crate::risk::{PositionSize, RiskManager};
use crate::scanning::ScanningManager;
use crate::signals::{Signal, SignalManager};
use crate::state_machine::{EnginePhase, StateMachine};
use crate::types::{now_ms, OrderIntent, OrderSide, Side};

/// Milliseconds per 5-minute bar, for bars-since-entry arithmetic.
const BAR_MS: i64 = 300_000;

/// Per-position bookkeeping the orchestrator keeps alongside the book.
struct PositionTracker {
    machine: PositionStateMachine,
    highest_price: f64,
    lowest_price: f64,
    max_unrealized_pnl_r: f64,
    /// Remaining take-profit rungs as (price, size_pct, ladder index).
    tp_rungs: Vec<(f64, f64, usize)>,
}

/// Coordinates every component across the trading cycle.
pub struct TradingOrchestrator {
    state_machine: Arc<StateMachine>,
    error_handler: Arc<ErrorHandler>,
    scanning: Arc<ScanningManager>,
    signals: Arc<SignalManager>,
    risk: Arc<RiskManager>,
    execution: Arc<ExecutionManager>,
    positions: Arc<PositionBook>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceMonitor>,
    monitoring: Arc<dyn MonitoringSink>,
    sink: Arc<dyn NotificationSink>,
    client: Arc<dyn ExchangeClient>,
    preset: Preset,
    stop: Arc<Notify>,

    session_id: RwLock<String>,
    trackers: RwLock<HashMap<String, PositionTracker>>,
    equity: RwLock<f64>,
    day_start_ms: RwLock<i64>,
    last_optimization: RwLock<std::time::Instant>,
    cycle_count: AtomicU64,
    error_attempts: AtomicU32,
}

#[allow(clippy::too_many_arguments)]
impl TradingOrchestrator {
    pub fn new(
        preset: Preset,
        state_machine: Arc<StateMachine>,
        error_handler: Arc<ErrorHandler>,
        scanning: Arc<ScanningManager>,
        signals: Arc<SignalManager>,
        risk: Arc<RiskManager>,
        execution: Arc<ExecutionManager>,
        positions: Arc<PositionBook>,
        health: Arc<HealthMonitor>,
        resources: Arc<ResourceMonitor>,
        monitoring: Arc<dyn MonitoringSink>,
        sink: Arc<dyn NotificationSink>,
        client: Arc<dyn ExchangeClient>,
        stop: Arc<Notify>,
    ) -> Self {
        Self {
            state_machine,
            error_handler,
            scanning,
            signals,
            risk,
            execution,
            positions,
            health,
            resources,
            monitoring,
            sink,
            client,
            preset,
            stop,
            session_id: RwLock::new(Uuid::new_v4().to_string()),
            trackers: RwLock::new(HashMap::new()),
            equity: RwLock::new(0.0),
            day_start_ms: RwLock::new(start_of_day_ms()),
            last_optimization: RwLock::new(std::time::Instant::now()),
            cycle_count: AtomicU64::new(0),
            error_attempts: AtomicU32::new(0),
        }
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    /// The engine loop. Runs until the state machine reaches a terminal
    /// phase or the stop event fires.
    pub async fn run(&self) {
        info!("trading orchestrator starting");

        if self.state_machine.current() == EnginePhase::Idle {
            self.state_machine
                .transition_to(EnginePhase::Initializing, "engine start", None, false)
                .await;
        }

        loop {
            let phase = self.state_machine.current();
            if self.state_machine.is_terminal() {
                info!(phase = %phase, "terminal phase reached, engine loop exiting");
                break;
            }

            // Hard resource cap skips the whole cycle.
            if self.resources.should_skip_cycle() {
                warn!("resource hard cap exceeded, skipping cycle");
                if self.interruptible_sleep(Duration::from_millis(500)).await {
                    break;
                }
                continue;
            }

            // Over budget (but under the hard cap): shed memory on a slow
            // cadence instead of skipping work.
            self.maybe_run_optimization();

            // Health gates run before the phase handler.
            if self.run_health_checks(phase).await {
                continue;
            }

            let cycle_result = self.dispatch(phase).await;
            self.cycle_count.fetch_add(1, Ordering::Relaxed);

            match cycle_result {
                Ok(()) => {
                    self.error_handler.record_success("orchestrator", "trading_cycle");
                    // A clean cycle outside the error phase resets the
                    // consecutive-failure budget.
                    if phase != EnginePhase::Error {
                        self.error_attempts.store(0, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    let retries = self.error_attempts.fetch_add(1, Ordering::Relaxed);
                    let action =
                        self.error_handler.handle(&e, "orchestrator", "trading_cycle", retries);
                    CheckpointLog::record(
                        self.monitoring.as_ref(),
                        CheckpointType::Error,
                        CheckpointStatus::Failed,
                        format!("cycle failed in {phase}: {e:#}"),
                        &self.session_id(),
                    );

                    if action.emergency {
                        self.state_machine
                            .transition_to(EnginePhase::Emergency, "emergency recovery", None, true)
                            .await;
                    } else if action.should_retry {
                        if self.interruptible_sleep(action.delay).await {
                            break;
                        }
                    } else if let Some(next) = action.next_phase {
                        self.state_machine
                            .transition_to(next, "error recovery", None, false)
                            .await;
                    }
                }
            }

            // Phase-dependent pacing, preempted by the stop event.
            let after = self.state_machine.current();
            let delay = pacing(phase, after != phase);
            if !delay.is_zero() && self.interruptible_sleep(delay).await {
                break;
            }
        }

        self.state_machine
            .transition_to(EnginePhase::Stopped, "engine loop exited", None, true)
            .await;
        info!("trading orchestrator stopped");
    }

    /// Request a stop; the loop exits at its next suspension point.
    pub fn request_stop(&self) {
        self.stop.notify_waiters();
    }

    /// Truncate caches and stale histories when resources run over budget,
    /// at most once per optimization interval.
    fn maybe_run_optimization(&self) {
        if !self.resources.over_budget() {
            return;
        }
        let interval = Duration::from_secs(self.preset.engine.optimization_interval_secs);
        let mut last = self.last_optimization.write();
        if last.elapsed() < interval {
            return;
        }
        *last = std::time::Instant::now();

        warn!("resource budget exceeded, running optimization pass");
        self.scanning.shrink();
        self.signals.expire_stale();
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    /// Run the kill-switch and connectivity gates. Returns `true` when the
    /// cycle should restart (a transition was made).
    async fn run_health_checks(&self, phase: EnginePhase) -> bool {
        // Balance doubles as the connectivity probe.
        let balance_ok = self.refresh_equity().await;
        self.health.record_connectivity(balance_ok);

        let daily_pnl = self.daily_pnl();
        let consecutive = self.positions.consecutive_losses();
        let verdict = self.health.check(daily_pnl, consecutive);

        match verdict.action {
            HealthAction::Continue => {
                // A paused engine resumes once health clears.
                if phase == EnginePhase::Paused {
                    let target = if self.positions.open_count() > 0 {
                        EnginePhase::Managing
                    } else {
                        EnginePhase::Scanning
                    };
                    return self
                        .state_machine
                        .transition_to(target, "health restored", None, false)
                        .await;
                }
                false
            }
            HealthAction::Pause => {
                if phase != EnginePhase::Paused {
                    let reason = verdict.reason.unwrap_or_else(|| "health gate".into());
                    self.state_machine
                        .transition_to(EnginePhase::Paused, &reason, None, false)
                        .await;
                    return true;
                }
                false
            }
            HealthAction::Error => {
                if phase != EnginePhase::Error {
                    let reason = verdict.reason.unwrap_or_else(|| "connectivity lost".into());
                    self.state_machine
                        .transition_to(EnginePhase::Error, &reason, None, false)
                        .await;
                    return true;
                }
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Phase dispatch
    // -------------------------------------------------------------------------

    async fn dispatch(&self, phase: EnginePhase) -> anyhow::Result<()> {
        match phase {
            EnginePhase::Idle => self.handle_idle().await,
            EnginePhase::Initializing => self.handle_initializing().await,
            EnginePhase::Scanning => self.handle_scanning().await,
            EnginePhase::LevelBuilding => self.handle_level_building().await,
            EnginePhase::SignalWait => self.handle_signal_wait().await,
            EnginePhase::Sizing => self.handle_sizing().await,
            EnginePhase::Execution => self.handle_execution().await,
            EnginePhase::Managing => self.handle_managing().await,
            EnginePhase::Paused => Ok(()),
            EnginePhase::Error => self.handle_error_phase().await,
            EnginePhase::Emergency | EnginePhase::Stopped => Ok(()),
        }
    }

    async fn handle_idle(&self) -> anyhow::Result<()> {
        self.state_machine
            .transition_to(EnginePhase::Initializing, "engine start", None, false)
            .await;
        Ok(())
    }

    async fn handle_initializing(&self) -> anyhow::Result<()> {
        // A working balance fetch is the readiness requirement.
        let balance = self.client.fetch_balance().await?;
        debug!(assets = balance.len(), "initial balance fetched");

        self.state_machine
            .transition_to(EnginePhase::Scanning, "initialisation complete", None, false)
            .await;
        Ok(())
    }

    async fn handle_scanning(&self) -> anyhow::Result<()> {
        // Each scan round is a fresh session for monitoring correlation.
        *self.session_id.write() = Uuid::new_v4().to_string();
        let session = self.session_id();

        let results = self.scanning.scan_markets(&session).await?;

        if results.is_empty() {
            debug!("no candidates found, staying in scanning");
            return Ok(());
        }

        self.state_machine
            .transition_to(
                EnginePhase::LevelBuilding,
                &format!("found {} candidates", results.len()),
                None,
                false,
            )
            .await;
        Ok(())
    }

    async fn handle_level_building(&self) -> anyhow::Result<()> {
        let session = self.session_id();
        // Levels are constructed inside the scan; this phase only accounts
        // for them before the signal wait.
        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::LevelBuildingStart,
            CheckpointStatus::InProgress,
            "accounting scan levels",
            &session,
        );

        let level_count: usize = self
            .scanning
            .last_results()
            .iter()
            .map(|r| r.levels.len())
            .sum();

        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::LevelBuildingComplete,
            CheckpointStatus::Completed,
            format!("{level_count} levels across candidates"),
            &session,
        );

        self.state_machine
            .transition_to(EnginePhase::SignalWait, "level building complete", None, false)
            .await;
        Ok(())
    }

    async fn handle_signal_wait(&self) -> anyhow::Result<()> {
        // Open positions take priority over new entries.
        if self.positions.open_count() > 0 {
            self.state_machine
                .transition_to(
                    EnginePhase::Managing,
                    &format!("managing {} open positions", self.positions.open_count()),
                    None,
                    false,
                )
                .await;
            return Ok(());
        }

        let scan_results = self.scanning.last_results();
        if scan_results.is_empty() {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "no scan data for signals", None, false)
                .await;
            return Ok(());
        }

        let added = self.signals.generate_from_scan(&scan_results);
        self.scanning.note_signal_count(added.len());

        if added.is_empty() {
            debug!("no signals generated, waiting");
            return Ok(());
        }

        let session = self.session_id();
        for signal in &added {
            CheckpointLog::record(
                self.monitoring.as_ref(),
                CheckpointType::SignalDetected,
                CheckpointStatus::Completed,
                format!("{} {} {} @ {:.4}", signal.strategy, signal.side, signal.symbol, signal.entry),
                &session,
            );
        }

        self.state_machine
            .transition_to(
                EnginePhase::Sizing,
                &format!("found {} signals", added.len()),
                None,
                false,
            )
            .await;
        Ok(())
    }

    async fn handle_sizing(&self) -> anyhow::Result<()> {
        let active = self.signals.active_signals();
        if active.is_empty() {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "no signals to size", None, false)
                .await;
            return Ok(());
        }

        let equity = *self.equity.read();
        let open = self.positions.open_positions();
        let session = self.session_id();

        let mut approved: Vec<PositionSize> = Vec::new();
        for signal in &active {
            let evaluation = self.risk.evaluate(signal, equity, &open, &approved);
            if evaluation.approved {
                let size = evaluation.position_size.expect("approved implies size");
                self.signals.set_position_size(&signal.id, size.clone());
                CheckpointLog::record(
                    self.monitoring.as_ref(),
                    CheckpointType::PositionSizing,
                    CheckpointStatus::Completed,
                    format!("{} sized: qty {:.6}", signal.symbol, size.quantity),
                    &session,
                );
                approved.push(size);
            } else {
                self.signals.remove_signal(&signal.id, &evaluation.reason);
            }
        }

        if approved.is_empty() {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "no signals passed risk evaluation", None, false)
                .await;
        } else {
            self.state_machine
                .transition_to(
                    EnginePhase::Execution,
                    &format!("position sizing complete: {} signals", approved.len()),
                    None,
                    false,
                )
                .await;
        }
        Ok(())
    }

    async fn handle_execution(&self) -> anyhow::Result<()> {
        let active = self.signals.active_signals();
        if active.is_empty() {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "nothing to execute", None, false)
                .await;
            return Ok(());
        }

        let session = self.session_id();
        let mut opened = 0usize;

        for signal in &active {
            let Some(size) = signal.meta.position_size.clone() else {
                self.signals.remove_signal(&signal.id, "no size attached");
                continue;
            };

            CheckpointLog::record(
                self.monitoring.as_ref(),
                CheckpointType::OrderPlaced,
                CheckpointStatus::InProgress,
                format!("{} entry {:.6}", signal.symbol, size.quantity),
                &session,
            );

            let order = self
                .execution
                .execute_trade(
                    &signal.symbol,
                    OrderSide::from(signal.side),
                    size.quantity,
                    signal.entry,
                    OrderIntent::Entry,
                )
                .await;

            if order.filled_qty > 0.0 {
                CheckpointLog::record(
                    self.monitoring.as_ref(),
                    CheckpointType::OrderFilled,
                    CheckpointStatus::Completed,
                    format!("{} filled {:.6}", signal.symbol, order.filled_qty),
                    &session,
                );
                self.open_position_from(signal, &size, order);
                self.signals.mark_executed(&signal.id, true);
                opened += 1;
            } else {
                warn!(symbol = %signal.symbol, "entry order produced no fill");
                self.signals.mark_executed(&signal.id, false);
            }
        }

        if opened > 0 {
            self.state_machine
                .transition_to(
                    EnginePhase::Managing,
                    &format!("opened {opened} positions"),
                    None,
                    false,
                )
                .await;
        } else {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "no positions opened", None, false)
                .await;
        }
        Ok(())
    }

    fn open_position_from(&self, signal: &Signal, size: &PositionSize, order: crate::execution::Order) {
        let entry_price = order.avg_fill_price.unwrap_or(signal.entry);
        let fees = order.fees_usd;
        let filled = order.filled_qty;

        // Remaining rungs of the configured ladder paired with the signal's
        // optimized prices.
        let tp_rungs: Vec<(f64, f64, usize)> = signal
            .take_profits
            .iter()
            .zip(self.preset.position.tp_levels.iter())
            .enumerate()
            .map(|(i, (price, rung))| (*price, rung.size_pct, i))
            .collect();
        let first_tp = tp_rungs.first().map(|(price, _, _)| *price);

        let position = Position::open(
            &signal.symbol,
            signal.side,
            signal.strategy,
            filled,
            entry_price,
            signal.stop_loss,
            first_tp,
            fees,
            Some(order),
        );

        let tracker = PositionTracker {
            machine: PositionStateMachine::new(
                self.preset.fsm.clone(),
                entry_price,
                signal.stop_loss,
            ),
            highest_price: entry_price,
            lowest_price: entry_price,
            max_unrealized_pnl_r: 0.0,
            tp_rungs,
        };

        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::PositionOpened,
            CheckpointStatus::Completed,
            format!("{} {} qty {:.6} @ {:.4}", signal.side, signal.symbol, filled, entry_price),
            &self.session_id(),
        );

        self.trackers.write().insert(position.id.clone(), tracker);
        self.positions.insert(position);
    }

    async fn handle_managing(&self) -> anyhow::Result<()> {
        let open = self.positions.open_positions();
        if open.is_empty() {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "no open positions", None, false)
                .await;
            return Ok(());
        }

        for position in open {
            if let Err(e) = self.manage_position(&position).await {
                // One position's trouble must not stall the others.
                self.error_handler.handle(&e, "orchestrator", "manage_position", 0);
            }
        }

        // Slots freed up: go look for new setups. Otherwise keep managing.
        let open_now = self.positions.open_count();
        if open_now < self.preset.risk.max_concurrent_positions {
            self.state_machine
                .transition_to(EnginePhase::Scanning, "available position slots", None, false)
                .await;
        } else {
            self.state_machine
                .transition_to(EnginePhase::Managing, "all position slots busy", None, false)
                .await;
            // The keep-alive pauses harder than the normal managing pace.
            self.interruptible_sleep(Duration::from_secs(5)).await;
        }
        Ok(())
    }

    /// Update one position: refresh data, recompute PnL, run the lifecycle
    /// machine, ratchet the stop, realise rungs, close on violations.
    async fn manage_position(&self, position: &Position) -> anyhow::Result<()> {
        let market_data = match self.scanning.cached(&position.symbol) {
            Some(md) => md,
            None => self.scanning.snapshot_symbol(&position.symbol).await?,
        };
        let price = market_data.price;
        if price <= 0.0 {
            return Ok(());
        }

        self.positions.with_open_mut(&position.id, |p| p.update_pnl(price));

        // Refreshed copy after the PnL update.
        let Some(current) = self
            .positions
            .open_positions()
            .into_iter()
            .find(|p| p.id == position.id)
        else {
            return Ok(());
        };

        let (mut snapshot, phase_change) = {
            let mut trackers = self.trackers.write();
            let Some(tracker) = trackers.get_mut(&position.id) else {
                return Ok(());
            };

            tracker.highest_price = tracker.highest_price.max(price);
            tracker.lowest_price = tracker.lowest_price.min(price);

            let mut snapshot = PositionSnapshot {
                current_price: price,
                entry_price: current.entry,
                stop_loss: current.stop_loss,
                is_long: current.side.is_long(),
                bars_since_entry: ((now_ms() - current.opened_at) / BAR_MS).max(0) as u32,
                highest_price: tracker.highest_price,
                lowest_price: tracker.lowest_price,
                tp_levels_hit: current.meta.tp_levels_hit.clone(),
                remaining_size_pct: current.meta.remaining_size_pct,
                unrealized_pnl_r: current.pnl_r,
                max_unrealized_pnl_r: tracker.max_unrealized_pnl_r,
            };
            let change = tracker.machine.update(&mut snapshot);
            tracker.max_unrealized_pnl_r = snapshot.max_unrealized_pnl_r;
            (snapshot, change)
        };

        if let Some(change) = &phase_change {
            debug!(
                position = %current.id,
                from = %change.from,
                to = %change.to,
                "position lifecycle advanced"
            );
        }

        // Stop ratchet.
        let proposal = {
            let trackers = self.trackers.read();
            trackers
                .get(&position.id)
                .and_then(|t| t.machine.should_update_stop_loss(&snapshot, current.stop_loss))
        };
        if let Some(new_stop) = proposal {
            let old_stop = current.stop_loss;
            self.positions.with_open_mut(&position.id, |p| {
                p.move_stop(new_stop, "lifecycle stop proposal");
            });
            snapshot.stop_loss = new_stop;
            self.sink.notify(EngineEvent::StopMoved {
                position_id: current.id.clone(),
                old_stop,
                new_stop,
                ts_ms: now_ms(),
            });
        }

        // Take-profit rungs crossed by the current price.
        self.realise_tp_rungs(&current, price).await;

        // Stop violation closes the remainder. The lifecycle machine never
        // does this itself.
        let Some(current) = self
            .positions
            .open_positions()
            .into_iter()
            .find(|p| p.id == position.id)
        else {
            return Ok(());
        };
        if current.stop_violated(price) {
            self.close_position_full(&current, price, "stop loss violated").await;
        }

        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::PositionManaged,
            CheckpointStatus::Completed,
            format!("{} @ {:.4} pnl {:.2}", current.symbol, price, current.pnl_usd),
            &self.session_id(),
        );
        Ok(())
    }

    /// Close the configured fraction at every rung the price has crossed.
    async fn realise_tp_rungs(&self, position: &Position, price: f64) {
        loop {
            let rung = {
                let trackers = self.trackers.read();
                let Some(tracker) = trackers.get(&position.id) else {
                    return;
                };
                tracker.tp_rungs.first().copied()
            };
            let Some((tp_price, size_pct, rung_index)) = rung else {
                return;
            };

            let crossed = match position.side {
                Side::Long => price >= tp_price,
                Side::Short => price <= tp_price,
            };
            if !crossed {
                return;
            }

            let Some(current) = self
                .positions
                .open_positions()
                .into_iter()
                .find(|p| p.id == position.id)
            else {
                return;
            };
            let close_qty = (current.meta.initial_qty * size_pct).min(current.qty);
            if close_qty <= 0.0 {
                return;
            }

            let order = self
                .execution
                .execute_trade(
                    &current.symbol,
                    OrderSide::closing(current.side),
                    close_qty,
                    tp_price,
                    OrderIntent::TakeProfit,
                )
                .await;

            if order.filled_qty <= 0.0 {
                warn!(position = %current.id, rung_index, "take-profit order did not fill");
                return;
            }

            let fill_price = order.avg_fill_price.unwrap_or(tp_price);
            let mut realized = 0.0;
            self.positions.with_open_mut(&current.id, |p| {
                realized = p.apply_partial_close(order.filled_qty, fill_price, rung_index, order.fees_usd);
            });

            self.sink.notify(EngineEvent::TakeProfit {
                position_id: current.id.clone(),
                price: fill_price,
                pnl: realized,
                ts_ms: now_ms(),
            });

            // Consume the rung and surface the next target.
            let next_tp = {
                let mut trackers = self.trackers.write();
                if let Some(tracker) = trackers.get_mut(&current.id) {
                    if !tracker.tp_rungs.is_empty() {
                        tracker.tp_rungs.remove(0);
                    }
                    tracker.tp_rungs.first().map(|(p, _, _)| *p)
                } else {
                    None
                }
            };
            self.positions.with_open_mut(&current.id, |p| {
                p.take_profit = next_tp;
            });

            // The ladder may have exhausted the position.
            let still_open = self
                .positions
                .open_positions()
                .iter()
                .any(|p| p.id == current.id);
            if !still_open {
                self.finish_closed_position(&current.id, "take-profit ladder exhausted");
                return;
            }
        }
    }

    async fn close_position_full(&self, position: &Position, price: f64, reason: &str) {
        let order = self
            .execution
            .execute_trade(
                &position.symbol,
                OrderSide::closing(position.side),
                position.qty,
                price,
                OrderIntent::StopLoss,
            )
            .await;

        let fill_price = order.avg_fill_price.unwrap_or(price);
        let fill_fees = order.fees_usd;
        if order.filled_qty <= 0.0 {
            warn!(position = %position.id, reason, "close order did not fill");
        }

        self.positions.with_open_mut(&position.id, |p| {
            p.meta.exit_order = Some(order);
            p.close(fill_price, reason, fill_fees);
        });
        self.finish_closed_position(&position.id, reason);
    }

    fn finish_closed_position(&self, position_id: &str, reason: &str) {
        if let Some(tracker) = self.trackers.write().get_mut(position_id) {
            tracker.machine.close_position(reason);
        }
        self.trackers.write().remove(position_id);

        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::PositionClosed,
            CheckpointStatus::Completed,
            format!("position {position_id}: {reason}"),
            &self.session_id(),
        );
    }

    async fn handle_error_phase(&self) -> anyhow::Result<()> {
        let attempts = self.error_attempts.load(Ordering::Relaxed);
        if attempts > self.error_handler.max_retries() {
            error!(attempts, "error retries exhausted, escalating to emergency");
            self.state_machine
                .transition_to(EnginePhase::Emergency, "error retries exhausted", None, false)
                .await;
            return Ok(());
        }

        let target = if self.positions.open_count() > 0 {
            EnginePhase::Managing
        } else {
            EnginePhase::Scanning
        };
        self.state_machine
            .transition_to(target, &format!("error recovery attempt {attempts}"), None, false)
            .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Equity
    // -------------------------------------------------------------------------

    /// Refresh cached equity from the exchange. Returns whether the balance
    /// fetch succeeded (the connectivity signal).
    async fn refresh_equity(&self) -> bool {
        match self.client.fetch_balance().await {
            Ok(balances) => {
                let quote = balances
                    .get(&self.preset.engine.quote_asset)
                    .copied()
                    .unwrap_or(0.0);
                let equity = quote + self.positions.open_pnl_usd() + self.realized_today();
                *self.equity.write() = equity;
                true
            }
            Err(e) => {
                warn!(error = %e, "balance fetch failed");
                false
            }
        }
    }

    fn realized_today(&self) -> f64 {
        let mut day_start = self.day_start_ms.write();
        let today = start_of_day_ms();
        if *day_start != today {
            info!("date rolled, resetting daily PnL window");
            *day_start = today;
        }
        self.positions.realized_pnl_since(*day_start)
    }

    fn daily_pnl(&self) -> f64 {
        self.realized_today() + self.positions.open_pnl_usd()
    }

    // -------------------------------------------------------------------------
    // Pacing
    // -------------------------------------------------------------------------

    /// Sleep that the stop event preempts. Returns `true` when stop fired.
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        tokio::time::timeout(duration, self.stop.notified()).await.is_ok()
    }
}

/// Inter-cycle pacing per phase. A phase change continues without delay so
/// the fast phases chain immediately; execution is always paced tightly.
fn pacing(phase: EnginePhase, changed: bool) -> Duration {
    use EnginePhase::*;

    if phase == Execution {
        return Duration::from_millis(100);
    }
    if changed {
        return Duration::ZERO;
    }
    match phase {
        Scanning => Duration::from_secs(5),
        SignalWait => Duration::from_secs(2),
        Managing => Duration::from_secs(1),
        _ => Duration::from_millis(500),
    }
}

impl std::fmt::Debug for TradingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingOrchestrator")
            .field("phase", &self.state_machine.current())
            .field("cycles", &self.cycle_count())
            .field("open_positions", &self.positions.open_count())
            .finish()
    }
}

fn start_of_day_ms() -> i64 {
    let now = now_ms();
    now - now.rem_euclid(86_400_000)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, Preset};
    use crate::exchange::{OrderBook, PaperExchangeClient, Ticker};
    use crate::market_data::{Candle, MarketDataCache};
    use crate::monitoring::EventLog;
    use crate::risk::KillSwitch;

    struct Harness {
        orchestrator: TradingOrchestrator,
        paper: Arc<PaperExchangeClient>,
        state_machine: Arc<StateMachine>,
        positions: Arc<PositionBook>,
        events: Arc<EventLog>,
        checkpoints: Arc<CheckpointLog>,
        kill_switch: Arc<KillSwitch>,
    }

    fn ticker(symbol: &str, last: f64) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last,
            volume_24h_usd: 50_000_000.0,
            open_interest_usd: 10_000_000.0,
            oi_change_24h_pct: 2.0,
            trades_per_minute: 30.0,
        }
    }

    fn liquid_book(mid: f64) -> OrderBook {
        let step = mid * 0.0003;
        OrderBook {
            bids: (1..=20).map(|i| (mid - step * i as f64, 0.5)).collect(),
            asks: (1..=20).map(|i| (mid + step * i as f64, 0.5)).collect(),
        }
    }

    /// Ranging candles bouncing off ~49 000 support and ~50 000 resistance,
    /// warming volume into a high-volume breakout close at 50 300.
    fn breakout_candles() -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut i: i64 = 0;
        for _ in 0..12 {
            for price in [49_300.0, 49_700.0, 49_950.0, 49_980.0, 49_600.0, 49_100.0, 49_050.0, 49_400.0]
            {
                candles.push(Candle {
                    ts_ms: i * 300_000,
                    open: price - 30.0,
                    high: price + 60.0,
                    low: price - 60.0,
                    close: price,
                    volume: 1_000.0,
                });
                i += 1;
            }
        }
        // Volume builds through the final hour.
        let n = candles.len();
        for candle in candles.iter_mut().skip(n - 11) {
            candle.volume = 2_000.0;
        }
        candles.push(Candle {
            ts_ms: i * 300_000,
            open: 49_900.0,
            high: 50_350.0,
            low: 49_700.0,
            close: 50_300.0,
            volume: 5_000.0,
        });
        candles
    }

    fn harness(preset: Preset) -> Harness {
        let paper = Arc::new(PaperExchangeClient::new(
            "USDT",
            preset.engine.paper_starting_balance,
        ));
        paper.set_markets(vec!["BTCUSDT".to_string()]);
        paper.set_ticker(ticker("BTCUSDT", 50_300.0));
        paper.set_candles("BTCUSDT", "5m", breakout_candles());
        paper.set_candles("BTCUSDT", "15m", breakout_candles());
        paper.set_order_book("BTCUSDT", liquid_book(50_300.0));

        let events = Arc::new(EventLog::new(500));
        let checkpoints = Arc::new(CheckpointLog::new(500));
        let state_machine = Arc::new(StateMachine::new(EnginePhase::Scanning, events.clone()));
        let error_handler = Arc::new(ErrorHandler::new(events.clone()));
        let cache = Arc::new(MarketDataCache::new(100, 300));

        let scanning = Arc::new(ScanningManager::new(
            &preset,
            paper.clone(),
            cache,
            checkpoints.clone(),
            None,
            None,
        ));
        let signals = Arc::new(SignalManager::new(&preset, None, None).unwrap());
        let kill_switch = Arc::new(KillSwitch::new());
        let risk = Arc::new(RiskManager::new(preset.risk.clone(), kill_switch.clone()));
        let execution = Arc::new(ExecutionManager::new(
            paper.clone(),
            ExecutionConfig {
                twap_interval_seconds: 0.001,
                ..preset.execution.clone()
            },
            error_handler.clone(),
        ));
        let positions = Arc::new(PositionBook::new());
        let health = Arc::new(HealthMonitor::new(
            preset.risk.clone(),
            preset.engine.paper_starting_balance,
            kill_switch.clone(),
            events.clone(),
        ));
        let resources = Arc::new(ResourceMonitor::new());
        let stop = Arc::new(Notify::new());

        let orchestrator = TradingOrchestrator::new(
            preset,
            state_machine.clone(),
            error_handler,
            scanning,
            signals,
            risk,
            execution,
            positions.clone(),
            health,
            resources,
            checkpoints.clone(),
            events.clone(),
            paper.clone(),
            stop,
        );

        Harness {
            orchestrator,
            paper,
            state_machine,
            positions,
            events,
            checkpoints,
            kill_switch,
        }
    }

    async fn drive_to_open_position(h: &Harness) {
        assert!(!h.orchestrator.run_health_checks(EnginePhase::Scanning).await);
        h.orchestrator.handle_scanning().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::LevelBuilding);

        h.orchestrator.handle_level_building().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::SignalWait);

        h.orchestrator.handle_signal_wait().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Sizing);

        h.orchestrator.handle_sizing().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Execution);

        h.orchestrator.handle_execution().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Managing);
    }

    #[tokio::test]
    async fn full_cycle_opens_a_position() {
        let h = harness(Preset::default());
        drive_to_open_position(&h).await;

        let open = h.positions.open_positions();
        assert_eq!(open.len(), 1);
        let position = &open[0];
        assert_eq!(position.symbol, "BTCUSDT");
        assert_eq!(position.side, Side::Long);
        assert!(position.qty > 0.0);
        assert!(position.stop_loss < position.entry);
        assert!(position.take_profit.unwrap() > position.entry);

        // quantity = equity * 1% / stop distance
        let expected_risk = 10_000.0 * 0.01;
        let stop_distance = position.meta.stop_distance;
        assert!(
            (position.qty * stop_distance - expected_risk).abs() / expected_risk < 0.05,
            "qty {} stop_distance {stop_distance}",
            position.qty
        );

        assert!(h.checkpoints.count_of(CheckpointType::PositionOpened) == 1);
        assert!(h.checkpoints.count_of(CheckpointType::SignalDetected) >= 1);
    }

    #[tokio::test]
    async fn managing_ratchets_stop_and_realises_rungs() {
        let h = harness(Preset::default());
        drive_to_open_position(&h).await;
        let position = h.positions.open_positions().pop().unwrap();
        let entry = position.entry;
        let initial_stop = position.stop_loss;
        let risk = entry - initial_stop;

        // Age the position past entry confirmation.
        h.positions.with_open_mut(&position.id, |p| {
            p.opened_at -= 3 * BAR_MS;
        });

        // Pass 1 at the entry price: confirmation only.
        h.orchestrator.manage_position(&position).await.unwrap();

        // Move the market to 2R and drop the cache so the next passes see a
        // fresh snapshot. Breakeven engages, then trailing; the 1R and 2R
        // rungs realise along the way.
        let two_r = entry + risk * 2.0;
        h.paper.set_ticker(ticker("BTCUSDT", two_r));
        h.orchestrator.scanning.shrink();

        for _ in 0..3 {
            let Some(current) = h.positions.open_positions().pop() else {
                break;
            };
            h.orchestrator.manage_position(&current).await.unwrap();
            h.orchestrator.scanning.shrink();
        }

        let current = h
            .positions
            .open_positions()
            .pop()
            .expect("a partial position remains open");
        assert!(current.stop_loss > initial_stop, "stop should ratchet up");
        assert!(!current.meta.tp_levels_hit.is_empty(), "TP rungs should realise");
        assert!(current.meta.remaining_size_pct < 100.0);

        let events = h.events.events();
        let stop_moves = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::StopMoved { .. }))
            .count();
        assert!(stop_moves >= 1, "expected a stop move event");
        let tp_events = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::TakeProfit { .. }))
            .count();
        assert!(tp_events >= 1, "expected a take-profit event");
    }

    #[tokio::test]
    async fn kill_switch_pauses_and_rejects() {
        let h = harness(Preset::default());

        // Trip the kill switch via a catastrophic daily loss: fake a closed
        // losing position.
        let loser = Position::open(
            "BTCUSDT",
            Side::Long,
            crate::types::StrategyKind::Momentum,
            1.0,
            50_000.0,
            49_000.0,
            None,
            0.0,
            None,
        );
        let id = loser.id.clone();
        h.positions.insert(loser);
        h.positions.with_open_mut(&id, |p| {
            p.close(48_500.0, "test loss", 0.0);
        });

        // -1 500 on a 10 000 base is past the 10% kill limit.
        let restarted = h.orchestrator.run_health_checks(EnginePhase::Scanning).await;
        assert!(restarted);
        assert_eq!(h.state_machine.current(), EnginePhase::Paused);
        assert!(h.kill_switch.is_active());

        // All signals are now rejected at the risk gate.
        let sized = h.orchestrator.risk.evaluate(
            &crate::signals::Signal {
                id: "s".into(),
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                strategy: crate::types::StrategyKind::Momentum,
                entry: 50_000.0,
                stop_loss: 49_000.0,
                take_profits: vec![51_000.0],
                confidence: 0.9,
                reason: "t".into(),
                created_ts: now_ms(),
                executed_ts: None,
                status: crate::signals::SignalStatus::Active,
                correlation_id: "c".into(),
                meta: Default::default(),
            },
            10_000.0,
            &[],
            &[],
        );
        assert!(!sized.approved);

        let kill_events = h
            .events
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::KillSwitch { .. }))
            .count();
        assert!(kill_events >= 1);
    }

    #[tokio::test]
    async fn signal_wait_prefers_managing_with_open_positions() {
        let h = harness(Preset::default());
        h.positions.insert(Position::open(
            "ETHUSDT",
            Side::Long,
            crate::types::StrategyKind::Momentum,
            1.0,
            3_000.0,
            2_900.0,
            None,
            0.0,
            None,
        ));

        h.orchestrator.handle_signal_wait().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Managing);
    }

    #[tokio::test]
    async fn empty_scan_stays_in_scanning() {
        let h = harness(Preset::default());
        h.paper.set_markets(Vec::new());

        h.orchestrator.handle_scanning().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Scanning);
    }

    #[tokio::test]
    async fn error_phase_recovers_to_scanning() {
        let h = harness(Preset::default());
        h.state_machine
            .transition_to(EnginePhase::Error, "test", None, true)
            .await;

        h.orchestrator.handle_error_phase().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Scanning);
    }

    #[tokio::test]
    async fn error_retries_exhaust_to_emergency() {
        let h = harness(Preset::default());
        h.state_machine
            .transition_to(EnginePhase::Error, "test", None, true)
            .await;
        h.orchestrator.error_attempts.store(10, Ordering::Relaxed);

        h.orchestrator.handle_error_phase().await.unwrap();
        assert_eq!(h.state_machine.current(), EnginePhase::Emergency);
        assert!(h.state_machine.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_event_preempts_pacing() {
        let h = harness(Preset::default());
        let stop = h.orchestrator.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.notify_waiters();
        });

        // The hour-long pacing sleep must return early once the stop fires.
        assert!(
            h.orchestrator.interruptible_sleep(Duration::from_secs(3600)).await,
            "stop event should interrupt the sleep"
        );
    }

    #[test]
    fn pacing_table() {
        use EnginePhase::*;
        assert_eq!(pacing(Scanning, false), Duration::from_secs(5));
        assert_eq!(pacing(SignalWait, false), Duration::from_secs(2));
        assert_eq!(pacing(Managing, false), Duration::from_secs(1));
        assert_eq!(pacing(Paused, false), Duration::from_millis(500));
        assert_eq!(pacing(Execution, false), Duration::from_millis(100));
        assert_eq!(pacing(Execution, true), Duration::from_millis(100));
        assert_eq!(pacing(LevelBuilding, true), Duration::ZERO);
        assert_eq!(pacing(Sizing, true), Duration::ZERO);
    }
}

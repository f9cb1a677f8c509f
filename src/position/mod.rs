// =============================================================================
// Position model and Position Book
// =============================================================================
//
// A `Position` carries its own PnL arithmetic and enforces the structural
// invariant that a fully-exhausted position (`qty == 0`) is `Closed`. The
// `PositionBook` owns the open/closed lists behind a lock and hands out
// clones; per-position mutation happens through `with_open_mut` so the lock
// scope stays tight.
// =============================================================================

pub mod fsm;

pub use fsm::{PhaseChange, PositionPhase, PositionSnapshot, PositionStateMachine};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::execution::Order;
use crate::types::{now_ms, Side, StrategyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One recorded stop-loss move.
#[derive(Debug, Clone, Serialize)]
pub struct StopUpdate {
    pub ts_ms: i64,
    pub old_stop: f64,
    pub new_stop: f64,
    pub reason: String,
}

/// Slow-changing position attachments.
#[derive(Debug, Clone, Serialize)]
pub struct PositionMeta {
    pub initial_qty: f64,
    /// Distance from entry to the initial stop.
    pub stop_distance: f64,
    pub realized_pnl_usd: f64,
    /// Indices of take-profit rungs already realised.
    pub tp_levels_hit: Vec<usize>,
    /// Percentage of the initial size still open (0-100).
    pub remaining_size_pct: f64,
    pub exit_reason: Option<String>,
    pub entry_order: Option<Order>,
    pub exit_order: Option<Order>,
}

/// A live or historical position.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub strategy: StrategyKind,
    /// Remaining open quantity; zero exactly when closed.
    pub qty: f64,
    pub entry: f64,
    pub stop_loss: f64,
    /// Next take-profit price, if any rungs remain.
    pub take_profit: Option<f64>,
    pub status: PositionStatus,
    pub pnl_usd: f64,
    pub pnl_r: f64,
    pub fees_usd: f64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub stop_updates: Vec<StopUpdate>,
    pub meta: PositionMeta,
}

impl Position {
    /// Open a position from a filled entry order.
    pub fn open(
        symbol: &str,
        side: Side,
        strategy: StrategyKind,
        qty: f64,
        entry: f64,
        stop_loss: f64,
        take_profit: Option<f64>,
        fees_usd: f64,
        entry_order: Option<Order>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        info!(
            id = %id,
            symbol,
            side = %side,
            strategy = %strategy,
            qty,
            entry,
            stop_loss,
            "position opened"
        );

        Self {
            id,
            symbol: symbol.to_string(),
            side,
            strategy,
            qty,
            entry,
            stop_loss,
            take_profit,
            status: PositionStatus::Open,
            pnl_usd: 0.0,
            pnl_r: 0.0,
            fees_usd,
            opened_at: now_ms(),
            closed_at: None,
            stop_updates: Vec::new(),
            meta: PositionMeta {
                initial_qty: qty,
                stop_distance: (entry - stop_loss).abs(),
                realized_pnl_usd: 0.0,
                tp_levels_hit: Vec::new(),
                remaining_size_pct: 100.0,
                exit_reason: None,
                entry_order,
                exit_order: None,
            },
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Recompute unrealised PnL in USD and R for `current_price`.
    pub fn update_pnl(&mut self, current_price: f64) {
        let diff = self.side.direction() * (current_price - self.entry);
        self.pnl_usd = diff * self.qty;

        let risk = self.meta.stop_distance;
        self.pnl_r = if risk > 0.0 { diff / risk } else { 0.0 };
    }

    /// Apply a ratcheted stop move.
    pub fn move_stop(&mut self, new_stop: f64, reason: &str) {
        let old = self.stop_loss;
        self.stop_updates.push(StopUpdate {
            ts_ms: now_ms(),
            old_stop: old,
            new_stop,
            reason: reason.to_string(),
        });
        self.stop_loss = new_stop;
        debug!(id = %self.id, old_stop = old, new_stop, reason, "stop moved");
    }

    /// Whether the current price violates the stop.
    pub fn stop_violated(&self, current_price: f64) -> bool {
        match self.side {
            Side::Long => current_price <= self.stop_loss,
            Side::Short => current_price >= self.stop_loss,
        }
    }

    /// Realise a partial close of `qty_closed` at `price` for TP rung
    /// `level_index`. Returns the realised PnL of the slice. Closes the
    /// position outright when nothing remains.
    pub fn apply_partial_close(
        &mut self,
        qty_closed: f64,
        price: f64,
        level_index: usize,
        fees_usd: f64,
    ) -> f64 {
        let qty_closed = qty_closed.min(self.qty);
        let realized = self.side.direction() * (price - self.entry) * qty_closed;

        self.qty -= qty_closed;
        self.fees_usd += fees_usd;
        self.meta.realized_pnl_usd += realized;
        if !self.meta.tp_levels_hit.contains(&level_index) {
            self.meta.tp_levels_hit.push(level_index);
        }
        self.meta.remaining_size_pct = if self.meta.initial_qty > 0.0 {
            self.qty / self.meta.initial_qty * 100.0
        } else {
            0.0
        };

        info!(
            id = %self.id,
            level_index,
            qty_closed,
            remaining = self.qty,
            realized,
            "partial take-profit"
        );

        if self.qty <= f64::EPSILON {
            self.finalise(price, "take-profit ladder exhausted");
        }
        realized
    }

    /// Fully close at `price`.
    pub fn close(&mut self, price: f64, reason: &str, fees_usd: f64) -> f64 {
        let realized = self.side.direction() * (price - self.entry) * self.qty;
        self.meta.realized_pnl_usd += realized;
        self.fees_usd += fees_usd;
        self.qty = 0.0;
        self.finalise(price, reason);
        realized
    }

    fn finalise(&mut self, price: f64, reason: &str) {
        self.qty = 0.0;
        self.status = PositionStatus::Closed;
        self.closed_at = Some(now_ms());
        self.meta.exit_reason = Some(reason.to_string());
        self.meta.remaining_size_pct = 0.0;
        self.pnl_usd = 0.0;
        self.pnl_r = 0.0;
        info!(
            id = %self.id,
            price,
            reason,
            realized = self.meta.realized_pnl_usd,
            fees = self.fees_usd,
            "position fully closed"
        );
    }

    /// Net realised result including fees.
    pub fn net_realized_usd(&self) -> f64 {
        self.meta.realized_pnl_usd - self.fees_usd
    }
}

// =============================================================================
// Position Book
// =============================================================================

/// Thread-safe owner of the open and closed position lists.
pub struct PositionBook {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, position: Position) {
        self.open.write().push(position);
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    pub fn closed_positions(&self, limit: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(limit).cloned().collect()
    }

    /// Mutate one open position in place. Returns `false` when the id is not
    /// open. If the mutation closes the position it migrates to the closed
    /// list.
    pub fn with_open_mut<F: FnOnce(&mut Position)>(&self, id: &str, f: F) -> bool {
        let mut open = self.open.write();
        let Some(idx) = open.iter().position(|p| p.id == id) else {
            return false;
        };
        f(&mut open[idx]);

        if !open[idx].is_open() {
            let closed = open.remove(idx);
            drop(open);
            self.closed.write().push(closed);
        }
        true
    }

    /// Sum of net realised PnL for positions closed at or after `since_ms`.
    pub fn realized_pnl_since(&self, since_ms: i64) -> f64 {
        self.closed
            .read()
            .iter()
            .filter(|p| p.closed_at.is_some_and(|ts| ts >= since_ms))
            .map(|p| p.net_realized_usd())
            .sum()
    }

    /// Consecutive losing trades counted backwards from the latest close.
    pub fn consecutive_losses(&self) -> u32 {
        let closed = self.closed.read();
        let mut count = 0;
        for position in closed.iter().rev() {
            if position.net_realized_usd() < 0.0 {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Unrealised PnL across open positions.
    pub fn open_pnl_usd(&self) -> f64 {
        self.open.read().iter().map(|p| p.pnl_usd).sum()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position() -> Position {
        Position::open(
            "BTCUSDT",
            Side::Long,
            StrategyKind::Momentum,
            1.0,
            50_000.0,
            49_000.0,
            Some(51_000.0),
            5.0,
            None,
        )
    }

    #[test]
    fn pnl_in_usd_and_r() {
        let mut position = long_position();
        position.update_pnl(51_500.0);
        assert!((position.pnl_usd - 1_500.0).abs() < 1e-9);
        assert!((position.pnl_r - 1.5).abs() < 1e-9);

        position.update_pnl(49_500.0);
        assert!((position.pnl_usd + 500.0).abs() < 1e-9);
        assert!((position.pnl_r + 0.5).abs() < 1e-9);
    }

    #[test]
    fn stop_violation_by_side() {
        let mut long = long_position();
        assert!(!long.stop_violated(49_500.0));
        assert!(long.stop_violated(49_000.0));
        assert!(long.stop_violated(48_000.0));

        long.side = Side::Short;
        long.stop_loss = 51_000.0;
        assert!(!long.stop_violated(50_500.0));
        assert!(long.stop_violated(51_200.0));
    }

    #[test]
    fn partial_close_tracks_remaining() {
        let mut position = long_position();
        let realized = position.apply_partial_close(0.5, 51_000.0, 0, 1.0);

        assert!((realized - 500.0).abs() < 1e-9);
        assert!((position.qty - 0.5).abs() < 1e-9);
        assert_eq!(position.meta.tp_levels_hit, vec![0]);
        assert!((position.meta.remaining_size_pct - 50.0).abs() < 1e-9);
        assert!(position.is_open());
    }

    #[test]
    fn exhausting_qty_closes_position() {
        let mut position = long_position();
        position.apply_partial_close(0.5, 51_000.0, 0, 0.0);
        position.apply_partial_close(0.5, 52_000.0, 1, 0.0);

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.qty, 0.0);
        assert!((position.meta.remaining_size_pct).abs() < 1e-9);
        assert!((position.meta.realized_pnl_usd - 1_500.0).abs() < 1e-9);
        assert!(position.closed_at.is_some());
    }

    #[test]
    fn closed_position_has_zero_qty_invariant() {
        let mut position = long_position();
        position.close(49_000.0, "stop violated", 2.0);

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.qty, 0.0);
        assert_eq!(position.meta.exit_reason.as_deref(), Some("stop violated"));
        assert!((position.meta.realized_pnl_usd + 1_000.0).abs() < 1e-9);
        // -1000 pnl - 5 open fees - 2 close fees
        assert!((position.net_realized_usd() + 1_007.0).abs() < 1e-9);
    }

    #[test]
    fn book_moves_closed_positions() {
        let book = PositionBook::new();
        let position = long_position();
        let id = position.id.clone();
        book.insert(position);

        assert_eq!(book.open_count(), 1);
        assert!(book.with_open_mut(&id, |p| {
            p.close(51_000.0, "manual", 0.0);
        }));

        assert_eq!(book.open_count(), 0);
        assert_eq!(book.closed_positions(10).len(), 1);
        assert!(!book.with_open_mut(&id, |_| {}));
    }

    #[test]
    fn consecutive_losses_counted_from_latest() {
        let book = PositionBook::new();
        for pnl_price in [51_000.0, 49_000.0, 48_900.0] {
            let position = long_position();
            let id = position.id.clone();
            book.insert(position);
            book.with_open_mut(&id, |p| {
                p.close(pnl_price, "test", 0.0);
            });
        }

        // Latest two closes were losses.
        assert_eq!(book.consecutive_losses(), 2);
    }

    #[test]
    fn stop_moves_are_recorded() {
        let mut position = long_position();
        position.move_stop(50_025.0, "breakeven");
        position.move_stop(51_000.0, "trailing");

        assert_eq!(position.stop_updates.len(), 2);
        assert!((position.stop_loss - 51_000.0).abs() < 1e-9);
        assert!((position.stop_updates[0].old_stop - 49_000.0).abs() < 1e-9);
    }
}

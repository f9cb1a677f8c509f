// =============================================================================
// Execution Manager — TWAP/iceberg slicing with a deadman timer
// =============================================================================
//
// An intended trade is split into child orders when its notional warrants it:
//
//   * TWAP — when `enable_twap` and the notional exceeds the threshold, the
//     quantity splits into N time-spaced slices, N chosen so each slice's
//     displayed notional stays below `max_depth_fraction` of the book depth
//     at the limit offset, clamped to [twap_min_slices, twap_max_slices].
//   * Iceberg — when `enable_iceberg` and the notional is large enough, each
//     slice posts as a passive limit order at mid +/- `limit_offset_bps`;
//     otherwise slices cross as market orders.
//
// A deadman timer bounds the whole plan: when it fires, outstanding resting
// slices are cancelled and the aggregate order reports whatever filled.
// Per-slice failures classify through the central error handler and never
// abort the remaining slices on their own.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::error_handler::ErrorHandler;
use crate::exchange::{ExchangeClient, OrderAck, OrderRequest};
use crate::types::{now_ms, OrderIntent, OrderSide, OrderStatus, OrderType};

/// Aggregate order returned to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub exchange_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: Option<f64>,
    pub fees_usd: f64,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub intent: OrderIntent,
    pub metadata: serde_json::Value,
}

/// Outcome of one slice, kept in the aggregate's metadata.
#[derive(Debug, Clone, Serialize)]
struct SliceOutcome {
    index: usize,
    qty: f64,
    status: &'static str,
    filled_qty: f64,
}

/// Routes sized trades to the exchange.
pub struct ExecutionManager {
    client: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    error_handler: Arc<ErrorHandler>,
}

impl ExecutionManager {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
        error_handler: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            client,
            config,
            error_handler,
        }
    }

    /// Execute an intended trade of `total_qty` at roughly `reference_price`.
    ///
    /// Always returns an aggregate order; a fully-rejected trade comes back
    /// with `filled_qty == 0` and the broker reason in the metadata.
    pub async fn execute_trade(
        &self,
        symbol: &str,
        side: OrderSide,
        total_qty: f64,
        reference_price: f64,
        intent: OrderIntent,
    ) -> Order {
        let notional = total_qty * reference_price;
        info!(
            symbol,
            side = %side,
            total_qty,
            notional,
            intent = ?intent,
            "execution plan starting"
        );

        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            exchange_id: None,
            symbol: symbol.to_string(),
            side,
            qty: total_qty,
            price: None,
            order_type: OrderType::Market,
            status: OrderStatus::Pending,
            filled_qty: 0.0,
            avg_fill_price: None,
            fees_usd: 0.0,
            created_ts: now_ms(),
            updated_ts: now_ms(),
            intent,
            metadata: serde_json::Value::Null,
        };

        if total_qty <= 0.0 || reference_price <= 0.0 {
            order.status = OrderStatus::Rejected;
            order.metadata = serde_json::json!({ "reason": "degenerate quantity or price" });
            return order;
        }

        // Book context for slice sizing and passive pricing.
        let book = match self.client.fetch_order_book(symbol).await {
            Ok(book) => Some(book),
            Err(e) => {
                self.error_handler.handle(&e, "execution", "fetch_order_book", 0);
                None
            }
        };
        let mid = book.as_ref().and_then(|b| b.mid()).unwrap_or(reference_price);
        let spread_bps = book.as_ref().and_then(|b| b.spread_bps()).unwrap_or(0.0);

        let slice_qtys = self.plan_slices(total_qty, notional, book.as_ref(), side);

        // Iceberg slices post passively unless the spread has blown out.
        let use_limit = self.config.enable_iceberg
            && notional >= self.config.iceberg_min_notional_usd
            && spread_bps <= self.config.spread_widen_bps;
        let limit_price = if use_limit {
            let offset = mid * self.config.limit_offset_bps / 10_000.0;
            Some(match side {
                OrderSide::Buy => mid - offset,
                OrderSide::Sell => mid + offset,
            })
        } else {
            None
        };
        order.order_type = if use_limit { OrderType::Limit } else { OrderType::Market };
        order.price = limit_price;

        debug!(
            slices = slice_qtys.len(),
            order_type = ?order.order_type,
            limit_price,
            "slice plan built"
        );

        // Release slices against the deadman deadline.
        let deadline = Instant::now() + Duration::from_millis(self.config.deadman_timeout_ms);
        let interval = Duration::from_secs_f64(self.config.twap_interval_seconds);

        let mut outcomes: Vec<SliceOutcome> = Vec::with_capacity(slice_qtys.len());
        let mut resting: Vec<String> = Vec::new();
        let mut weighted_fill = 0.0;
        let mut reject_reason: Option<String> = None;
        let mut deadman_fired = false;

        for (index, slice_qty) in slice_qtys.iter().copied().enumerate() {
            if Instant::now() >= deadline {
                deadman_fired = true;
                break;
            }

            let request = OrderRequest {
                symbol: symbol.to_string(),
                side,
                order_type: order.order_type,
                qty: slice_qty,
                price: limit_price,
                reduce_only: intent.is_reduce_only(),
                client_order_id: format!("{}-{}", order.id, index),
            };

            match self.client.create_order(request).await {
                Ok(ack) => {
                    self.error_handler.record_success("execution", "create_order");
                    self.absorb_ack(
                        &ack,
                        slice_qty,
                        index,
                        &mut order,
                        &mut outcomes,
                        &mut resting,
                        &mut weighted_fill,
                        &mut reject_reason,
                    );
                }
                Err(e) => {
                    self.error_handler.handle(&e, "execution", "create_order", 0);
                    outcomes.push(SliceOutcome {
                        index,
                        qty: slice_qty,
                        status: "error",
                        filled_qty: 0.0,
                    });
                }
            }

            // Space the next release, but never sleep past the deadline.
            if index + 1 < slice_qtys.len() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    deadman_fired = true;
                    break;
                }
                tokio::time::sleep(interval.min(remaining)).await;
            }
        }

        // The deadman cancels anything still resting.
        if !resting.is_empty() {
            deadman_fired = deadman_fired || Instant::now() >= deadline;
            for exchange_id in &resting {
                if let Err(e) = self.client.cancel_order(exchange_id, symbol).await {
                    self.error_handler.handle(&e, "execution", "cancel_order", 0);
                }
            }
            warn!(cancelled = resting.len(), "outstanding slices cancelled");
        }

        let planned = slice_qtys.len();
        let released = outcomes.len();
        if deadman_fired {
            warn!(
                released,
                planned,
                filled = order.filled_qty,
                "deadman timer cut the slice plan short"
            );
        }

        order.avg_fill_price = if order.filled_qty > 0.0 {
            Some(weighted_fill / order.filled_qty)
        } else {
            None
        };
        order.status = if order.filled_qty >= total_qty - f64::EPSILON {
            OrderStatus::Filled
        } else if order.filled_qty > 0.0 {
            OrderStatus::Partial
        } else if reject_reason.is_some() {
            OrderStatus::Rejected
        } else {
            OrderStatus::Cancelled
        };
        order.updated_ts = now_ms();
        order.metadata = serde_json::json!({
            "slices_planned": planned,
            "slices_released": released,
            "deadman_fired": deadman_fired,
            "cancelled_resting": resting.len(),
            "reject_reason": reject_reason,
            "outcomes": outcomes,
        });

        info!(
            symbol,
            status = ?order.status,
            filled = order.filled_qty,
            avg_price = order.avg_fill_price,
            fees = order.fees_usd,
            "execution plan finished"
        );

        order
    }

    /// Split `total_qty` into slice quantities per the TWAP policy.
    fn plan_slices(
        &self,
        total_qty: f64,
        notional: f64,
        book: Option<&crate::exchange::OrderBook>,
        side: OrderSide,
    ) -> Vec<f64> {
        if !self.config.enable_twap || notional <= self.config.twap_notional_threshold_usd {
            return vec![total_qty];
        }

        // Depth the order would interact with: buys consume asks.
        let book_depth = book
            .map(|b| b.depth_usd_within(0.3, opposite(side)))
            .filter(|d| *d > 0.0);

        let n = match book_depth {
            Some(depth) => {
                let per_slice_cap = depth * self.config.max_depth_fraction;
                if per_slice_cap > 0.0 {
                    (notional / per_slice_cap).ceil() as usize
                } else {
                    self.config.twap_max_slices
                }
            }
            None => self.config.twap_min_slices,
        };

        let n = n.clamp(self.config.twap_min_slices, self.config.twap_max_slices);
        let per_slice = total_qty / n as f64;
        vec![per_slice; n]
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb_ack(
        &self,
        ack: &OrderAck,
        slice_qty: f64,
        index: usize,
        order: &mut Order,
        outcomes: &mut Vec<SliceOutcome>,
        resting: &mut Vec<String>,
        weighted_fill: &mut f64,
        reject_reason: &mut Option<String>,
    ) {
        if order.exchange_id.is_none() && !ack.exchange_id.is_empty() {
            order.exchange_id = Some(ack.exchange_id.clone());
        }

        match ack.status {
            OrderStatus::Filled | OrderStatus::Partial => {
                let price = ack.avg_fill_price.unwrap_or(order.price.unwrap_or(0.0));
                let fill_notional = ack.filled_qty * price;
                order.filled_qty += ack.filled_qty;
                *weighted_fill += fill_notional;

                // Maker fee for passive slices, taker otherwise.
                let fee_bps = match order.order_type {
                    OrderType::Limit => self.config.maker_fee_bps,
                    OrderType::Market => self.config.taker_fee_bps,
                };
                order.fees_usd += fill_notional * fee_bps / 10_000.0;

                outcomes.push(SliceOutcome {
                    index,
                    qty: slice_qty,
                    status: "filled",
                    filled_qty: ack.filled_qty,
                });
            }
            OrderStatus::Open | OrderStatus::Pending => {
                resting.push(ack.exchange_id.clone());
                outcomes.push(SliceOutcome {
                    index,
                    qty: slice_qty,
                    status: "resting",
                    filled_qty: 0.0,
                });
            }
            OrderStatus::Rejected => {
                *reject_reason = Some(format!("slice {index} rejected by broker"));
                outcomes.push(SliceOutcome {
                    index,
                    qty: slice_qty,
                    status: "rejected",
                    filled_qty: 0.0,
                });
            }
            OrderStatus::Cancelled => {
                outcomes.push(SliceOutcome {
                    index,
                    qty: slice_qty,
                    status: "cancelled",
                    filled_qty: 0.0,
                });
            }
        }
    }
}

fn opposite(side: OrderSide) -> OrderSide {
    match side {
        OrderSide::Buy => OrderSide::Sell,
        OrderSide::Sell => OrderSide::Buy,
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("enable_twap", &self.config.enable_twap)
            .field("enable_iceberg", &self.config.enable_iceberg)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

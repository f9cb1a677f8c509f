// =============================================================================
// Microstructure trackers — live trade and depth aggregation
// =============================================================================
//
// Top-ranked scan candidates are subscribed to trade and depth WebSocket
// streams. The aggregates produced here (trades-per-minute, activity decay,
// order-book imbalance, liquidity density zones) feed the signal filters and
// the take-profit optimizer. All trackers degrade gracefully: a symbol with
// no stream simply reports `None` and the filters treat it as "no data".

pub mod orderbook;
pub mod trades;

pub use orderbook::{DensityInfo, OrderBookTracker};
pub use trades::{ActivityMetrics, TradesAggregator};

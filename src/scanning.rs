// =============================================================================
// Scanning Manager — universe fetch, market-data fan-out, candidate scan
// =============================================================================
//
// One scanning cycle:
//
//   1. Fetch the symbol universe, intersect with the optional whitelist, and
//      truncate to the configured fetch limit.
//   2. Fan out market-data snapshots with bounded concurrency under a single
//      wall-clock timeout. Partial results on timeout are acceptable.
//   3. Update the cache.
//   4. Run the breakout scanner, handing it the BTC snapshot for correlation.
//   5. Subscribe the top candidates to trade/depth streams when trackers are
//      attached; a subscription failure never aborts the cycle.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Preset;
use crate::error_handler::EngineError;
use crate::exchange::ExchangeClient;
use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::calculate_bb_width_pct;
use crate::market_data::{L2Depth, MarketData, MarketDataCache};
use crate::microstructure::{OrderBookTracker, TradesAggregator};
use crate::monitoring::{
    CheckpointLog, CheckpointStatus, CheckpointType, MonitoringSink,
};
use crate::scanner::{BreakoutScanner, ScanResult, ScannerSnapshot};
use crate::types::{now_ms, OrderSide};

/// Symbols recognised as the BTC reference, in lookup order.
const BTC_REFERENCE_SYMBOLS: &[&str] = &["BTCUSDT", "BTC/USDT:USDT", "BTC/USDT"];

/// Candidates subscribed to live streams after a scan.
const STREAM_SUBSCRIPTION_CAP: usize = 20;

/// ATR period used for snapshot volatility metrics.
const ATR_PERIOD: usize = 14;

/// Coordinates one market scan end to end.
pub struct ScanningManager {
    scanner: BreakoutScanner,
    client: Arc<dyn ExchangeClient>,
    cache: Arc<MarketDataCache>,
    monitoring: Arc<dyn MonitoringSink>,
    preset: Preset,
    trades: Option<Arc<TradesAggregator>>,
    books: Option<Arc<OrderBookTracker>>,
    last_results: RwLock<Vec<ScanResult>>,
}

impl ScanningManager {
    pub fn new(
        preset: &Preset,
        client: Arc<dyn ExchangeClient>,
        cache: Arc<MarketDataCache>,
        monitoring: Arc<dyn MonitoringSink>,
        trades: Option<Arc<TradesAggregator>>,
        books: Option<Arc<OrderBookTracker>>,
    ) -> Self {
        Self {
            scanner: BreakoutScanner::new(preset.scanner.clone(), preset.levels.clone()),
            client,
            cache,
            monitoring,
            preset: preset.clone(),
            trades,
            books,
            last_results: RwLock::new(Vec::new()),
        }
    }

    /// Run one full market scan.
    pub async fn scan_markets(&self, session_id: &str) -> Result<Vec<ScanResult>> {
        CheckpointLog::record(
            self.monitoring.as_ref(),
            CheckpointType::ScanStart,
            CheckpointStatus::InProgress,
            "starting market scan",
            session_id,
        );

        let symbols = self.universe().await?;
        info!(count = symbols.len(), "scanning universe selected");

        let market_data = self.fetch_market_data(&symbols).await;
        for data in market_data.values() {
            self.cache.insert(data.clone());
        }

        let btc = BTC_REFERENCE_SYMBOLS
            .iter()
            .find_map(|sym| market_data.get(*sym));

        let snapshots: Vec<MarketData> = market_data.values().cloned().collect();
        let results = self.scanner.scan(&snapshots, btc);

        self.subscribe_candidates(&results);

        self.monitoring.checkpoint(crate::monitoring::Checkpoint {
            kind: CheckpointType::ScanComplete,
            status: CheckpointStatus::Completed,
            message: format!("scan found {} candidates", results.len()),
            session_id: session_id.to_string(),
            ts_ms: now_ms(),
            metrics: Some(serde_json::json!({
                "universe": symbols.len(),
                "snapshots": snapshots.len(),
                "candidates": results.len(),
            })),
        });

        *self.last_results.write() = results.clone();
        Ok(results)
    }

    /// Latest scan results for the signal phase.
    pub fn last_results(&self) -> Vec<ScanResult> {
        self.last_results.read().clone()
    }

    pub fn diagnostics(&self) -> ScannerSnapshot {
        self.scanner.snapshot()
    }

    /// Record how many signals the last scan produced, for diagnostics.
    pub fn note_signal_count(&self, count: usize) {
        self.scanner.note_signal_count(count);
    }

    /// Drop cached market data (resource-pressure optimization pass).
    pub fn shrink(&self) {
        self.cache.clear();
        let mut results = self.last_results.write();
        results.shrink_to_fit();
    }

    /// Build one market-data snapshot for `symbol`. Exposed for the position
    /// refresh during the managing phase.
    pub async fn snapshot_symbol(&self, symbol: &str) -> Result<MarketData> {
        let data = self.build_market_data(symbol.to_string()).await?;
        self.cache.insert(data.clone());
        Ok(data)
    }

    pub fn cached(&self, symbol: &str) -> Option<MarketData> {
        self.cache.get_fresh(symbol)
    }

    // -------------------------------------------------------------------------
    // Universe
    // -------------------------------------------------------------------------

    async fn universe(&self) -> Result<Vec<String>> {
        let all = self.client.fetch_markets().await?;
        let total = all.len();

        let mut symbols = match &self.preset.scanner.symbols_whitelist {
            Some(whitelist) => all
                .into_iter()
                .filter(|s| whitelist.iter().any(|w| w == s))
                .collect(),
            None => all,
        };

        let limit = self.preset.engine.market_fetch_limit;
        if limit > 0 && symbols.len() > limit {
            symbols.truncate(limit);
        }

        debug!(total, selected = symbols.len(), "universe filtered");
        Ok(symbols)
    }

    // -------------------------------------------------------------------------
    // Market-data fan-out
    // -------------------------------------------------------------------------

    /// Fetch snapshots for every symbol with bounded concurrency under one
    /// wall-clock timeout. Partial results survive the timeout.
    async fn fetch_market_data(&self, symbols: &[String]) -> HashMap<String, MarketData> {
        let total_timeout = Duration::from_secs(self.preset.engine.market_data_timeout_secs);
        let concurrency = self.preset.engine.scan_concurrency.max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));

        let mut join_set = JoinSet::new();
        for symbol in symbols {
            let symbol = symbol.clone();
            let semaphore = semaphore.clone();
            let this = self.clone_for_fetch();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = this.build_market_data(symbol.clone()).await;
                (symbol, result)
            });
        }

        let mut collected = HashMap::new();
        let deadline = tokio::time::Instant::now() + total_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                let outstanding = join_set.len();
                join_set.abort_all();
                warn!(
                    collected = collected.len(),
                    outstanding, "market data fetch timed out, using partial results"
                );
                break;
            }

            match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(Some(Ok((symbol, Ok(data))))) => {
                    collected.insert(symbol, data);
                }
                Ok(Some(Ok((symbol, Err(e))))) => {
                    debug!(symbol = %symbol, error = %e, "snapshot fetch failed");
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "snapshot task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    let outstanding = join_set.len();
                    join_set.abort_all();
                    warn!(
                        collected = collected.len(),
                        outstanding, "market data fetch timed out, using partial results"
                    );
                    break;
                }
            }
        }

        info!(snapshots = collected.len(), requested = symbols.len(), "market data collected");
        collected
    }

    /// The subset of state a fetch task needs.
    fn clone_for_fetch(&self) -> FetchContext {
        FetchContext {
            client: self.client.clone(),
            lookback: self.preset.levels.lookback_candles,
        }
    }

    async fn build_market_data(&self, symbol: String) -> Result<MarketData> {
        self.clone_for_fetch().build_market_data(symbol).await
    }

    // -------------------------------------------------------------------------
    // Stream subscriptions
    // -------------------------------------------------------------------------

    fn subscribe_candidates(&self, results: &[ScanResult]) {
        if self.trades.is_none() && self.books.is_none() {
            return;
        }

        for result in results.iter().take(STREAM_SUBSCRIPTION_CAP) {
            if let Some(trades) = &self.trades {
                trades.subscribe(&result.symbol);
            }
            if let Some(books) = &self.books {
                books.subscribe(&result.symbol);
            }
            debug!(symbol = %result.symbol, "candidate subscribed to streams");
        }
    }
}

impl std::fmt::Debug for ScanningManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanningManager")
            .field("cache_len", &self.cache.len())
            .field("last_candidates", &self.last_results.read().len())
            .finish()
    }
}

/// Owned context moved into each snapshot-fetch task.
struct FetchContext {
    client: Arc<dyn ExchangeClient>,
    lookback: usize,
}

impl FetchContext {
    async fn build_market_data(&self, symbol: String) -> Result<MarketData> {
        let ticker = self.client.fetch_ticker(&symbol).await?;

        // Enough candles for the level lookback plus indicator warmup.
        let candle_limit = self.lookback + ATR_PERIOD * 2;
        let candles_5m = self.client.fetch_ohlcv(&symbol, "5m", candle_limit).await?;
        let candles_15m = self.client.fetch_ohlcv(&symbol, "15m", ATR_PERIOD * 3).await?;

        let atr_5m = calculate_atr(&candles_5m, ATR_PERIOD)
            .ok_or_else(|| EngineError::Validation(format!("{symbol}: 5m ATR unavailable")))?;
        let atr_15m = calculate_atr(&candles_15m, ATR_PERIOD).unwrap_or(atr_5m);

        let closes: Vec<f64> = candles_5m.iter().map(|c| c.close).collect();
        let bb_width_pct = calculate_bb_width_pct(&closes, 20, 2.0).unwrap_or(0.0);

        let book = self.client.fetch_order_book(&symbol).await?;
        let l2_depth = Some(L2Depth {
            bid_usd_0_3pct: book.depth_usd_within(0.3, OrderSide::Buy),
            ask_usd_0_3pct: book.depth_usd_within(0.3, OrderSide::Sell),
            bid_usd_0_5pct: book.depth_usd_within(0.5, OrderSide::Buy),
            ask_usd_0_5pct: book.depth_usd_within(0.5, OrderSide::Sell),
            spread_bps: book.spread_bps().unwrap_or(f64::MAX),
            imbalance: book.imbalance(),
        });

        Ok(MarketData {
            symbol,
            price: ticker.last,
            volume_24h_usd: ticker.volume_24h_usd,
            open_interest_usd: ticker.open_interest_usd,
            oi_change_24h_pct: ticker.oi_change_24h_pct,
            trades_per_minute: ticker.trades_per_minute,
            atr_5m,
            atr_15m,
            bb_width_pct,
            // Refreshed by the scanner against the BTC reference snapshot.
            btc_correlation: 0.0,
            l2_depth,
            candles_5m,
            ts_ms: now_ms(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

// =============================================================================
// Kairos Breakout Engine — Main Entry Point
// =============================================================================
//
// The engine starts in paper mode unless the preset (or TRADING_MODE) says
// otherwise. Paper mode keeps real market data and swaps only the broker.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error_handler;
mod exchange;
mod execution;
mod health;
mod indicators;
mod market_data;
mod microstructure;
mod monitoring;
mod orchestrator;
mod position;
mod resource_monitor;
mod risk;
mod scanner;
mod scanning;
mod signals;
mod state_machine;
mod tp_optimizer;
mod types;

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::EngineContext;
use crate::config::Preset;
use crate::error_handler::ErrorHandler;
use crate::exchange::{ExchangeClient, LiveExchangeClient, PaperExchangeClient};
use crate::execution::ExecutionManager;
use crate::health::HealthMonitor;
use crate::market_data::MarketDataCache;
use crate::microstructure::{OrderBookTracker, TradesAggregator};
use crate::monitoring::{CheckpointLog, EventLog};
use crate::orchestrator::TradingOrchestrator;
use crate::position::PositionBook;
use crate::resource_monitor::ResourceMonitor;
use crate::risk::{KillSwitch, RiskManager};
use crate::scanning::ScanningManager;
use crate::signals::SignalManager;
use crate::state_machine::{EnginePhase, StateMachine};
use crate::types::TradingMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Kairos Breakout Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let preset_path =
        std::env::var("KAIROS_PRESET").unwrap_or_else(|_| "preset.json".to_string());
    let mut preset = Preset::load(&preset_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load preset, using defaults");
        Preset::default()
    });
    preset.apply_env_overrides();
    preset.validate()?;

    info!(
        trading_mode = %preset.engine.trading_mode,
        max_candidates = preset.scanner.max_candidates,
        max_concurrent_positions = preset.risk.max_concurrent_positions,
        "preset ready"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("KAIROS_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("KAIROS_API_SECRET").unwrap_or_default();
    let live_client = Arc::new(LiveExchangeClient::new(api_key, api_secret));

    let client: Arc<dyn ExchangeClient> = match preset.engine.trading_mode {
        TradingMode::Live => live_client.clone(),
        TradingMode::Paper => {
            info!(
                balance = preset.engine.paper_starting_balance,
                "paper mode: simulated broker over live market data"
            );
            Arc::new(
                PaperExchangeClient::new(
                    &preset.engine.quote_asset,
                    preset.engine.paper_starting_balance,
                )
                .with_data_source(live_client.clone()),
            )
        }
    };

    // ── 3. Shared components ─────────────────────────────────────────────
    let events = Arc::new(EventLog::new(1_000));
    let checkpoints = Arc::new(CheckpointLog::new(1_000));
    let stop = Arc::new(Notify::new());

    let state_machine = Arc::new(StateMachine::new(EnginePhase::Idle, events.clone()));
    let error_handler = Arc::new(ErrorHandler::new(events.clone()));
    let cache = Arc::new(MarketDataCache::new(
        preset.engine.max_cache_size,
        preset.engine.cache_ttl_secs,
    ));

    let trades = Arc::new(TradesAggregator::new(
        preset.microstructure.activity_drop_threshold,
    ));
    let books = Arc::new(OrderBookTracker::new());

    let scanning = Arc::new(ScanningManager::new(
        &preset,
        client.clone(),
        cache,
        checkpoints.clone(),
        Some(trades.clone()),
        Some(books.clone()),
    ));
    let signal_manager = Arc::new(SignalManager::new(
        &preset,
        Some(trades.clone()),
        Some(books.clone()),
    )?);

    let kill_switch = Arc::new(KillSwitch::new());
    let risk = Arc::new(RiskManager::new(preset.risk.clone(), kill_switch.clone()));
    let execution = Arc::new(ExecutionManager::new(
        client.clone(),
        preset.execution.clone(),
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

    // ── 4. Market data streams ───────────────────────────────────────────
    // Whitelist symbols get live trade/depth streams up front; scan-selected
    // candidates register in the trackers as they appear.
    let stream_symbols = preset.scanner.symbols_whitelist.clone().unwrap_or_default();
    for symbol in &stream_symbols {
        trades.subscribe(symbol);
        books.subscribe(symbol);

        let aggregator = trades.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    microstructure::trades::run_trade_stream(&sym, &aggregator).await
                {
                    error!(symbol = %sym, error = %e, "trade stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        let tracker = books.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    microstructure::orderbook::run_depth_stream(&sym, &tracker).await
                {
                    error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
    info!(count = stream_symbols.len(), "market data streams launched");

    // ── 5. Status API ────────────────────────────────────────────────────
    let context = Arc::new(EngineContext {
        trading_mode: preset.engine.trading_mode,
        state_machine: state_machine.clone(),
        error_handler: error_handler.clone(),
        scanning: scanning.clone(),
        signals: signal_manager.clone(),
        positions: positions.clone(),
        health: health.clone(),
        resources: resources.clone(),
        kill_switch: kill_switch.clone(),
        events: events.clone(),
        checkpoints: checkpoints.clone(),
        stop: stop.clone(),
        start_time: std::time::Instant::now(),
    });

    let bind_addr =
        std::env::var("KAIROS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let api_context = context.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_context);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .expect("failed to bind API server");
        info!(addr = %api_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 6. Resource monitor ──────────────────────────────────────────────
    let monitor = resources.clone();
    let monitor_stop = stop.clone();
    tokio::spawn(async move {
        monitor.run(monitor_stop).await;
    });

    // ── 7. Trading orchestrator ──────────────────────────────────────────
    let orchestrator = Arc::new(TradingOrchestrator::new(
        preset,
        state_machine.clone(),
        error_handler,
        scanning,
        signal_manager,
        risk,
        execution,
        positions,
        health,
        resources,
        checkpoints,
        events,
        client,
        stop.clone(),
    ));

    let engine = orchestrator.clone();
    let engine_task = tokio::spawn(async move {
        engine.run().await;
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    stop.notify_waiters();
    if let Err(e) = engine_task.await {
        error!(error = %e, "engine task join failed");
    }

    info!(phase = %state_machine.current(), "Kairos shut down complete");
    Ok(())
}

// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-mostly status surface under `/api/v1/`, plus the control endpoints
// (pause / resume / stop / kill). The engine itself never depends on this
// module; it only observes shared state.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::EngineContext;
use crate::state_machine::EnginePhase;
use crate::types::now_ms;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(context: Arc<EngineContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/scanner", get(scanner))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/events", get(events))
        .route("/api/v1/checkpoints", get(checkpoints))
        .route("/api/v1/command", post(command))
        .layer(cors)
        .with_state(context)
}

// =============================================================================
// Read endpoints
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    phase: String,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        phase: ctx.state_machine.current().to_string(),
        uptime_secs: ctx.start_time.elapsed().as_secs(),
        server_time: now_ms(),
    })
}

async fn full_state(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.snapshot())
}

#[derive(Serialize)]
struct PositionsResponse {
    open: Vec<crate::position::Position>,
    closed: Vec<crate::position::Position>,
}

async fn positions(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(PositionsResponse {
        open: ctx.positions.open_positions(),
        closed: ctx.positions.closed_positions(100),
    })
}

async fn scanner(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.scanning.diagnostics())
}

#[derive(Serialize)]
struct SignalsResponse {
    active: Vec<crate::signals::Signal>,
    recent: Vec<crate::signals::Signal>,
    metrics: crate::signals::SignalMetrics,
}

async fn signals(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(SignalsResponse {
        active: ctx.signals.active_signals(),
        recent: ctx.signals.recent_history(50),
        metrics: ctx.signals.metrics(),
    })
}

async fn errors(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.recent_errors(100))
}

async fn events(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.recent_events(100))
}

async fn checkpoints(State(ctx): State<Arc<EngineContext>>) -> impl IntoResponse {
    Json(ctx.checkpoints.recent(100))
}

// =============================================================================
// Control endpoints
// =============================================================================

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Serialize)]
struct CommandResponse {
    accepted: bool,
    phase: String,
    message: String,
}

async fn command(
    State(ctx): State<Arc<EngineContext>>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let phase = ctx.state_machine.current();
    info!(command = %request.command, phase = %phase, "control command received");

    let (accepted, message) = match request.command.as_str() {
        "pause" => {
            let ok = ctx
                .state_machine
                .transition_to(EnginePhase::Paused, "operator pause", None, false)
                .await;
            (ok, "pause requested".to_string())
        }
        "resume" => {
            let target = if ctx.positions.open_count() > 0 {
                EnginePhase::Managing
            } else {
                EnginePhase::Scanning
            };
            let ok = ctx
                .state_machine
                .transition_to(target, "operator resume", None, false)
                .await;
            (ok, format!("resume to {target}"))
        }
        "stop" => {
            ctx.stop.notify_waiters();
            (true, "stop requested".to_string())
        }
        "kill" => {
            ctx.kill_switch.activate("operator kill command");
            let ok = ctx
                .state_machine
                .transition_to(EnginePhase::Paused, "operator kill", None, false)
                .await;
            (ok, "kill switch latched".to_string())
        }
        other => {
            warn!(command = other, "unknown control command");
            return (
                StatusCode::BAD_REQUEST,
                Json(CommandResponse {
                    accepted: false,
                    phase: phase.to_string(),
                    message: format!("unknown command '{other}'"),
                }),
            );
        }
    };

    (
        StatusCode::OK,
        Json(CommandResponse {
            accepted,
            phase: ctx.state_machine.current().to_string(),
            message,
        }),
    )
}

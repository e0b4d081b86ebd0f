use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

const SERVICE_NAME: &str = "Agent Bridge";

/// Service banner at `/`
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": SERVICE_NAME }))
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    let running = state.sessions.processes().len().await as u64;

    let status = if state.shutdown.is_cancelled() {
        "shutting_down"
    } else {
        "healthy"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions: state.sessions.count().await as u64,
        running_processes: running,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use process_manager::ProcessRegistry;
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod handlers;
mod launcher;
mod metrics;
mod relay;
mod sessions;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{AgentConfig, CliOverrides, FileConfig, RelayConfig, ServerConfig};
use crate::launcher::AgentLauncher;
use crate::metrics::ServerMetrics;
use crate::sessions::SessionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "agent-bridge")]
#[command(about = "WebSocket bridge to a streaming coding-agent CLI")]
struct Cli {
    /// Config file (defaults to ~/.agent-bridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Connected sessions and the shared process registry
    pub sessions: Arc<SessionRegistry>,
    pub launcher: Arc<AgentLauncher>,
    pub relay_config: Arc<RelayConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    /// Cancelled once when the server starts shutting down
    pub shutdown: CancellationToken,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/ws", get(handlers::agent_websocket_handler))
        .route("/api/chat/create", post(handlers::create_chat_handler))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/{id}", get(handlers::get_session))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "agent_bridge=debug,process_manager=debug,tower_http=debug,info"
    } else {
        "agent_bridge=info,process_manager=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_path = cli.config.clone().or_else(config::default_config_path);
    let file_config = FileConfig::resolve(
        config_path.as_deref(),
        &CliOverrides {
            host: cli.host.clone(),
            port: cli.port,
        },
    )?;

    let server_config = ServerConfig::from_file(&file_config.server);
    let agent_config = AgentConfig::from_file(&file_config.agent);
    let relay_config = RelayConfig::from_file(&file_config.relay);

    info!("Starting Agent Bridge");
    info!(
        command = %agent_config.command,
        approve_mcps = agent_config.approve_mcps,
        working_dir = ?agent_config.working_dir,
        "Agent configured"
    );
    info!(
        grace_ms = relay_config.grace_period.as_millis() as u64,
        enrichment = relay_config.enrichment,
        "Relay configured"
    );

    let grace_period = relay_config.grace_period;
    let processes = Arc::new(ProcessRegistry::new());
    let state = AppState {
        sessions: Arc::new(SessionRegistry::new(processes)),
        launcher: Arc::new(AgentLauncher::new(agent_config)),
        relay_config: Arc::new(relay_config),
        metrics: Arc::new(ServerMetrics::new()),
        shutdown: CancellationToken::new(),
    };

    // Clone references needed for shutdown cleanup
    let sessions_for_shutdown = state.sessions.clone();
    let metrics_for_shutdown = state.metrics.clone();
    let shutdown_token = state.shutdown.clone();

    let app = build_router(state);

    let addr = server_config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Agent Bridge listening on http://{}", actual_addr);
    info!("  GET  /                 - Service status");
    info!("  GET  /ws?chatId=...    - Agent WebSocket");
    info!("  POST /api/chat/create  - Create a chat");
    info!("  GET  /api/sessions     - Connected sessions");
    info!("  GET  /health, /metrics - Observability");

    // Create shutdown signal handler
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        // Ends every WebSocket session so the server can drain
        shutdown_token.cancel();
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Perform cleanup after shutdown
    info!("Stopping running agent processes...");
    let report = sessions_for_shutdown.shutdown(grace_period).await;
    metrics_for_shutdown.sweep_killed(report.killed as u64);
    if report.failed > 0 {
        warn!("{} agent processes could not be confirmed stopped", report.failed);
    }
    info!("Stopped {} agent processes", report.total());

    info!("Shutdown complete");
    server_result
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use process_manager::ProcessRegistry;
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::config::{AgentConfig, AgentFileConfig, RelayConfig};
use crate::launcher::AgentLauncher;
use crate::metrics::ServerMetrics;
use crate::sessions::SessionRegistry;

/// Build a fully-wired `AppState` with default configuration.
///
/// The agent command is the default `cursor`; tests that actually spawn an
/// agent should use [`test_app_state_with_agent`].
pub fn test_app_state() -> AppState {
    app_state(AgentConfig::from_file(&AgentFileConfig::default()))
}

/// Like `test_app_state`, but the agent executable is `agent`.
pub fn test_app_state_with_agent(agent: &Path) -> AppState {
    app_state(AgentConfig::from_file(&AgentFileConfig {
        command: agent.to_string_lossy().into_owned(),
        ..Default::default()
    }))
}

fn app_state(agent: AgentConfig) -> AppState {
    AppState {
        sessions: Arc::new(SessionRegistry::new(Arc::new(ProcessRegistry::new()))),
        launcher: Arc::new(AgentLauncher::new(agent)),
        relay_config: Arc::new(RelayConfig::default()),
        metrics: Arc::new(ServerMetrics::new()),
        shutdown: CancellationToken::new(),
    }
}

/// Write an executable `sh` script standing in for the agent CLI.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Serve the full router on an ephemeral localhost port.
pub async fn spawn_test_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = crate::build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

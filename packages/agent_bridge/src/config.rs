use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [agent]
//                    command = "/opt/cursor/bin/cursor"
//
//   env var:         AGENT_BRIDGE_AGENT__COMMAND=/opt/cursor/bin/cursor
//                    (double underscore = nesting)
//
//   PORT is also honoured on its own and wins over AGENT_BRIDGE_SERVER__PORT.

const ENV_PREFIX: &str = "AGENT_BRIDGE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub agent: AgentFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// How the agent CLI is invoked (lives under `[agent]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentFileConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub approve_mcps: bool,
    #[serde(default = "default_create_chat_timeout_secs")]
    pub create_chat_timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for AgentFileConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            approve_mcps: true,
            create_chat_timeout_secs: default_create_chat_timeout_secs(),
            working_dir: None,
        }
    }
}

/// Relay tuning knobs (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
    #[serde(default = "default_true")]
    pub enrichment: bool,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            send_channel_capacity: default_send_channel_capacity(),
            enrichment: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3002
}
fn default_agent_command() -> String {
    "cursor".to_string()
}
fn default_true() -> bool {
    true
}
fn default_create_chat_timeout_secs() -> u64 {
    10
}
fn default_grace_period_ms() -> u64 {
    2000
}
fn default_send_channel_capacity() -> usize {
    100
}

/// `~/.agent-bridge/config.toml`, if a home directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".agent-bridge").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → AGENT_BRIDGE_* env vars → PORT.
///
/// A missing config file is not an error; figment treats it as empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `AGENT_BRIDGE_RELAY__GRACE_PERIOD_MS=500`  →  `relay.grace_period_ms = 500`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .merge(Env::raw().only(&["PORT"]).map(|_| "server.port".into()))
}

/// Values given on the command line. They sit above every other layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl FileConfig {
    /// Resolve the full layered configuration.
    pub fn resolve(config_path: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let mut fc: FileConfig = load_config(config_path)
            .extract()
            .context("Failed to load configuration")?;
        fc.apply_overrides(overrides);
        Ok(fc)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(host) = &overrides.host {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

/// Agent CLI configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Executable name or path of the agent tool
    pub command: String,
    /// Pass `--approve-mcps` on every run
    pub approve_mcps: bool,
    /// Upper bound for `agent create-chat`
    pub create_chat_timeout: Duration,
    /// Working directory for spawned agents (None = inherit)
    pub working_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_file(fc: &AgentFileConfig) -> Self {
        Self {
            command: fc.command.clone(),
            approve_mcps: fc.approve_mcps,
            create_chat_timeout: Duration::from_secs(fc.create_chat_timeout_secs),
            working_dir: fc.working_dir.clone(),
        }
    }
}

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Wait between a graceful terminate and a forced kill
    pub grace_period: Duration,
    /// Outbound channel capacity per session
    pub send_channel_capacity: usize,
    /// Annotate stdout events with derived fields
    pub enrichment: bool,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        Self {
            grace_period: Duration::from_millis(fc.grace_period_ms),
            // tokio channels reject a zero capacity
            send_channel_capacity: fc.send_channel_capacity.max(1),
            enrichment: fc.enrichment,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

//! Session Relay
//!
//! Runs one agent command on behalf of a session: spawn it, stream both of
//! its pipes to the client, report how it exited, and make sure it is gone
//! if the client leaves first.
//!
//! ```text
//! Idle -> Spawning -> Streaming -> Completed
//!             |           |------> Killed   (session cancelled)
//!             |           `------> Failed   (pump or wait error)
//!             `----------------->  Failed   (spawn error)
//! ```

pub mod enrich;
mod render;
mod sink;

pub use enrich::Enricher;
pub use sink::EventSink;

use std::sync::Arc;

use process_manager::{
    ProcessError, ProcessHandle, ShutdownOutcome, decode_line, event_type, read_lines,
};
use serde_json::Value;
use thiserror::Error;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::config::RelayConfig;
use crate::launcher::AgentLauncher;
use crate::metrics::ServerMetrics;
use crate::sessions::SessionRegistry;
use crate::ws::ServerMessage;

const RESET_MESSAGE: &str = "Starting new command";

/// A validated request to run the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    pub chat_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Spawning,
    Streaming,
    Completed,
    Killed,
    Failed,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both pipes drained and the exit code was reported to the client
    Completed { exit_code: i32 },
    /// The session went away mid-run; `None` if the process could not be confirmed dead
    Killed { shutdown: Option<ShutdownOutcome> },
    /// The agent could not be started
    SpawnFailed { reason: String },
    /// Streaming broke after the agent started
    Failed { reason: String },
}

#[derive(Debug, Error)]
enum StreamError {
    #[error("output pump failed: {0}")]
    Pump(#[from] JoinError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Runs commands for one session, one at a time.
pub struct SessionRelay {
    session_id: String,
    sessions: Arc<SessionRegistry>,
    launcher: Arc<AgentLauncher>,
    config: Arc<RelayConfig>,
    metrics: Arc<ServerMetrics>,
    sink: EventSink,
    state: RelayState,
}

impl SessionRelay {
    pub fn new(session_id: impl Into<String>, app: &AppState, sink: EventSink) -> Self {
        Self {
            session_id: session_id.into(),
            sessions: app.sessions.clone(),
            launcher: app.launcher.clone(),
            config: app.relay_config.clone(),
            metrics: app.metrics.clone(),
            sink,
            state: RelayState::Idle,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Run one command to a terminal state.
    ///
    /// Cancelling `cancel` (or the client side of the sink closing) stops the
    /// process with the configured grace period; no result event is sent in
    /// that case. The process is deregistered on every path.
    pub async fn run(&mut self, cmd: RunCommand, cancel: &CancellationToken) -> RelayOutcome {
        self.state = RelayState::Spawning;
        let spec = self.launcher.agent_command(&cmd.chat_id, &cmd.prompt);
        info!(
            session_id = %self.session_id,
            chat_id = %cmd.chat_id,
            prompt_len = cmd.prompt.len(),
            "Spawning agent"
        );

        let (handle, pipes) = match ProcessHandle::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Failed to spawn agent");
                self.metrics.spawn_error();
                let _ = self.sink.send(ServerMessage::error(e.to_string())).await;
                self.state = RelayState::Failed;
                return RelayOutcome::SpawnFailed {
                    reason: e.to_string(),
                };
            }
        };

        let pid = handle.pid();
        self.sessions.processes().register(handle.clone()).await;
        self.sessions
            .set_active_process(&self.session_id, Some(pid))
            .await;
        self.metrics.command_started();
        self.state = RelayState::Streaming;

        let _ = self
            .sink
            .send(ServerMessage::Reset {
                message: RESET_MESSAGE.to_string(),
                chat_id: cmd.chat_id.clone(),
            })
            .await;

        let enricher = self.config.enrichment.then(Enricher::new);
        let mut stdout_task = tokio::spawn(pump_stdout(
            pipes.stdout,
            self.sink.clone(),
            enricher,
            self.metrics.clone(),
            pid,
        ));
        let mut stderr_task = tokio::spawn(pump_stderr(
            pipes.stderr,
            self.sink.clone(),
            self.metrics.clone(),
            pid,
        ));

        let finished = tokio::select! {
            result = drain_and_wait(&handle, &mut stdout_task, &mut stderr_task) => Some(result),
            _ = cancel.cancelled() => None,
            _ = self.sink.closed() => None,
        };

        self.settle(finished, &handle, stdout_task, stderr_task).await
    }

    /// Move a streaming run to its terminal state. `None` means the session
    /// went away before the agent finished.
    async fn settle(
        &mut self,
        finished: Option<Result<i32, StreamError>>,
        handle: &ProcessHandle,
        stdout_task: JoinHandle<()>,
        stderr_task: JoinHandle<()>,
    ) -> RelayOutcome {
        let pid = handle.pid();
        match finished {
            Some(Ok(exit_code)) => {
                info!(session_id = %self.session_id, pid, exit_code, "Agent finished");
                self.metrics.command_completed();
                self.release(pid).await;
                self.state = RelayState::Completed;
                let _ = self.sink.send(ServerMessage::result(exit_code)).await;
                RelayOutcome::Completed { exit_code }
            }
            Some(Err(e)) => {
                error!(session_id = %self.session_id, pid, error = %e, "Agent stream failed");
                let _ = self.sink.send(ServerMessage::error(e.to_string())).await;
                self.stop(handle).await;
                abort_pumps(stdout_task, stderr_task).await;
                self.metrics.command_failed();
                self.release(pid).await;
                self.state = RelayState::Failed;
                RelayOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            None => {
                warn!(
                    session_id = %self.session_id,
                    pid, "Session ended while agent was running, terminating"
                );
                let shutdown = self.stop(handle).await;
                abort_pumps(stdout_task, stderr_task).await;
                self.metrics.command_killed();
                self.release(pid).await;
                self.state = RelayState::Killed;
                RelayOutcome::Killed { shutdown }
            }
        }
    }

    /// Drop the process from both registries once it is in a terminal state.
    async fn release(&self, pid: u32) {
        self.sessions.processes().deregister(pid).await;
        self.sessions
            .set_active_process(&self.session_id, None)
            .await;
    }

    async fn stop(&self, handle: &ProcessHandle) -> Option<ShutdownOutcome> {
        let pid = handle.pid();
        match handle.shutdown(self.config.grace_period).await {
            Ok(outcome @ ShutdownOutcome::Exited(code)) => {
                info!(pid, exit_code = code, "Agent terminated");
                Some(outcome)
            }
            Ok(outcome @ ShutdownOutcome::Killed(code)) => {
                warn!(pid, exit_code = code, "Agent ignored terminate and was killed");
                Some(outcome)
            }
            Err(e) => {
                error!(pid, error = %e, "Failed to stop agent");
                None
            }
        }
    }
}

/// Both pumps reach end-of-input, then the exit code is collected.
async fn drain_and_wait(
    handle: &ProcessHandle,
    stdout_task: &mut JoinHandle<()>,
    stderr_task: &mut JoinHandle<()>,
) -> Result<i32, StreamError> {
    let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
    stdout?;
    stderr?;
    Ok(handle.wait().await?)
}

async fn abort_pumps(stdout_task: JoinHandle<()>, stderr_task: JoinHandle<()>) {
    for task in [stdout_task, stderr_task] {
        task.abort();
        // A finished pump may already have been joined by `drain_and_wait`;
        // its sink clone is gone either way.
        if !task.is_finished() {
            let _ = task.await;
        }
    }
}

async fn pump_stdout(
    stdout: ChildStdout,
    sink: EventSink,
    mut enricher: Option<Enricher>,
    metrics: Arc<ServerMetrics>,
    pid: u32,
) {
    let lines = read_lines(stdout, |line| {
        let prepared = prepare_event(&line, enricher.as_mut(), &metrics, pid);
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move {
            if let Some((event, raw)) = prepared {
                if sink.send(event).await.is_ok() {
                    metrics.event_forwarded(raw);
                }
            }
        }
    })
    .await;
    let tools = enricher
        .as_ref()
        .map(|e| e.tools_called().join(","))
        .unwrap_or_default();
    debug!(pid, lines, tools = %tools, "Agent stdout closed");
}

/// Decode and annotate one stdout line. Whitespace-only lines produce nothing.
fn prepare_event(
    line: &str,
    enricher: Option<&mut Enricher>,
    metrics: &ServerMetrics,
    pid: u32,
) -> Option<(Value, bool)> {
    if line.trim().is_empty() {
        return None;
    }

    let mut event = decode_line(line);
    let raw = event_type(&event) == Some("raw");
    if let Some(enricher) = enricher {
        if let Err(e) = enricher.enrich(&mut event) {
            debug!(pid, error = %e, "Event forwarded without enrichment");
            metrics.enrichment_error();
        }
    }
    debug!(
        pid,
        event_type = event_type(&event).unwrap_or("-"),
        "Forwarding agent event"
    );
    Some((event, raw))
}

async fn pump_stderr(stderr: ChildStderr, sink: EventSink, metrics: Arc<ServerMetrics>, pid: u32) {
    let lines = read_lines(stderr, |line| {
        warn!(pid, line = %preview(&line), "Agent stderr");
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move {
            if sink.send(ServerMessage::error(line)).await.is_ok() {
                metrics.stderr_line();
            }
        }
    })
    .await;
    debug!(pid, lines, "Agent stderr closed");
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(200) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

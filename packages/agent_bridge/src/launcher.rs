//! Command lines for the agent CLI.

use std::process::Stdio;

use process_manager::CommandSpec;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::AgentConfig;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command} agent create-chat' did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("'{command} agent create-chat' exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("'{command} agent create-chat' printed no chat id")]
    EmptyOutput { command: String },
}

impl LaunchError {
    /// The agent ran and reported failure, as opposed to never running to completion.
    pub fn is_agent_failure(&self) -> bool {
        matches!(
            self,
            LaunchError::Failed { .. } | LaunchError::EmptyOutput { .. }
        )
    }
}

/// Builds invocations of the agent tool from configuration.
#[derive(Clone, Debug)]
pub struct AgentLauncher {
    config: AgentConfig,
}

impl AgentLauncher {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn base_command(&self) -> CommandSpec {
        let spec = CommandSpec::new(&self.config.command).arg("agent");
        match &self.config.working_dir {
            Some(dir) => spec.working_dir(dir),
            None => spec,
        }
    }

    /// `<tool> agent --print --output-format stream-json --force [--approve-mcps] --resume <chat> <prompt>`
    ///
    /// The prompt is passed as a single argument; it may contain any text.
    pub fn agent_command(&self, chat_id: &str, prompt: &str) -> CommandSpec {
        let mut spec =
            self.base_command()
                .args(["--print", "--output-format", "stream-json", "--force"]);
        if self.config.approve_mcps {
            spec = spec.arg("--approve-mcps");
        }
        spec.args(["--resume", chat_id]).arg(prompt)
    }

    pub fn create_chat_command(&self) -> CommandSpec {
        self.base_command().arg("create-chat")
    }

    /// Ask the agent for a fresh chat id.
    pub async fn create_chat(&self) -> Result<String, LaunchError> {
        let spec = self.create_chat_command();
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        debug!(command = %spec.program, "Running create-chat");
        let timeout = self.config.create_chat_timeout;
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| LaunchError::Spawn {
                command: spec.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(LaunchError::Timeout {
                    command: spec.program.clone(),
                    secs: timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(code = ?output.status.code(), stderr = %stderr, "Error creating chat");
            return Err(LaunchError::Failed {
                command: spec.program,
                code: output.status.code(),
                stderr,
            });
        }

        let chat_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if chat_id.is_empty() {
            return Err(LaunchError::EmptyOutput {
                command: spec.program,
            });
        }

        info!(chat_id = %chat_id, "Created chat");
        Ok(chat_id)
    }
}

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// Description of a command to spawn
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Output pipes of a freshly spawned process, handed out exactly once
#[derive(Debug)]
pub struct ProcessPipes {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// How a process ended when it was asked to shut down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own or after the graceful request
    Exited(i32),
    /// Ignored the graceful request for the whole grace period and was killed
    Killed(i32),
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Exited(code) | ShutdownOutcome::Killed(code) => *code,
        }
    }
}

/// Messages that can be sent to the reaper task
enum ProcessMessage {
    Kill,
}

type ExitState = Option<Result<i32, String>>;

/// Handle to a spawned process.
///
/// The child itself is owned by a reaper task that waits for it to exit and
/// publishes the exit code; handles are cheap to clone and can be shared
/// between the task relaying output and the registry.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    command: Arc<str>,
    sender: mpsc::Sender<ProcessMessage>,
    exit_rx: watch::Receiver<ExitState>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn a command with stdout and stderr piped and stdin closed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(spec: &CommandSpec) -> Result<(ProcessHandle, ProcessPipes), ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            command: spec.program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            command: spec.program.clone(),
            reason: "process exited before its id could be read".to_string(),
        })?;

        let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe {
            pid,
            pipe: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe {
            pid,
            pipe: "stderr",
        })?;

        info!(pid, command = %spec.program, args = spec.args.len(), "Process spawned");

        let (msg_tx, msg_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(reap(child, pid, msg_rx, exit_tx));

        let handle = ProcessHandle {
            pid,
            command: Arc::from(spec.program.as_str()),
            sender: msg_tx,
            exit_rx,
        };
        Ok((handle, ProcessPipes { stdout, stderr }))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the exit status has been observed
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit code if the process has already exited
    pub fn exit_code(&self) -> Option<i32> {
        match &*self.exit_rx.borrow() {
            Some(Ok(code)) => Some(*code),
            _ => None,
        }
    }

    /// Ask the process to stop (SIGTERM on unix). Does not wait.
    pub fn terminate(&self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }

        debug!(pid = self.pid, "Sending graceful terminate");
        #[cfg(unix)]
        return send_sigterm(self.pid);
        #[cfg(not(unix))]
        return self.kill();
    }

    /// Force the process to stop immediately. Does not wait.
    pub fn kill(&self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }

        debug!(pid = self.pid, "Requesting forced kill");
        match self.sender.try_send(ProcessMessage::Kill) {
            // A full queue means a kill is already pending
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if self.has_exited() {
                    Ok(())
                } else {
                    Err(ProcessError::ActorGone(self.pid))
                }
            }
        }
    }

    /// Wait until the process exits and return its exit code.
    ///
    /// A process killed by a signal reports the negated signal number on unix.
    pub async fn wait(&self) -> Result<i32, ProcessError> {
        let mut rx = self.exit_rx.clone();
        let state = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| ProcessError::ActorGone(self.pid))?
            .clone();

        match state {
            Some(Ok(code)) => Ok(code),
            Some(Err(reason)) => Err(ProcessError::Wait {
                pid: self.pid,
                reason,
            }),
            None => Err(ProcessError::ActorGone(self.pid)),
        }
    }

    /// Terminate, wait up to `grace`, then escalate to a kill.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownOutcome, ProcessError> {
        if let Some(code) = self.exit_code() {
            return Ok(ShutdownOutcome::Exited(code));
        }

        if let Err(e) = self.terminate() {
            warn!(pid = self.pid, error = %e, "Graceful terminate failed, escalating");
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(result) => result.map(ShutdownOutcome::Exited),
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Process did not terminate gracefully, killing"
                );
                self.kill()?;
                match tokio::time::timeout(grace, self.wait()).await {
                    Ok(result) => result.map(ShutdownOutcome::Killed),
                    Err(_) => Err(ProcessError::Wait {
                        pid: self.pid,
                        reason: "still running after kill".to_string(),
                    }),
                }
            }
        }
    }
}

async fn reap(
    mut child: Child,
    pid: u32,
    mut receiver: mpsc::Receiver<ProcessMessage>,
    exit_tx: watch::Sender<ExitState>,
) {
    let result = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map(exit_code).map_err(|e| e.to_string());
            }
            Some(msg) = receiver.recv() => match msg {
                ProcessMessage::Kill => {
                    if let Err(e) = child.start_kill() {
                        warn!(pid, error = %e, "Failed to kill process");
                    }
                }
            },
        }
    };

    match &result {
        Ok(code) => info!(pid, exit_code = code, "Process exited"),
        Err(e) => warn!(pid, error = %e, "Error waiting for process"),
    }
    exit_tx.send_replace(Some(result));
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

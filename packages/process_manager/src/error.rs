use thiserror::Error;

/// Errors that can occur during process operations
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be located or launched
    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// A pipe requested at spawn time was not available
    #[error("Process {pid} has no {pipe} pipe")]
    MissingPipe { pid: u32, pipe: &'static str },

    /// Delivering a signal to the process failed
    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// The reaper task owning the child is gone before reporting an exit
    #[error("Process {0} reaper stopped before reporting an exit status")]
    ActorGone(u32),

    /// Waiting on the child failed at the OS level
    #[error("Failed to wait on process {pid}: {reason}")]
    Wait { pid: u32, reason: String },
}

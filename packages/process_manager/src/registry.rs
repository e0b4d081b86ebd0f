use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::process::{ProcessHandle, ShutdownOutcome};

/// Tally of a shutdown sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Exited after the graceful request (or had already exited)
    pub exited: usize,
    /// Needed a forced kill
    pub killed: usize,
    /// Could not be confirmed dead
    pub failed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.exited + self.killed + self.failed
    }
}

/// Live processes keyed by OS process id.
///
/// An entry exists from spawn until the owner observes a terminal state and
/// deregisters it. Used for bookkeeping and for the shutdown sweep.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<RwLock<HashMap<u32, ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: ProcessHandle) {
        let pid = handle.pid();
        debug!(pid, "Registering process");
        self.processes.write().await.insert(pid, handle);
    }

    /// Remove a process. Safe to call for an unknown or already removed pid.
    pub async fn deregister(&self, pid: u32) -> bool {
        let removed = self.processes.write().await.remove(&pid).is_some();
        if removed {
            debug!(pid, "Deregistered process");
        }
        removed
    }

    pub async fn get(&self, pid: u32) -> Option<ProcessHandle> {
        self.processes.read().await.get(&pid).cloned()
    }

    pub async fn contains(&self, pid: u32) -> bool {
        self.processes.read().await.contains_key(&pid)
    }

    pub async fn len(&self) -> usize {
        self.processes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.is_empty()
    }

    pub async fn pids(&self) -> Vec<u32> {
        self.processes.read().await.keys().copied().collect()
    }

    /// Terminate every registered process, escalating to kill after `grace`,
    /// then clear the registry.
    ///
    /// Handles are shut down concurrently so the sweep is bounded by roughly
    /// two grace periods. A failure on one handle never stops the others.
    pub async fn sweep_and_terminate_all(&self, grace: Duration) -> SweepReport {
        let handles: Vec<ProcessHandle> = {
            let mut processes = self.processes.write().await;
            processes.drain().map(|(_, handle)| handle).collect()
        };

        if handles.is_empty() {
            return SweepReport::default();
        }

        info!(count = handles.len(), "Terminating active processes");

        let results = join_all(handles.iter().map(|handle| async move {
            let pid = handle.pid();
            info!(pid, "Terminating process");
            (pid, handle.shutdown(grace).await)
        }))
        .await;

        let mut report = SweepReport::default();
        for (pid, result) in results {
            match result {
                Ok(ShutdownOutcome::Exited(code)) => {
                    info!(pid, exit_code = code, "Process terminated");
                    report.exited += 1;
                }
                Ok(ShutdownOutcome::Killed(code)) => {
                    warn!(pid, exit_code = code, "Process killed after grace period");
                    report.killed += 1;
                }
                Err(e) => {
                    error!(pid, error = %e, "Error terminating process");
                    report.failed += 1;
                }
            }
        }

        // Anything registered while the sweep ran is dropped too
        self.processes.write().await.clear();
        info!(
            exited = report.exited,
            killed = report.killed,
            failed = report.failed,
            "All processes cleaned up"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry() {
        let registry = ProcessRegistry::new();
        assert!(registry.is_empty().await);
        assert_eq!(registry.len().await, 0);
        assert!(!registry.deregister(42).await);
        assert_eq!(
            registry.sweep_and_terminate_all(Duration::from_millis(10)).await,
            SweepReport::default()
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::process::CommandSpec;

        fn sleeper(script: &str) -> ProcessHandle {
            let (handle, _pipes) =
                ProcessHandle::spawn(&CommandSpec::new("sh").args(["-c", script])).unwrap();
            handle
        }

        #[tokio::test]
        async fn register_and_deregister_idempotent() {
            let registry = ProcessRegistry::new();
            let handle = sleeper("exit 0");
            let pid = handle.pid();

            registry.register(handle.clone()).await;
            assert!(registry.contains(pid).await);
            assert_eq!(registry.pids().await, vec![pid]);
            assert_eq!(registry.get(pid).await.map(|h| h.pid()), Some(pid));

            assert!(registry.deregister(pid).await);
            assert!(!registry.deregister(pid).await);
            assert!(registry.is_empty().await);
            handle.wait().await.unwrap();
        }

        #[tokio::test]
        async fn clones_share_state() {
            let registry = ProcessRegistry::new();
            let other = registry.clone();
            let handle = sleeper("exit 0");
            registry.register(handle.clone()).await;
            assert_eq!(other.len().await, 1);
            other.deregister(handle.pid()).await;
            assert!(registry.is_empty().await);
        }

        #[tokio::test]
        async fn sweep_terminates_and_kills() {
            let registry = ProcessRegistry::new();
            let polite = sleeper("exec sleep 30");
            let stubborn = sleeper("trap '' TERM; exec sleep 30");
            let finished = sleeper("exit 0");
            finished.wait().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            registry.register(polite.clone()).await;
            registry.register(stubborn.clone()).await;
            registry.register(finished.clone()).await;

            let report = registry
                .sweep_and_terminate_all(Duration::from_millis(300))
                .await;
            assert_eq!(
                report,
                SweepReport {
                    exited: 2,
                    killed: 1,
                    failed: 0
                }
            );
            assert_eq!(report.total(), 3);
            assert!(registry.is_empty().await);
            assert!(polite.has_exited());
            assert!(stubborn.has_exited());
        }
    }
}

//! Session Registry
//!
//! One session per WebSocket connection. The registry also owns the shared
//! process registry so the server has a single place to sweep at shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use process_manager::{ProcessRegistry, SweepReport};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    /// Chat the client connected for, from the `chatId` query parameter
    pub chat_id: Option<String>,
    /// Agent process currently streaming for this session
    pub active_pid: Option<u32>,
    pub connected_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    processes: Arc<ProcessRegistry>,
}

impl SessionRegistry {
    pub fn new(processes: Arc<ProcessRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            processes,
        }
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    /// Register a new session and return its info.
    pub async fn open(&self, chat_id: Option<String>) -> SessionInfo {
        let info = SessionInfo {
            id: generate_session_id(),
            chat_id,
            active_pid: None,
            connected_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(info.id.clone(), info.clone());
        debug!(session_id = %info.id, "Session opened");
        info
    }

    /// Remove a session. Unknown ids are ignored.
    pub async fn close(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "Session closed");
        }
        removed
    }

    pub async fn set_active_process(&self, session_id: &str, pid: Option<u32>) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.active_pid = pid;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Terminate every running agent process. Sessions themselves are left to
    /// their connection handlers.
    pub async fn shutdown(&self, grace: Duration) -> SweepReport {
        let running = self.processes.len().await;
        info!(
            sessions = self.count().await,
            running, "Stopping running agent processes"
        );
        self.processes.sweep_and_terminate_all(grace).await
    }
}

/// `<unix-millis>-<8 hex chars>`
fn generate_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(ProcessRegistry::new()))
    }

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let sessions = registry();
        let a = sessions.open(Some("chat-1".to_string())).await;
        let b = sessions.open(None).await;
        assert_ne!(a.id, b.id);
        assert_eq!(sessions.count().await, 2);
        assert_eq!(
            sessions.get(&a.id).await.unwrap().chat_id.as_deref(),
            Some("chat-1")
        );

        assert!(sessions.close(&a.id).await);
        assert!(!sessions.close(&a.id).await);
        assert_eq!(sessions.count().await, 1);
        assert_eq!(sessions.list().await[0].id, b.id);
    }

    #[tokio::test]
    async fn test_set_active_process() {
        let sessions = registry();
        let session = sessions.open(None).await;
        assert!(sessions.set_active_process(&session.id, Some(42)).await);
        assert_eq!(sessions.get(&session.id).await.unwrap().active_pid, Some(42));
        assert!(sessions.set_active_process(&session.id, None).await);
        assert_eq!(sessions.get(&session.id).await.unwrap().active_pid, None);
        assert!(!sessions.set_active_process("missing", Some(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_processes() {
        let sessions = registry();
        sessions.open(None).await;
        let report = sessions.shutdown(Duration::from_millis(10)).await;
        assert_eq!(report.total(), 0);
        // Sessions are closed by their handlers, not by the sweep
        assert_eq!(sessions.count().await, 1);
    }
}

//! Server metrics for observability
//!
//! Counters are updated from the WebSocket handler and the relay and exposed
//! through `/metrics` and `/health`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open WebSocket sessions
    pub active_connections: AtomicU64,
    /// Total sessions since server start
    pub total_connections: AtomicU64,

    // Command metrics
    /// Agent processes spawned
    pub commands_started: AtomicU64,
    /// Runs that reached a result event
    pub commands_completed: AtomicU64,
    /// Runs that failed after spawning
    pub commands_failed: AtomicU64,
    /// Runs cut short by a disconnect or shutdown
    pub commands_killed: AtomicU64,

    // Event metrics
    /// Stdout events delivered to the outbound channel
    pub events_forwarded: AtomicU64,
    /// Of those, lines that were not JSON
    pub raw_events: AtomicU64,
    /// Stderr lines forwarded as error events
    pub stderr_lines: AtomicU64,

    // Error metrics
    /// Agent executable could not be launched
    pub spawn_errors: AtomicU64,
    /// Events that could not be annotated
    pub enrichment_errors: AtomicU64,
    /// Processes force-killed by the shutdown sweep
    pub sweep_kills: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Command tracking
    pub fn command_started(&self) {
        self.commands_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self) {
        self.commands_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_killed(&self) {
        self.commands_killed.fetch_add(1, Ordering::Relaxed);
    }

    // Event tracking
    pub fn event_forwarded(&self, raw: bool) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
        if raw {
            self.raw_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stderr_line(&self) {
        self.stderr_lines.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn spawn_error(&self) {
        self.spawn_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enrichment_error(&self) {
        self.enrichment_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_killed(&self, count: u64) {
        self.sweep_kills.fetch_add(count, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                started: self.commands_started.load(Ordering::Relaxed),
                completed: self.commands_completed.load(Ordering::Relaxed),
                failed: self.commands_failed.load(Ordering::Relaxed),
                killed: self.commands_killed.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                forwarded: self.events_forwarded.load(Ordering::Relaxed),
                raw: self.raw_events.load(Ordering::Relaxed),
                stderr_lines: self.stderr_lines.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                spawn: self.spawn_errors.load(Ordering::Relaxed),
                enrichment: self.enrichment_errors.load(Ordering::Relaxed),
                sweep_kills: self.sweep_kills.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub commands: CommandMetrics,
    pub events: EventMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub killed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetrics {
    pub forwarded: u64,
    pub raw: u64,
    pub stderr_lines: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub spawn: u64,
    pub enrichment: u64,
    pub sweep_kills: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: u64,
    pub running_processes: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_tracking() {
        let metrics = ServerMetrics::new();
        metrics.event_forwarded(false);
        metrics.event_forwarded(true);
        metrics.stderr_line();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events.forwarded, 2);
        assert_eq!(snapshot.events.raw, 1);
        assert_eq!(snapshot.events.stderr_lines, 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.command_started();
        metrics.command_completed();
        metrics.command_started();
        metrics.command_killed();
        metrics.spawn_error();
        metrics.sweep_killed(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.commands.started, 2);
        assert_eq!(snapshot.commands.completed, 1);
        assert_eq!(snapshot.commands.killed, 1);
        assert_eq!(snapshot.errors.spawn, 1);
        assert_eq!(snapshot.errors.sweep_kills, 3);
    }
}

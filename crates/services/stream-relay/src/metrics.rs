//! Relay-wide counters
//!
//! One collector is shared (behind an `Arc`) by the listener, every session
//! and the HTTP API.

use std::sync::atomic::{AtomicU64, Ordering};

/// Relay metrics collector
#[derive(Default)]
pub struct Metrics {
    /// WebSocket connections accepted since startup
    connections_opened: AtomicU64,

    /// WebSocket connections closed since startup
    connections_closed: AtomicU64,

    /// Connections refused because the relay was full
    connections_rejected: AtomicU64,

    /// Current open connections
    active_connections: AtomicU64,

    /// Relay sessions started (new session IDs issued)
    sessions_started: AtomicU64,

    /// Media chunks accepted into a write queue
    chunks_received: AtomicU64,

    /// Media bytes accepted into a write queue
    bytes_received: AtomicU64,

    /// Media chunks refused (wrong state or queue full)
    chunks_rejected: AtomicU64,

    /// Media bytes delivered to encoder stdin
    bytes_relayed: AtomicU64,

    /// Encoder processes spawned
    processes_spawned: AtomicU64,

    /// Encoder spawn attempts that failed
    spawn_failures: AtomicU64,

    /// Automatic restarts performed
    process_restarts: AtomicU64,

    /// Sessions that ran out of restarts
    restart_budgets_exhausted: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk accepted for relaying
    pub fn chunk_received(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn chunk_rejected(&self) {
        self.chunks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written to an encoder
    pub fn bytes_relayed(&self, bytes: usize) {
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn process_spawned(&self) {
        self.processes_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_failed(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_restarted(&self) {
        self.process_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restart_budget_exhausted(&self) {
        self.restart_budgets_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            processes_spawned: self.processes_spawned.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            process_restarts: self.process_restarts.load(Ordering::Relaxed),
            restart_budgets_exhausted: self.restart_budgets_exhausted.load(Ordering::Relaxed),
            uptime_secs,
        }
    }

    /// Get open connection count
    pub fn active_connection_count(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub active_connections: u64,
    pub sessions_started: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub chunks_rejected: u64,
    pub bytes_relayed: u64,
    pub processes_spawned: u64,
    pub spawn_failures: u64,
    pub process_restarts: u64,
    pub restart_budgets_exhausted: u64,

    /// Seconds since startup
    pub uptime_secs: u64,
}

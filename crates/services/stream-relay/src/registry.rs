//! Registry of open connections
//!
//! Tracks one entry per WebSocket connection so the relay can enforce its
//! connection limit, answer the HTTP API, and close every session on
//! shutdown.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::metrics::Metrics;
use crate::session::{CloseReason, SessionHandle, SessionStats};

/// One open connection
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub handle: SessionHandle,
}

/// Connections currently served by the relay
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    max_connections: usize,
    metrics: Arc<Metrics>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
            metrics,
        }
    }

    /// Add a connection, refusing it when the relay is full
    pub async fn register(
        &self,
        peer: SocketAddr,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;

        if connections.len() >= self.max_connections {
            self.metrics.connection_rejected();
            return Err(RegistryError::MaxConnectionsReached(self.max_connections));
        }

        let connection_id = handle.connection_id().to_string();
        if connections.contains_key(&connection_id) {
            return Err(RegistryError::Duplicate(connection_id));
        }

        connections.insert(
            connection_id.clone(),
            ConnectionEntry {
                peer,
                connected_at: Utc::now(),
                handle,
            },
        );
        self.metrics.connection_opened();

        tracing::debug!(
            connection_id = %connection_id,
            %peer,
            connections = connections.len(),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove a connection
    pub async fn deregister(&self, connection_id: &str) -> Option<ConnectionEntry> {
        let removed = self.connections.write().await.remove(connection_id);
        if removed.is_some() {
            self.metrics.connection_closed();
        }
        removed
    }

    pub async fn get(&self, connection_id: &str) -> Option<ConnectionEntry> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Stats for one connection's session
    pub async fn stats(&self, connection_id: &str) -> Result<SessionStats, RegistryError> {
        let entry = self
            .get(connection_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        entry
            .handle
            .stats()
            .await
            .map_err(|_| RegistryError::NotFound(connection_id.to_string()))
    }

    /// Stats for every session that is still answering
    pub async fn all_stats(&self) -> Vec<SessionStats> {
        let handles: Vec<SessionHandle> = self
            .connections
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        stats
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Close one connection's session
    pub async fn close(&self, connection_id: &str, reason: CloseReason) -> Result<(), RegistryError> {
        let entry = self
            .get(connection_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        // A session that already finished is as good as closed
        let _ = entry.handle.close(reason);
        Ok(())
    }

    /// Close every session and wait for the connections to go away
    ///
    /// Returns the number of connections still registered when `timeout`
    /// elapsed.
    pub async fn shutdown_all(&self, timeout: Duration) -> usize {
        let handles: Vec<SessionHandle> = self
            .connections
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();

        tracing::info!(connections = handles.len(), "Closing all sessions");
        for handle in &handles {
            let _ = handle.close(CloseReason::ServerShutdown);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.len().await;
            if remaining == 0 {
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "Timed out waiting for sessions to close");
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Registry-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Maximum connections reached ({0})")]
    MaxConnectionsReached(usize),

    #[error("Connection already registered: {0}")]
    Duplicate(String),

    #[error("Connection not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FfmpegCommand;
    use crate::process::DiagnosticFilter;
    use crate::session::{spawn_session, SessionSettings, SessionState};
    use crate::supervisor::SupervisorPolicy;
    use tokio::sync::mpsc;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn open(id: &str, metrics: &Arc<Metrics>) -> SessionHandle {
        let settings = SessionSettings {
            factory: Arc::new(FfmpegCommand::from_config(&Default::default())),
            filter: Arc::new(DiagnosticFilter::default()),
            policy: SupervisorPolicy::default(),
            max_queue_bytes: 1024,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_session(id.to_string(), settings, tx, metrics.clone());
        handle
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(10, metrics.clone());

        registry.register(peer(), open("conn_a", &metrics)).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(metrics.active_connection_count(), 1);

        let stats = registry.stats("conn_a").await.unwrap();
        assert_eq!(stats.state, SessionState::Created);

        assert!(registry.deregister("conn_a").await.is_some());
        assert!(registry.deregister("conn_a").await.is_none());
        assert!(registry.is_empty().await);
        assert_eq!(metrics.active_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_max_connections() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(2, metrics.clone());

        registry.register(peer(), open("conn_a", &metrics)).await.unwrap();
        registry.register(peer(), open("conn_b", &metrics)).await.unwrap();

        let err = registry
            .register(peer(), open("conn_c", &metrics))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::MaxConnectionsReached(2));
        assert_eq!(metrics.snapshot().connections_rejected, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(10, metrics.clone());

        registry.register(peer(), open("conn_a", &metrics)).await.unwrap();
        assert!(matches!(
            registry.register(peer(), open("conn_a", &metrics)).await,
            Err(RegistryError::Duplicate(_))
        ));
        assert!(matches!(
            registry.stats("conn_x").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_all_times_out_when_nobody_deregisters() {
        let metrics = Arc::new(Metrics::new());
        let registry = ConnectionRegistry::new(10, metrics.clone());
        let handle = open("conn_a", &metrics);
        registry.register(peer(), handle.clone()).await.unwrap();

        let remaining = registry.shutdown_all(Duration::from_millis(100)).await;
        assert_eq!(remaining, 1);
        // The session itself received the close
        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

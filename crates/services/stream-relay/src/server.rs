//! WebSocket listener
//!
//! Accepts media connections on the configured path and gives each one its
//! own session task. Binary and text frames both go through the
//! demultiplexer; server messages are written back as JSON text frames.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::destination::SrtDefaults;
use crate::error::{RelayError, Result};
use crate::metrics::Metrics;
use crate::protocol::{Demultiplexer, ErrorSource, Inbound, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::session::{spawn_session, CloseReason, SessionError, SessionHandle, SessionSettings};

/// How long queued server messages may take to reach a closing client
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind the WebSocket listener
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.ws_port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| RelayError::Bind { addr, source })
}

/// Accepts WebSocket connections and wires them to sessions
pub struct RelayServer {
    ws_path: String,
    demux: Demultiplexer,
    settings: SessionSettings,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
}

impl RelayServer {
    pub fn new(
        config: &Config,
        settings: SessionSettings,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let srt_defaults = SrtDefaults {
            mode: config.encoder.default_srt_mode,
            latency_ms: config.encoder.default_srt_latency_ms,
        };

        Self {
            ws_path: config.server.ws_path.clone(),
            demux: Demultiplexer::new(srt_defaults),
            settings,
            registry,
            metrics,
        }
    }

    /// Accept connections until `shutdown_rx` fires
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            addr = ?listener.local_addr().ok(),
            path = %self.ws_path,
            "Relay accepting WebSocket connections"
        );

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                warn!(%peer, error = %e, "WebSocket connection failed");
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("WebSocket listener received shutdown signal");
                    break;
                }
            }
        }
    }

    /// Serve one connection until the client leaves or its session ends
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);

        let path = self.ws_path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == path {
                return Ok(response);
            }
            let mut rejection: ErrorResponse =
                ErrorResponse::new(Some(format!("No WebSocket endpoint at {}", request.uri().path())));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        };
        let ws_stream = accept_hdr_async(stream, check_path).await?;

        let connection_id = format!("conn_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        info!(connection_id = %connection_id, %peer, "WebSocket connection opened");

        let (ws_tx, mut ws_rx) = ws_stream.split();
        let ws_tx = Arc::new(Mutex::new(ws_tx));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (handle, session_task) = spawn_session(
            connection_id.clone(),
            self.settings.clone(),
            out_tx,
            self.metrics.clone(),
        );

        if let Err(e) = self.registry.register(peer, handle.clone()).await {
            warn!(connection_id = %connection_id, %peer, error = %e, "Refusing connection");
            let _ = handle.close(CloseReason::ServerShutdown);
            let _ = session_task.await;

            let mut ws_tx = ws_tx.lock().await;
            let refusal = ServerMessage::error(e.to_string(), ErrorSource::Session);
            let _ = ws_tx.send(Message::Text(refusal.to_json())).await;
            let _ = ws_tx.close().await;
            return Ok(());
        }

        // Forward session messages; closes the socket once the session is gone
        let writer = Arc::clone(&ws_tx);
        let mut forward_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let mut ws_tx = writer.lock().await;
                if let Err(e) = ws_tx.send(Message::Text(message.to_json())).await {
                    debug!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = writer.lock().await.close().await;
        });

        let mut forward_done = false;
        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                _ = &mut forward_task, if !forward_done => {
                    // Session finished on its own and the socket is closed
                    forward_done = true;
                    break;
                }
            };
            let Some(msg) = msg else {
                break;
            };

            let frame = match msg {
                Ok(Message::Binary(data)) => Bytes::from(data),
                Ok(Message::Text(text)) => Bytes::from(text),
                Ok(Message::Close(_)) => {
                    debug!(connection_id = %connection_id, "WebSocket closed by client");
                    break;
                }
                Ok(Message::Ping(data)) => {
                    let mut ws_tx = ws_tx.lock().await;
                    let _ = ws_tx.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                    break;
                }
            };

            if self.dispatch(&handle, frame).is_err() {
                break;
            }
        }

        // Cleanup on disconnect
        let _ = handle.close(CloseReason::ClientDisconnected);
        match session_task.await {
            Ok(stats) => info!(
                connection_id = %connection_id,
                session_id = ?stats.session_id,
                delivered_bytes = stats.queue.delivered_bytes,
                rejected_media = stats.rejected_media,
                "WebSocket connection closed"
            ),
            Err(e) => error!(connection_id = %connection_id, "Session task failed: {}", e),
        }
        self.registry.deregister(&connection_id).await;

        if !forward_done && tokio::time::timeout(FLUSH_TIMEOUT, &mut forward_task).await.is_err() {
            forward_task.abort();
        }

        Ok(())
    }

    fn dispatch(&self, handle: &SessionHandle, frame: Bytes) -> std::result::Result<(), SessionError> {
        match self.demux.classify(frame) {
            Ok(Inbound::Control(message)) => {
                debug!(
                    connection_id = %handle.connection_id(),
                    action = message.action(),
                    "Control message"
                );
                handle.control(message)
            }
            Ok(Inbound::Media(chunk)) => handle.media(chunk),
            Err(e) => handle.protocol_error(e),
        }
    }
}

//! Relay sessions
//!
//! Each WebSocket connection owns one session task. The task is the only
//! place where session state, the write queue and the encoder supervisor are
//! touched, so control messages, media chunks and process events are handled
//! strictly one at a time and in arrival order.
//!
//! ```text
//!             start                 switch
//! Created ─────────────▶ Active ◀───────────▶ Switching
//!    │                   │    ▲ start
//!    │ stop (ack only)   │    └──────────── Stopped / Failed
//!    ▼                   ├─ stop ──────────▶ Stopped
//! Created                └─ budget spent ──▶ Failed
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::encoder::{CommandFactory, FfmpegCommand};
use crate::metrics::Metrics;
use crate::process::{DiagnosticFilter, ProcessEvent, ProcessEventKind, WriteOutcome};
use crate::protocol::{ControlMessage, ErrorSource, ProtocolError, ServerMessage, StreamRequest};
use crate::queue::{QueueStats, WriteCompletion, WriteQueue};
use crate::supervisor::{Supervisor, SupervisorPolicy, SupervisorState, Transition};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Connected, nothing started yet
    Created,
    /// Relaying media to the encoder
    Active,
    /// Replacing the encoder for a new destination
    Switching,
    /// Stopped by the client; may be started again
    Stopped,
    /// Encoder kept failing; only a start leaves this state
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Switching => "switching",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The WebSocket went away
    ClientDisconnected,
    /// The relay is shutting down
    ServerShutdown,
}

/// Work item for a session task
#[derive(Debug)]
pub enum SessionCommand {
    Control(ControlMessage),
    Media(Bytes),
    /// A chunk dropped at the handle because too many bytes were already
    /// waiting for the session; carries its size
    MediaOverflow(usize),
    /// A frame that could not be decoded; reported back in order
    ProtocolError(ProtocolError),
    Stats(oneshot::Sender<SessionStats>),
    Close(CloseReason),
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub connection_id: String,
    pub session_id: Option<String>,
    pub state: SessionState,
    pub supervisor: SupervisorState,
    /// Redacted destination of the running relay
    pub destination: Option<String>,
    pub pid: Option<u32>,
    /// Automatic restarts since the last start or switch
    pub restarts: u32,
    /// How the last encoder run ended
    pub last_exit: Option<String>,
    pub queue: QueueStats,
    /// Media chunks refused over the session's lifetime
    pub rejected_media: u64,
}

/// Everything a session needs besides its connection
#[derive(Clone)]
pub struct SessionSettings {
    pub factory: Arc<dyn CommandFactory>,
    pub filter: Arc<DiagnosticFilter>,
    pub policy: SupervisorPolicy,
    pub max_queue_bytes: usize,
}

impl SessionSettings {
    /// Production settings running the configured encoder
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        Ok(Self {
            factory: Arc::new(FfmpegCommand::from_config(&config.encoder)),
            filter: Arc::new(DiagnosticFilter::from_pattern(&config.encoder.fatal_pattern)?),
            policy: SupervisorPolicy::from(&config.relay),
            max_queue_bytes: config.relay.max_queue_bytes,
        })
    }

    /// Replace the command factory
    pub fn with_factory(mut self, factory: Arc<dyn CommandFactory>) -> Self {
        self.factory = factory;
        self
    }
}

/// Cloneable handle to a running session task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection_id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Media bytes sent but not yet taken by the session task
    backlog: Arc<AtomicUsize>,
    max_backlog: usize,
}

impl SessionHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn control(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.send(SessionCommand::Control(message))
    }

    /// Hand a media chunk to the session; never waits
    ///
    /// While the session is busy (terminating an encoder, say) chunks pile up
    /// in its command channel. Once those exceed the queue limit the payload
    /// is dropped here and only its size is forwarded, so the rejection is
    /// still reported in order.
    pub fn media(&self, chunk: Bytes) -> Result<(), SessionError> {
        let len = chunk.len();
        let held = self.backlog.fetch_add(len, Ordering::AcqRel) + len;
        if held > self.max_backlog {
            self.backlog.fetch_sub(len, Ordering::AcqRel);
            return self.send(SessionCommand::MediaOverflow(len));
        }
        self.send(SessionCommand::Media(chunk))
    }

    pub fn protocol_error(&self, error: ProtocolError) -> Result<(), SessionError> {
        self.send(SessionCommand::ProtocolError(error))
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Stats(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Ask the session to tear down its encoder and finish
    pub fn close(&self, reason: CloseReason) -> Result<(), SessionError> {
        self.send(SessionCommand::Close(reason))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }
}

/// Start a session task for a new connection
///
/// Server messages are written to `outbound`. The task ends after a
/// [`SessionCommand::Close`] or once every handle is dropped, and returns its
/// final stats.
pub fn spawn_session(
    connection_id: String,
    settings: SessionSettings,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    metrics: Arc<Metrics>,
) -> (SessionHandle, JoinHandle<SessionStats>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));

    let supervisor = Supervisor::new(
        settings.policy,
        settings.factory,
        settings.filter,
        event_tx,
        metrics.clone(),
    );

    let session = RelaySession {
        connection_id: connection_id.clone(),
        session_id: None,
        state: SessionState::Created,
        supervisor,
        queue: WriteQueue::new(settings.max_queue_bytes, String::new()),
        commands: command_rx,
        backlog: backlog.clone(),
        events: event_rx,
        outbound,
        metrics,
        rejected_media: 0,
    };

    let task = tokio::spawn(session.run());
    let handle = SessionHandle {
        connection_id,
        commands: command_tx,
        backlog,
        max_backlog: settings.max_queue_bytes,
    };
    (handle, task)
}

struct RelaySession {
    connection_id: String,
    /// Issued on every start from a non-active state
    session_id: Option<String>,
    state: SessionState,
    supervisor: Supervisor,
    queue: WriteQueue,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    backlog: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    metrics: Arc<Metrics>,
    rejected_media: u64,
}

impl RelaySession {
    async fn run(mut self) -> SessionStats {
        tracing::debug!(connection_id = %self.connection_id, "Session task started");

        let reason = loop {
            let restart_at = self.supervisor.restart_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Close(reason)) => break reason,
                    Some(command) => self.handle_command(command).await,
                    None => break CloseReason::ClientDisconnected,
                },
                Some(event) = self.events.recv() => self.handle_process_event(event),
                completion = self.queue.write_completed() => self.handle_write(completion),
                _ = sleep_until(restart_at) => {
                    let transition = self.supervisor.restart();
                    self.apply(transition);
                }
            }
        };

        self.close(reason).await;
        self.stats()
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Control(ControlMessage::Start(request)) => {
                self.begin(request, "start").await
            }
            SessionCommand::Control(ControlMessage::Switch(request)) => {
                if self.state == SessionState::Failed {
                    self.send(ServerMessage::error(
                        "Cannot switch a failed relay; send start instead",
                        ErrorSource::Session,
                    ));
                } else {
                    self.begin(request, "switch").await
                }
            }
            SessionCommand::Control(ControlMessage::Stop) => self.stop().await,
            SessionCommand::Media(chunk) => {
                self.backlog.fetch_sub(chunk.len(), Ordering::AcqRel);
                self.accept_media(chunk)
            }
            SessionCommand::MediaOverflow(len) => {
                if self.check_relaying() {
                    self.reject_media(
                        format!("Relay busy; dropped {} byte chunk", len),
                        ErrorSource::Queue,
                    );
                }
            }
            SessionCommand::ProtocolError(error) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    error = %error,
                    "Rejected client message"
                );
                self.send(ServerMessage::error(error.to_string(), ErrorSource::Protocol));
            }
            SessionCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            // Handled by the run loop
            SessionCommand::Close(_) => {}
        }
    }

    /// Start or switch; the old encoder is fully gone before the new one spawns
    async fn begin(&mut self, request: StreamRequest, action: &'static str) {
        let was_active = self.state == SessionState::Active;
        if was_active {
            self.state = SessionState::Switching;
        }

        let dropped = self.queue.clear();
        let session_id = match (&self.session_id, was_active) {
            (Some(id), true) => id.clone(),
            _ => new_session_id(),
        };
        self.supervisor.set_session_id(session_id.clone());
        self.queue.set_session_id(session_id.clone());

        let StreamRequest {
            destination,
            tracks,
        } = request;
        let shown = destination.redacted();

        match self.supervisor.start(destination, tracks).await {
            Ok(()) => {
                if !was_active {
                    self.metrics.session_started();
                }
                self.session_id = Some(session_id.clone());
                self.queue.begin_run();
                self.state = SessionState::Active;

                tracing::info!(
                    connection_id = %self.connection_id,
                    session_id = %session_id,
                    action,
                    destination = %shown,
                    pid = ?self.supervisor.pid(),
                    has_audio = tracks.has_audio,
                    has_video = tracks.has_video,
                    dropped_chunks = dropped,
                    "Relay started"
                );
                self.send(ServerMessage::Started {
                    session_id,
                    destination: shown,
                });
            }
            Err(e) => {
                // The previous encoder is already gone
                if was_active {
                    self.state = SessionState::Stopped;
                }
                tracing::warn!(
                    connection_id = %self.connection_id,
                    action,
                    destination = %shown,
                    error = %e,
                    "Relay failed to start"
                );
                self.send(ServerMessage::error(e.to_string(), ErrorSource::Encoder));
            }
        }
    }

    async fn stop(&mut self) {
        let dropped = self.queue.clear();
        let outcome = self.supervisor.stop().await;

        if self.state != SessionState::Created {
            self.state = SessionState::Stopped;
        }
        if let Some(outcome) = outcome {
            tracing::info!(
                connection_id = %self.connection_id,
                session_id = ?self.session_id,
                %outcome,
                dropped_chunks = dropped,
                "Relay stopped"
            );
        }
        self.send(ServerMessage::Stopped { reason: None });
    }

    fn accept_media(&mut self, chunk: Bytes) {
        if !self.check_relaying() {
            return;
        }

        let len = chunk.len();
        match self.queue.enqueue(chunk) {
            Ok(()) => {
                self.metrics.chunk_received(len);
                self.pump();
            }
            Err(e) => self.reject_media(e.to_string(), ErrorSource::Queue),
        }
    }

    /// Whether media is accepted now; rejects the chunk otherwise
    fn check_relaying(&mut self) -> bool {
        if matches!(self.state, SessionState::Active | SessionState::Switching) {
            return true;
        }
        let reason = match self.state {
            SessionState::Failed => "Relay failed; send start to resume".to_string(),
            state => format!("Relay is not running (session {})", state),
        };
        self.reject_media(reason, ErrorSource::Session);
        false
    }

    fn reject_media(&mut self, reason: String, source: ErrorSource) {
        self.metrics.chunk_rejected();
        self.rejected_media += 1;
        tracing::trace!(
            connection_id = %self.connection_id,
            rejected = self.rejected_media,
            "Media rejected"
        );
        self.send(ServerMessage::error(reason, source));
    }

    /// Hand the next chunk to the encoder if none is in flight
    fn pump(&mut self) {
        if self.queue.is_draining() || self.queue.len() == 0 {
            return;
        }
        let Some(process) = self.supervisor.process_mut() else {
            return;
        };
        let Some(sink) = process.take_stdin() else {
            return;
        };
        if let Err(sink) = self.queue.start_next(sink) {
            process.restore_stdin(sink);
        }
    }

    fn handle_write(&mut self, completion: WriteCompletion) {
        let WriteCompletion { sink, outcome, len } = completion;
        let generation = sink.generation();

        match outcome {
            WriteOutcome::Delivered(n) => {
                self.metrics.bytes_relayed(n);
                if let Some(process) = self.supervisor.process_mut() {
                    process.restore_stdin(sink);
                }
                self.pump();
            }
            WriteOutcome::PipeBroken | WriteOutcome::Failed(_) => {
                drop(sink);
                let dropped = self.queue.clear();

                if self.supervisor.is_current(generation) {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        session_id = ?self.session_id,
                        generation,
                        chunk_bytes = len,
                        dropped_chunks = dropped,
                        ?outcome,
                        "Encoder write failed"
                    );
                    let transition = self.supervisor.handle_pipe_broken(generation);
                    self.apply(transition);
                } else {
                    tracing::debug!(
                        connection_id = %self.connection_id,
                        generation,
                        ?outcome,
                        "Write to retired encoder failed"
                    );
                }
            }
        }
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event.kind {
            ProcessEventKind::Exited(outcome) => {
                let transition = self.supervisor.handle_exit(event.generation, &outcome);
                self.apply(transition);
            }
            ProcessEventKind::Diagnostic(line) => {
                if self.supervisor.is_current(event.generation) {
                    self.send(ServerMessage::error(line, ErrorSource::Encoder));
                }
            }
        }
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Restarting { attempt, delay } => {
                let dropped = self.queue.clear();
                tracing::debug!(
                    connection_id = %self.connection_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    dropped_chunks = dropped,
                    "Waiting to restart encoder"
                );
            }
            Transition::Restarted { .. } => {
                self.queue.begin_run();
                self.pump();
            }
            Transition::Failed { restarts } => {
                self.queue.clear();
                self.state = SessionState::Failed;
                self.send(ServerMessage::error(
                    format!(
                        "Encoder keeps exiting; gave up after {} restarts. Send start to retry",
                        restarts
                    ),
                    ErrorSource::Encoder,
                ));
            }
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        let relaying = matches!(self.state, SessionState::Active | SessionState::Switching);
        self.queue.clear();

        if let Some(outcome) = self.supervisor.stop().await {
            tracing::info!(
                connection_id = %self.connection_id,
                session_id = ?self.session_id,
                %outcome,
                ?reason,
                "Relay closed"
            );
        }
        if relaying && reason == CloseReason::ServerShutdown {
            self.send(ServerMessage::Stopped {
                reason: Some("server shutting down".to_string()),
            });
        }
        if self.state != SessionState::Created {
            self.state = SessionState::Stopped;
        }
        self.commands.close();
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            supervisor: self.supervisor.state(),
            destination: self.supervisor.destination().map(|d| d.redacted()),
            pid: self.supervisor.pid(),
            restarts: self.supervisor.restarts(),
            last_exit: self.supervisor.last_outcome().map(|o| o.to_string()),
            queue: self.queue.stats(),
            rejected_media: self.rejected_media,
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            tracing::trace!(connection_id = %self.connection_id, "Client gone, message dropped");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Session-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,
}

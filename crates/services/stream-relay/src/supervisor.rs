//! Encoder process supervision
//!
//! Owns zero or one [`ProcessHandle`] and decides what happens when it goes
//! away: explicit starts and switches replace it, unexpected exits restart it
//! with the last destination until the restart budget runs out.
//!
//! ```text
//! Idle ──start──▶ Starting ──spawn ok──▶ Running ──switch──▶ Stopping ──▶ Starting
//!   ▲                │ spawn failed         │ unexpected exit
//!   └────────────────┘                      ├── budget left ──▶ Starting (after backoff)
//!   ▲                                       └── exhausted ───▶ Failed
//!   └──────────────── stop (from any state) ◀────────────────────┘
//! ```
//!
//! The supervisor never touches the write queue. Callers must abandon any
//! in-flight write before calling an async method here, and must clear the
//! backlog whenever a returned [`Transition`] enters `Starting`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::destination::Destination;
use crate::encoder::{CommandFactory, TrackLayout};
use crate::metrics::Metrics;
use crate::process::{DiagnosticFilter, ProcessError, ProcessEvent, ProcessHandle, ProcessOutcome};

/// Supervisor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No process
    Idle,
    /// Spawning, or waiting out the backoff before an automatic restart
    Starting,
    /// Process running and accepting input
    Running,
    /// Tearing down the current process
    Stopping,
    /// Restart budget exhausted
    Failed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Restart and shutdown policy
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Consecutive unexpected exits tolerated
    pub max_restarts: u32,
    /// Base restart delay, multiplied by the attempt number
    pub restart_backoff: Duration,
    /// Wait after closing stdin
    pub stdin_grace: Duration,
    /// Wait after SIGTERM, and again after kill
    pub terminate_grace: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for SupervisorPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            restart_backoff: config.restart_backoff(),
            stdin_grace: config.stdin_grace(),
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// State change caused by a process event or a scheduled restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Event concerned a process that is no longer current
    Unchanged,
    /// Entered `Starting`; a restart fires after `delay`
    Restarting { attempt: u32, delay: Duration },
    /// Automatic restart spawned a new process
    Restarted { attempt: u32 },
    /// Entered `Failed`
    Failed { restarts: u32 },
}

/// Process supervisor for one session
pub struct Supervisor {
    state: SupervisorState,
    process: Option<ProcessHandle>,
    /// Last destination explicitly started; reused by restarts
    destination: Option<Destination>,
    tracks: TrackLayout,
    /// Automatic restarts since the last explicit start
    restarts: u32,
    restart_at: Option<Instant>,
    /// How the most recent process run ended
    last_outcome: Option<ProcessOutcome>,
    /// Incremented on every spawn attempt
    generation: u64,
    policy: SupervisorPolicy,
    factory: Arc<dyn CommandFactory>,
    filter: Arc<DiagnosticFilter>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    metrics: Arc<Metrics>,
    session_id: String,
}

impl Supervisor {
    pub fn new(
        policy: SupervisorPolicy,
        factory: Arc<dyn CommandFactory>,
        filter: Arc<DiagnosticFilter>,
        events: mpsc::UnboundedSender<ProcessEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            state: SupervisorState::Idle,
            process: None,
            destination: None,
            tracks: TrackLayout::default(),
            restarts: 0,
            restart_at: None,
            last_outcome: None,
            generation: 0,
            policy,
            factory,
            filter,
            events,
            metrics,
            session_id: String::new(),
        }
    }

    /// Session ID used in log fields
    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = session_id;
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// How the most recent process run ended, including failed spawns
    pub fn last_outcome(&self) -> Option<&ProcessOutcome> {
        self.last_outcome.as_ref()
    }

    /// When the pending automatic restart is due
    pub fn restart_deadline(&self) -> Option<Instant> {
        self.restart_at
    }

    /// The running process, if any
    pub fn process_mut(&mut self) -> Option<&mut ProcessHandle> {
        match self.state {
            SupervisorState::Running => self.process.as_mut(),
            _ => None,
        }
    }

    /// Whether `generation` is the process currently running
    pub fn is_current(&self, generation: u64) -> bool {
        self.state == SupervisorState::Running
            && self
                .process
                .as_ref()
                .is_some_and(|p| p.generation() == generation)
    }

    /// Explicit start or switch
    ///
    /// Fully terminates any current process before spawning. A spawn failure
    /// leaves the supervisor `Idle` and is never retried.
    pub async fn start(
        &mut self,
        destination: Destination,
        tracks: TrackLayout,
    ) -> Result<(), ProcessError> {
        self.terminate_current().await;
        self.restart_at = None;
        self.restarts = 0;
        self.tracks = tracks;
        self.state = SupervisorState::Starting;

        match self.spawn(destination.clone()) {
            Ok(()) => {
                self.destination = Some(destination);
                self.state = SupervisorState::Running;
                Ok(())
            }
            Err(e) => {
                self.destination = None;
                self.state = SupervisorState::Idle;
                Err(e)
            }
        }
    }

    /// Terminate the current process and return to `Idle`
    ///
    /// Idempotent; returns the outcome if a process was torn down.
    pub async fn stop(&mut self) -> Option<ProcessOutcome> {
        let outcome = self.terminate_current().await;
        self.state = SupervisorState::Idle;
        self.restart_at = None;
        self.restarts = 0;
        self.destination = None;
        outcome
    }

    /// React to a process exit
    pub fn handle_exit(&mut self, generation: u64, outcome: &ProcessOutcome) -> Transition {
        if !self.is_current(generation) {
            tracing::debug!(
                session_id = %self.session_id,
                generation,
                %outcome,
                "Ignoring exit of a retired encoder"
            );
            return Transition::Unchanged;
        }

        self.process = None;
        self.last_outcome = Some(outcome.clone());
        tracing::warn!(
            session_id = %self.session_id,
            generation,
            %outcome,
            "Encoder exited unexpectedly"
        );
        self.schedule_restart()
    }

    /// React to the running process refusing input
    pub fn handle_pipe_broken(&mut self, generation: u64) -> Transition {
        if !self.is_current(generation) {
            return Transition::Unchanged;
        }

        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.last_outcome = Some(ProcessOutcome::PipeBroken);
        tracing::warn!(
            session_id = %self.session_id,
            generation,
            "Encoder input closed while running"
        );
        self.schedule_restart()
    }

    /// Perform the automatic restart scheduled by a previous transition
    pub fn restart(&mut self) -> Transition {
        self.restart_at = None;
        if self.state != SupervisorState::Starting {
            return Transition::Unchanged;
        }

        let Some(destination) = self.destination.clone() else {
            self.state = SupervisorState::Idle;
            return Transition::Unchanged;
        };

        match self.spawn(destination) {
            Ok(()) => {
                self.state = SupervisorState::Running;
                self.metrics.process_restarted();
                tracing::info!(
                    session_id = %self.session_id,
                    attempt = self.restarts,
                    max_restarts = self.policy.max_restarts,
                    "Encoder restarted"
                );
                Transition::Restarted {
                    attempt: self.restarts,
                }
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    attempt = self.restarts,
                    error = %e,
                    "Encoder restart failed"
                );
                self.schedule_restart()
            }
        }
    }

    fn schedule_restart(&mut self) -> Transition {
        if self.restarts >= self.policy.max_restarts {
            self.state = SupervisorState::Failed;
            self.restart_at = None;
            self.metrics.restart_budget_exhausted();
            tracing::error!(
                session_id = %self.session_id,
                restarts = self.restarts,
                "Encoder restart budget exhausted"
            );
            return Transition::Failed {
                restarts: self.restarts,
            };
        }

        self.restarts += 1;
        let delay = self.policy.restart_backoff * self.restarts;
        self.state = SupervisorState::Starting;
        self.restart_at = Some(Instant::now() + delay);

        tracing::info!(
            session_id = %self.session_id,
            attempt = self.restarts,
            max_restarts = self.policy.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling encoder restart"
        );
        Transition::Restarting {
            attempt: self.restarts,
            delay,
        }
    }

    fn spawn(&mut self, destination: Destination) -> Result<(), ProcessError> {
        self.generation += 1;
        let spec = self.factory.build(&destination, self.tracks);

        match ProcessHandle::spawn(
            &spec,
            destination,
            self.generation,
            self.events.clone(),
            self.filter.clone(),
        ) {
            Ok(process) => {
                self.metrics.process_spawned();
                self.process = Some(process);
                Ok(())
            }
            Err(e) => {
                self.metrics.spawn_failed();
                self.last_outcome = Some(e.outcome());
                tracing::error!(
                    session_id = %self.session_id,
                    generation = self.generation,
                    error = %e,
                    "Failed to spawn encoder"
                );
                Err(e)
            }
        }
    }

    async fn terminate_current(&mut self) -> Option<ProcessOutcome> {
        let mut process = self.process.take()?;
        self.state = SupervisorState::Stopping;

        let outcome = process
            .terminate(self.policy.stdin_grace, self.policy.terminate_grace)
            .await;
        tracing::info!(
            session_id = %self.session_id,
            pid = ?process.pid(),
            generation = process.generation(),
            %outcome,
            "Encoder terminated"
        );

        self.state = SupervisorState::Idle;
        self.last_outcome = Some(outcome.clone());
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CommandSpec;
    use crate::process::ProcessEventKind;

    /// Runs the same shell script for every destination
    struct Script(String);

    impl CommandFactory for Script {
        fn build(&self, _destination: &Destination, _tracks: TrackLayout) -> CommandSpec {
            CommandSpec::new("sh").arg("-c").arg(&self.0)
        }
    }

    struct Missing;

    impl CommandFactory for Missing {
        fn build(&self, _destination: &Destination, _tracks: TrackLayout) -> CommandSpec {
            CommandSpec::new("/nonexistent/encoder")
        }
    }

    fn policy(max_restarts: u32) -> SupervisorPolicy {
        SupervisorPolicy {
            max_restarts,
            restart_backoff: Duration::from_millis(10),
            stdin_grace: Duration::from_millis(500),
            terminate_grace: Duration::from_millis(500),
        }
    }

    fn supervisor(
        factory: Arc<dyn CommandFactory>,
        max_restarts: u32,
    ) -> (Supervisor, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = Supervisor::new(
            policy(max_restarts),
            factory,
            Arc::new(DiagnosticFilter::default()),
            tx,
            Arc::new(Metrics::new()),
        );
        (sup, rx)
    }

    fn dest(port: u16) -> Destination {
        Destination::parse(&format!("srt://127.0.0.1:{}", port)).unwrap()
    }

    async fn next_exit(rx: &mut mpsc::UnboundedReceiver<ProcessEvent>) -> (u64, ProcessOutcome) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for exit")
                .expect("event channel closed");
            if let ProcessEventKind::Exited(outcome) = event.kind {
                return (event.generation, outcome);
            }
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (mut sup, _rx) = supervisor(Arc::new(Script("cat > /dev/null".into())), 3);
        assert_eq!(sup.state(), SupervisorState::Idle);

        sup.start(dest(9000), TrackLayout::default()).await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);
        assert!(sup.pid().is_some());
        assert_eq!(sup.destination().unwrap().port(), Some(9000));

        let outcome = sup.stop().await;
        assert_eq!(outcome, Some(ProcessOutcome::ExitedCleanly));
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(sup.destination().is_none());
        assert_eq!(sup.last_outcome(), Some(&ProcessOutcome::ExitedCleanly));

        // Second stop is a no-op
        assert_eq!(sup.stop().await, None);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_idle() {
        let (mut sup, _rx) = supervisor(Arc::new(Missing), 3);
        let err = sup.start(dest(9000), TrackLayout::default()).await;
        assert!(err.is_err());
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert_eq!(sup.restarts(), 0);
        assert!(sup.restart_deadline().is_none());
        assert!(matches!(
            sup.last_outcome(),
            Some(ProcessOutcome::SpawnFailed(msg)) if msg.contains("/nonexistent/encoder")
        ));
    }

    #[tokio::test]
    async fn test_switch_retires_old_generation() {
        let (mut sup, mut rx) = supervisor(Arc::new(Script("cat > /dev/null".into())), 3);
        sup.start(dest(9000), TrackLayout::default()).await.unwrap();
        sup.start(dest(9001), TrackLayout::default()).await.unwrap();
        assert_eq!(sup.destination().unwrap().port(), Some(9001));

        // The first process's exit arrives late and must not trigger anything
        let (generation, _) = next_exit(&mut rx).await;
        assert_eq!(generation, 1);
        assert_eq!(
            sup.handle_exit(generation, &ProcessOutcome::ExitedCleanly),
            Transition::Unchanged
        );
        assert_eq!(sup.state(), SupervisorState::Running);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_restart_budget_exhausted() {
        let (mut sup, mut rx) = supervisor(Arc::new(Script("exit 3".into())), 3);
        sup.start(dest(9000), TrackLayout::default()).await.unwrap();

        let mut restarts = 0;
        loop {
            let (generation, outcome) = next_exit(&mut rx).await;
            match sup.handle_exit(generation, &outcome) {
                Transition::Restarting { attempt, .. } => {
                    assert_eq!(attempt, restarts + 1);
                    assert_eq!(sup.state(), SupervisorState::Starting);
                    let deadline = sup.restart_deadline().unwrap();
                    tokio::time::sleep_until(deadline).await;
                    assert_eq!(sup.restart(), Transition::Restarted { attempt });
                    restarts += 1;
                }
                Transition::Failed { restarts: n } => {
                    assert_eq!(n, 3);
                    break;
                }
                other => panic!("unexpected transition {:?}", other),
            }
        }

        assert_eq!(restarts, 3);
        assert_eq!(sup.state(), SupervisorState::Failed);

        // An explicit start resets the budget
        sup.start(dest(9000), TrackLayout::default()).await.unwrap();
        assert_eq!(sup.restarts(), 0);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let (mut sup, mut rx) = supervisor(Arc::new(Script("exit 1".into())), 3);
        sup.start(dest(9000), TrackLayout::default()).await.unwrap();

        let (generation, outcome) = next_exit(&mut rx).await;
        assert!(matches!(
            sup.handle_exit(generation, &outcome),
            Transition::Restarting { attempt: 1, .. }
        ));

        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert_eq!(sup.restarts(), 0);
        assert!(sup.restart_deadline().is_none());
        assert_eq!(sup.restart(), Transition::Unchanged);
    }

    #[tokio::test]
    async fn test_pipe_broken_while_running_restarts() {
        let (mut sup, _rx) = supervisor(Arc::new(Script("cat > /dev/null".into())), 1);
        sup.start(dest(9000), TrackLayout::default()).await.unwrap();

        let generation = sup.process_mut().unwrap().generation();
        assert!(matches!(
            sup.handle_pipe_broken(generation),
            Transition::Restarting { attempt: 1, .. }
        ));
        assert_eq!(sup.last_outcome(), Some(&ProcessOutcome::PipeBroken));
        // A stale report changes nothing
        assert_eq!(sup.handle_pipe_broken(generation), Transition::Unchanged);
        sup.stop().await;
    }
}

//! Encoder process handle
//!
//! Owns one OS process and its pipes. Raw termination and pipe events are
//! translated into [`ProcessOutcome`]s and posted, tagged with the handle's
//! generation, to the owning session's event channel; nothing here calls back
//! into the session.

use bytes::Bytes;
use regex::Regex;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::destination::Destination;
use crate::encoder::CommandSpec;

/// Longest stderr line kept; the remainder is discarded
const MAX_DIAGNOSTIC_LINE: usize = 4096;

/// How a process run ended (or failed to begin)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exit status zero
    ExitedCleanly,
    /// Non-zero exit status or terminated by a signal
    ExitedAbnormally {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The OS refused to start the program
    SpawnFailed(String),
    /// The process closed its input while we were writing
    PipeBroken,
}

impl ProcessOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ProcessOutcome::ExitedCleanly
        } else {
            ProcessOutcome::ExitedAbnormally {
                code: status.code(),
                signal: exit_signal(&status),
            }
        }
    }
}

impl std::fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessOutcome::ExitedCleanly => write!(f, "exited cleanly"),
            ProcessOutcome::ExitedAbnormally {
                code: Some(code), ..
            } => write!(f, "exited with code {}", code),
            ProcessOutcome::ExitedAbnormally {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {}", signal),
            ProcessOutcome::ExitedAbnormally { .. } => write!(f, "exited abnormally"),
            ProcessOutcome::SpawnFailed(e) => write!(f, "failed to spawn: {}", e),
            ProcessOutcome::PipeBroken => write!(f, "input pipe broken"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Something a process reported after it was spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEventKind {
    /// The process is gone
    Exited(ProcessOutcome),
    /// A stderr line matched the fatal-error pattern
    Diagnostic(String),
}

/// Event posted by a process's monitor tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    /// Generation of the handle that produced the event
    pub generation: u64,
    pub kind: ProcessEventKind,
}

/// Classifies encoder stderr lines
#[derive(Debug, Clone, Default)]
pub struct DiagnosticFilter {
    fatal: Option<Regex>,
}

impl DiagnosticFilter {
    pub fn new(fatal: Option<Regex>) -> Self {
        Self { fatal }
    }

    /// An empty pattern forwards nothing
    pub fn from_pattern(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self::new(Some(Regex::new(pattern)?)))
    }

    /// Periodic progress output, too frequent to log
    pub fn is_progress(&self, line: &str) -> bool {
        line.contains("frame=") || line.contains("fps=")
    }

    pub fn is_fatal(&self, line: &str) -> bool {
        self.fatal.as_ref().is_some_and(|re| re.is_match(line))
    }
}

/// Result of delivering one chunk to the process input
///
/// A pipe that is full does not produce an outcome: the write future stays
/// pending until the process drains its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Delivered(usize),
    PipeBroken,
    Failed(String),
}

/// Writable end of a process's stdin
///
/// Taken out of the handle for the duration of a write and returned with the
/// outcome. Dropping it closes the pipe.
#[derive(Debug)]
pub struct StdinSink {
    generation: u64,
    stdin: ChildStdin,
}

impl StdinSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write the whole chunk, suspending while the pipe is full
    pub async fn write(mut self, chunk: Bytes) -> (Self, WriteOutcome) {
        let outcome = match self.stdin.write_all(&chunk).await {
            Ok(()) => WriteOutcome::Delivered(chunk.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => WriteOutcome::PipeBroken,
            Err(e) => WriteOutcome::Failed(e.to_string()),
        };
        (self, outcome)
    }
}

/// Handle to a running encoder process
pub struct ProcessHandle {
    /// OS process ID (absent if the process already exited at spawn)
    pid: Option<u32>,

    /// Monotonic per-session spawn counter
    generation: u64,

    /// Destination the process was started with
    destination: Destination,

    /// Process input, `None` while a write is in flight or after close
    stdin: Option<StdinSink>,

    /// Latest exit observation from the monitor task
    exit_rx: watch::Receiver<Option<ProcessOutcome>>,

    /// Asks the monitor task to hard-kill the process
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Spawn a process with piped stdin/stderr and start monitoring it
    ///
    /// Dropping the returned handle kills the process.
    pub fn spawn(
        spec: &CommandSpec,
        destination: Destination,
        generation: u64,
        events: mpsc::UnboundedSender<ProcessEvent>,
        filter: Arc<DiagnosticFilter>,
    ) -> Result<Self, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ProcessError::Spawn {
            program: spec.program.to_string_lossy().into_owned(),
            source: e,
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or(ProcessError::MissingPipe("stdin"))?;
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stderr) = stderr {
            tokio::spawn(read_diagnostics(
                stderr,
                pid,
                generation,
                filter,
                events.clone(),
            ));
        }
        tokio::spawn(watch_exit(child, pid, generation, kill_rx, exit_tx, events));

        tracing::info!(
            pid = ?pid,
            generation,
            destination = %destination,
            "Encoder process spawned"
        );

        Ok(Self {
            pid,
            generation,
            destination,
            stdin: Some(StdinSink { generation, stdin }),
            exit_rx,
            kill_tx: Some(kill_tx),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if the process is still alive
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit outcome, once observed
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.exit_rx.borrow().clone()
    }

    /// Borrow the input for a write
    pub fn take_stdin(&mut self) -> Option<StdinSink> {
        self.stdin.take()
    }

    /// Give back the input after a write; sinks of other generations are dropped
    pub fn restore_stdin(&mut self, sink: StdinSink) {
        if sink.generation == self.generation {
            self.stdin = Some(sink);
        }
    }

    /// Two-phase shutdown
    ///
    /// Closes stdin so the encoder can flush, waits `stdin_grace`, then sends
    /// SIGTERM and waits `term_grace`, then kills. Safe to call repeatedly and
    /// on a process that already exited. Any [`StdinSink`] taken from this
    /// handle must have been dropped for the first phase to take effect.
    pub async fn terminate(&mut self, stdin_grace: Duration, term_grace: Duration) -> ProcessOutcome {
        self.stdin = None;

        if let Some(outcome) = self.outcome() {
            return outcome;
        }

        if let Some(outcome) = self.wait_exit(stdin_grace).await {
            tracing::debug!(pid = ?self.pid, %outcome, "Encoder exited after stdin closed");
            return outcome;
        }

        tracing::debug!(pid = ?self.pid, "Encoder still running after stdin closed, sending SIGTERM");
        self.signal_terminate();
        if let Some(outcome) = self.wait_exit(term_grace).await {
            return outcome;
        }

        tracing::warn!(
            pid = ?self.pid,
            "Encoder did not terminate gracefully, forcing kill"
        );
        self.kill();
        match self.wait_exit(term_grace).await {
            Some(outcome) => outcome,
            None => ProcessOutcome::ExitedAbnormally {
                code: None,
                signal: None,
            },
        }
    }

    /// Ask the monitor task to kill the process immediately
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn wait_exit(&mut self, grace: Duration) -> Option<ProcessOutcome> {
        let waited = tokio::time::timeout(grace, self.exit_rx.wait_for(Option::is_some))
            .await
            .map(|seen| seen.map(|outcome| outcome.clone()));
        match waited {
            Ok(Ok(outcome)) => outcome,
            // Monitor task is gone without reporting
            Ok(Err(_)) => Some(self.outcome().unwrap_or(ProcessOutcome::ExitedAbnormally {
                code: None,
                signal: None,
            })),
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        // No SIGTERM equivalent; go straight to kill
        self.kill();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("generation", &self.generation)
            .field("destination", &self.destination.redacted())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Wait for the process to exit (or for a kill request) and report it
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessOutcome>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Explicit kill, or the handle was dropped
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = ?pid, error = %e, "Kill failed");
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => ProcessOutcome::from_status(status),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for encoder");
            ProcessOutcome::ExitedAbnormally {
                code: None,
                signal: None,
            }
        }
    };

    tracing::info!(pid = ?pid, generation, %outcome, "Encoder process exited");

    exit_tx.send_replace(Some(outcome.clone()));
    let _ = events.send(ProcessEvent {
        generation,
        kind: ProcessEventKind::Exited(outcome),
    });
}

/// Log encoder stderr, forwarding the first fatal-looking line
async fn read_diagnostics(
    stderr: ChildStderr,
    pid: Option<u32>,
    generation: u64,
    filter: Arc<DiagnosticFilter>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut reported = false;

    loop {
        match next_line(&mut reader, &mut buf).await {
            Ok(true) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() || filter.is_progress(line) {
                    continue;
                }

                tracing::debug!(pid = ?pid, generation, "encoder: {}", line);

                if !reported && filter.is_fatal(line) {
                    reported = true;
                    let _ = events.send(ProcessEvent {
                        generation,
                        kind: ProcessEventKind::Diagnostic(line.to_string()),
                    });
                }
            }
            Ok(false) => break,
            Err(e) => {
                tracing::debug!(pid = ?pid, error = %e, "Encoder stderr closed");
                break;
            }
        }
    }
}

/// Read one `\n`- or `\r`-terminated line into `line`; `false` at end of stream
async fn next_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(!line.is_empty());
        }

        let room = MAX_DIAGNOSTIC_LINE.saturating_sub(line.len());
        match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            Some(end) => {
                line.extend_from_slice(&available[..end.min(room)]);
                reader.consume(end + 1);
                return Ok(true);
            }
            None => {
                let len = available.len();
                line.extend_from_slice(&available[..len.min(room)]);
                reader.consume(len);
            }
        }
    }
}

/// Process-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Encoder {0} pipe unavailable")]
    MissingPipe(&'static str),
}

impl ProcessError {
    pub fn outcome(&self) -> ProcessOutcome {
        ProcessOutcome::SpawnFailed(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn dest() -> Destination {
        Destination::parse("srt://127.0.0.1:9000").unwrap()
    }

    fn spawn(
        spec: &CommandSpec,
        generation: u64,
    ) -> (ProcessHandle, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Arc::new(DiagnosticFilter::from_pattern("(?i)connection refused").unwrap());
        let handle = ProcessHandle::spawn(spec, dest(), generation, tx, filter).unwrap();
        (handle, rx)
    }

    const GRACE: Duration = Duration::from_millis(300);

    #[tokio::test]
    async fn test_write_then_terminate_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let (mut handle, _rx) = spawn(&shell(&format!("cat > '{}'", out.display())), 1);

        let sink = handle.take_stdin().unwrap();
        let (sink, outcome) = sink.write(Bytes::from_static(b"hello ")).await;
        assert_eq!(outcome, WriteOutcome::Delivered(6));
        let (sink, outcome) = sink.write(Bytes::from_static(b"world")).await;
        assert_eq!(outcome, WriteOutcome::Delivered(5));
        handle.restore_stdin(sink);

        let outcome = handle.terminate(GRACE, GRACE).await;
        assert_eq!(outcome, ProcessOutcome::ExitedCleanly);
        assert!(!handle.is_alive());
        assert_eq!(std::fs::read(&out).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = CommandSpec::new("/nonexistent/definitely-not-ffmpeg");
        let err = ProcessHandle::spawn(&spec, dest(), 1, tx, Arc::default()).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(matches!(err.outcome(), ProcessOutcome::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_abnormal_exit_is_reported_with_generation() {
        let (handle, mut rx) = spawn(&shell("exit 3"), 7);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation, 7);
        assert_eq!(
            event.kind,
            ProcessEventKind::Exited(ProcessOutcome::ExitedAbnormally {
                code: Some(3),
                signal: None
            })
        );
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_pipe_broken() {
        let (mut handle, mut rx) = spawn(&shell("exec 0<&-; exit 1"), 1);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;

        let sink = handle.take_stdin().unwrap();
        let (_sink, outcome) = sink.write(Bytes::from(vec![0u8; 1 << 16])).await;
        assert_eq!(outcome, WriteOutcome::PipeBroken);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_to_sigterm() {
        let (mut handle, _rx) = spawn(&shell("exec sleep 30"), 1);
        let outcome = handle.terminate(Duration::from_millis(100), Duration::from_secs(5)).await;
        assert_eq!(
            outcome,
            ProcessOutcome::ExitedAbnormally {
                code: None,
                signal: Some(15)
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let (mut handle, _rx) = spawn(&shell("trap '' TERM; exec sleep 30"), 1);
        let outcome = handle
            .terminate(Duration::from_millis(100), Duration::from_millis(200))
            .await;
        assert_eq!(
            outcome,
            ProcessOutcome::ExitedAbnormally {
                code: None,
                signal: Some(9)
            }
        );
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (mut handle, _rx) = spawn(&shell("cat > /dev/null"), 1);
        let first = handle.terminate(GRACE, GRACE).await;
        let second = handle.terminate(GRACE, GRACE).await;
        assert_eq!(first, ProcessOutcome::ExitedCleanly);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_fatal_stderr_line_reported_once() {
        let script = "echo 'frame=  10 fps=25' >&2; \
                      echo 'Connection refused' >&2; \
                      echo 'Connection refused again' >&2; \
                      exit 1";
        let (_handle, mut rx) = spawn(&shell(script), 2);

        let mut diagnostics = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event.kind {
                ProcessEventKind::Diagnostic(line) => diagnostics.push(line),
                ProcessEventKind::Exited(_) => break,
            }
        }
        // Give the stderr reader a moment in case it lags behind the exit
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            if let ProcessEventKind::Diagnostic(line) = event.kind {
                diagnostics.push(line);
            }
        }
        assert_eq!(diagnostics, vec!["Connection refused".to_string()]);
    }

    #[tokio::test]
    async fn test_next_line_splits_carriage_returns() {
        let data: &[u8] = b"frame=1\rframe=2\rdone\n";
        let mut reader = BufReader::new(data);
        let mut line = Vec::new();
        let mut lines = Vec::new();
        while next_line(&mut reader, &mut line).await.unwrap() {
            lines.push(String::from_utf8(line.clone()).unwrap());
        }
        assert_eq!(lines, vec!["frame=1", "frame=2", "done"]);
    }

    #[test]
    fn test_filter_classification() {
        let filter = DiagnosticFilter::from_pattern("(?i)error opening output").unwrap();
        assert!(filter.is_progress("frame=  120 fps= 30 q=23.0"));
        assert!(filter.is_fatal("[srt] Error opening output srt://x"));
        assert!(!filter.is_fatal("Stream mapping:"));
        assert!(!DiagnosticFilter::default().is_fatal("Error opening output"));
    }
}

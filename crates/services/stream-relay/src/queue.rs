//! Write queue for media chunks
//!
//! Buffers chunks between the connection (which never waits) and the encoder's
//! stdin (which pushes back when the encoder falls behind). At most one write
//! is in flight; the next chunk is only handed to the pipe once the previous
//! one was fully delivered or definitively failed.

use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use crate::process::{StdinSink, WriteOutcome};

type WriteFuture = Pin<Box<dyn Future<Output = (StdinSink, WriteOutcome)> + Send>>;

/// The single write currently handed to the pipe
struct InFlight {
    len: usize,
    future: WriteFuture,
}

/// Completed write, as reported by [`WriteQueue::write_completed`]
#[derive(Debug)]
pub struct WriteCompletion {
    pub sink: StdinSink,
    pub outcome: WriteOutcome,
    /// Size of the chunk that was being written
    pub len: usize,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued_chunks: usize,
    pub queued_bytes: usize,
    pub draining: bool,
    pub delivered_chunks: u64,
    pub delivered_bytes: u64,
    pub rejected_chunks: u64,
}

/// FIFO of pending chunks with single-flight drain
pub struct WriteQueue {
    /// Chunks not yet handed to the pipe
    pending: VecDeque<Bytes>,

    /// Bytes in `pending`
    pending_bytes: usize,

    /// Write in progress; `Some` means the drain loop is running
    in_flight: Option<InFlight>,

    /// Upper bound on pending + in-flight bytes
    max_bytes: usize,

    /// Backlog warning already logged for the current build-up
    warned: bool,

    /// Session ID for logging
    session_id: String,

    delivered_chunks: u64,
    delivered_bytes: u64,
    rejected_chunks: u64,
}

impl WriteQueue {
    /// Create a new write queue
    pub fn new(max_bytes: usize, session_id: String) -> Self {
        Self {
            pending: VecDeque::new(),
            pending_bytes: 0,
            in_flight: None,
            max_bytes,
            warned: false,
            session_id,
            delivered_chunks: 0,
            delivered_bytes: 0,
            rejected_chunks: 0,
        }
    }

    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = session_id;
    }

    /// Append a chunk; never waits
    pub fn enqueue(&mut self, chunk: Bytes) -> Result<(), QueueError> {
        let queued = self.queued_bytes();
        if queued + chunk.len() > self.max_bytes {
            self.rejected_chunks += 1;
            tracing::warn!(
                session_id = %self.session_id,
                queued_bytes = queued,
                chunk_bytes = chunk.len(),
                max_bytes = self.max_bytes,
                "Write queue full, dropping chunk"
            );
            return Err(QueueError::Full {
                queued,
                limit: self.max_bytes,
            });
        }

        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);

        if !self.warned && self.queued_bytes() > self.max_bytes / 2 {
            self.warned = true;
            tracing::warn!(
                session_id = %self.session_id,
                queued_bytes = self.queued_bytes(),
                queued_chunks = self.pending.len(),
                max_bytes = self.max_bytes,
                "Encoder falling behind, write backlog above half capacity"
            );
        }

        Ok(())
    }

    /// Hand the next chunk to the pipe if the drain loop is idle
    ///
    /// Gives the sink back when there is nothing to write or a write is
    /// already in flight.
    pub fn start_next(&mut self, sink: StdinSink) -> Result<(), StdinSink> {
        if self.in_flight.is_some() {
            return Err(sink);
        }
        let Some(chunk) = self.pending.pop_front() else {
            self.warned = false;
            return Err(sink);
        };

        let len = chunk.len();
        self.pending_bytes -= len;
        self.in_flight = Some(InFlight {
            len,
            future: Box::pin(sink.write(chunk)),
        });
        Ok(())
    }

    /// Resolves when the in-flight write finishes; pending forever when idle
    ///
    /// Cancel safe: dropping this future leaves the write in flight.
    pub async fn write_completed(&mut self) -> WriteCompletion {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };

        let (sink, outcome) = (&mut in_flight.future).await;
        let len = in_flight.len;
        self.in_flight = None;

        if let WriteOutcome::Delivered(n) = outcome {
            self.delivered_chunks += 1;
            self.delivered_bytes += n as u64;
        }

        WriteCompletion { sink, outcome, len }
    }

    /// Drop every pending chunk and abandon the in-flight write
    ///
    /// The abandoned write's sink is dropped, closing the pipe. Returns the
    /// number of chunks discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len() + usize::from(self.in_flight.is_some());
        if dropped > 0 {
            tracing::debug!(
                session_id = %self.session_id,
                dropped_chunks = dropped,
                dropped_bytes = self.queued_bytes(),
                "Write queue cleared"
            );
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.in_flight = None;
        self.warned = false;
        dropped
    }

    /// Reset delivery counters for a new process run
    pub fn begin_run(&mut self) {
        self.delivered_chunks = 0;
        self.delivered_bytes = 0;
    }

    /// Whether a write is in flight
    pub fn is_draining(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Chunks waiting behind the in-flight write
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    /// Pending plus in-flight bytes
    pub fn queued_bytes(&self) -> usize {
        self.pending_bytes + self.in_flight.as_ref().map_or(0, |f| f.len)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued_chunks: self.pending.len() + usize::from(self.in_flight.is_some()),
            queued_bytes: self.queued_bytes(),
            draining: self.is_draining(),
            delivered_chunks: self.delivered_chunks,
            delivered_bytes: self.delivered_bytes,
            rejected_chunks: self.rejected_chunks,
        }
    }
}

/// Queue-related errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Write queue full ({queued} of {limit} bytes buffered)")]
    Full { queued: usize, limit: usize },
}

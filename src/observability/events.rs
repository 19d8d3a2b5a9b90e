//! Structured events emitted during a tee run.
//!
//! The orchestrator does not log through a global logger. It is handed an
//! [`EventSink`] and reports everything that happens through it; the sink
//! decides whether events become log lines, metrics, or test assertions.

use crate::task::TaskState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by the orchestrator, the tee and consumer tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum TeeEvent {
    /// A run started with the given number of branches.
    RunStarted {
        /// Number of branches.
        branches: usize,
    },

    /// A consumer task began executing.
    ConsumerStarted {
        /// Branch the consumer is bound to.
        branch: usize,
    },

    /// A consumer task reached a terminal state. Its read end is closed.
    ConsumerFinished {
        /// Branch the consumer was bound to.
        branch: usize,
        /// Terminal state.
        state: TaskState,
        /// Error message when the consumer failed.
        error: Option<String>,
    },

    /// A chunk was read from the source and written to every open branch.
    ChunkBroadcast {
        /// Chunk length in bytes.
        bytes: usize,
        /// Number of branches that received it.
        branches: usize,
    },

    /// A branch stopped receiving data while the others continue.
    BranchDetached {
        /// Index of the branch.
        branch: usize,
        /// Why it was detached.
        reason: String,
    },

    /// The source reached end of stream.
    SourceExhausted {
        /// Total bytes read from the source.
        total_bytes: u64,
        /// Number of chunks read.
        chunks: u64,
    },

    /// The drive loop failed and every branch was closed.
    DriveFailed {
        /// The error message.
        message: String,
    },

    /// The run deadline elapsed and every branch was cancelled.
    DeadlineElapsed {
        /// The configured deadline.
        deadline: Duration,
    },

    /// The run finished and every consumer task was joined.
    RunFinished {
        /// Wall-clock time of the whole run.
        elapsed: Duration,
        /// Whether every consumer produced a result.
        succeeded: bool,
    },
}

impl fmt::Display for TeeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeeEvent::RunStarted { branches } => write!(f, "Run started ({} branches)", branches),
            TeeEvent::ConsumerStarted { branch } => write!(f, "Consumer {} started", branch),
            TeeEvent::ConsumerFinished {
                branch,
                state,
                error,
            } => match error {
                Some(e) => write!(f, "Consumer {} {:?}: {}", branch, state, e),
                None => write!(f, "Consumer {} {:?}", branch, state),
            },
            TeeEvent::ChunkBroadcast { bytes, branches } => {
                write!(f, "Chunk of {} bytes sent to {} branches", bytes, branches)
            }
            TeeEvent::BranchDetached { branch, reason } => {
                write!(f, "Branch {} detached: {}", branch, reason)
            }
            TeeEvent::SourceExhausted {
                total_bytes,
                chunks,
            } => write!(
                f,
                "Source exhausted after {} bytes in {} chunks",
                total_bytes, chunks
            ),
            TeeEvent::DriveFailed { message } => write!(f, "Drive loop failed: {}", message),
            TeeEvent::DeadlineElapsed { deadline } => {
                write!(f, "Deadline of {:?} elapsed", deadline)
            }
            TeeEvent::RunFinished { elapsed, succeeded } => {
                let outcome = if *succeeded { "succeeded" } else { "failed" };
                write!(f, "Run {} in {:?}", outcome, elapsed)
            }
        }
    }
}

/// Receiver of [`TeeEvent`]s.
///
/// Called from the driver thread and from consumer threads, so
/// implementations must be cheap and must not block on the tee itself.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn emit(&self, event: &TeeEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: &TeeEvent) {
        (**self).emit(event)
    }
}

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &TeeEvent) {}
}

/// Forwards every event to several sinks, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// An empty fanout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are attached.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &TeeEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

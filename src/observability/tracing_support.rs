//! Tracing integration for structured logging and spans.

use super::events::{EventSink, TeeEvent};
use crate::task::TaskState;
use tracing::{Level, Span, span};

/// An [`EventSink`] that turns events into `tracing` records.
///
/// The library never installs a subscriber; applications do.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    /// Whether to log every broadcast chunk (at `TRACE`).
    pub chunk_events: bool,
}

impl Default for TracingSink {
    fn default() -> Self {
        Self {
            chunk_events: false, // One record per chunk is noisy
        }
    }
}

impl TracingSink {
    /// Log everything, including individual chunks.
    pub fn verbose() -> Self {
        Self { chunk_events: true }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &TeeEvent) {
        match event {
            TeeEvent::RunStarted { branches } => {
                tracing::info!(branches = branches, "tee run started");
            }
            TeeEvent::ConsumerStarted { branch } => {
                tracing::debug!(branch = branch, "consumer started");
            }
            TeeEvent::ConsumerFinished {
                branch,
                state: TaskState::Failed,
                error,
            } => {
                tracing::warn!(
                    branch = branch,
                    error = error.as_deref().unwrap_or("unknown"),
                    "consumer failed"
                );
            }
            TeeEvent::ConsumerFinished { branch, state, .. } => {
                tracing::debug!(branch = branch, state = ?state, "consumer finished");
            }
            TeeEvent::ChunkBroadcast { bytes, branches } => {
                if self.chunk_events {
                    tracing::trace!(bytes = bytes, branches = branches, "chunk broadcast");
                }
            }
            TeeEvent::BranchDetached { branch, reason } => {
                tracing::warn!(branch = branch, reason = %reason, "branch detached");
            }
            TeeEvent::SourceExhausted {
                total_bytes,
                chunks,
            } => {
                tracing::debug!(total_bytes = total_bytes, chunks = chunks, "source exhausted");
            }
            TeeEvent::DriveFailed { message } => {
                tracing::error!(error = %message, "drive loop failed");
            }
            TeeEvent::DeadlineElapsed { deadline } => {
                tracing::warn!(deadline = ?deadline, "deadline elapsed, cancelling branches");
            }
            TeeEvent::RunFinished { elapsed, succeeded } => {
                tracing::info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    succeeded = succeeded,
                    "tee run finished"
                );
            }
        }
    }
}

/// Create a span covering a whole run.
#[inline]
pub fn span_run(branches: usize) -> Span {
    span!(Level::INFO, "tee_run", branches = branches)
}

/// Create a span for a consumer task.
///
/// Consumer threads do not inherit the caller's span, so the parent is
/// passed explicitly.
#[inline]
pub fn span_branch(parent: &Span, branch: usize) -> Span {
    span!(parent: parent, Level::DEBUG, "branch", branch = branch)
}

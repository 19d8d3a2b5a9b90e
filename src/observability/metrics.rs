//! Metrics collection using metrics-rs.

use super::events::{EventSink, TeeEvent};
use crate::task::TaskState;
use metrics::{Unit, counter, histogram};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const SOURCE_BYTES: &str = "riverfork_source_bytes";
const CHUNKS: &str = "riverfork_chunks";
const BRANCHES_DETACHED: &str = "riverfork_branches_detached";
const CONSUMER_FAILURES: &str = "riverfork_consumer_failures";
const RUN_DURATION_NS: &str = "riverfork_run_duration_ns";
const RUNS: &str = "riverfork_runs";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(SOURCE_BYTES, Unit::Bytes, "Bytes read from tee sources");
    metrics::describe_counter!(CHUNKS, Unit::Count, "Chunks broadcast to branches");
    metrics::describe_counter!(
        BRANCHES_DETACHED,
        Unit::Count,
        "Branches detached after their reader went away"
    );
    metrics::describe_counter!(
        CONSUMER_FAILURES,
        Unit::Count,
        "Consumer tasks that ended in failure"
    );
    metrics::describe_histogram!(
        RUN_DURATION_NS,
        Unit::Nanoseconds,
        "Wall-clock duration of a tee run"
    );
    metrics::describe_counter!(RUNS, Unit::Count, "Completed tee runs by outcome");
}

/// An [`EventSink`] that records counters and histograms.
///
/// Every metric carries a `tee` label so several tees in one process can be
/// told apart.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    tee: String,
}

impl MetricsSink {
    /// Create a metrics sink labelled with `tee`.
    pub fn new(tee: impl Into<String>) -> Self {
        init_metrics();
        Self { tee: tee.into() }
    }

    /// The label value.
    pub fn tee(&self) -> &str {
        &self.tee
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, event: &TeeEvent) {
        match event {
            TeeEvent::ChunkBroadcast { bytes, .. } => {
                counter!(SOURCE_BYTES, "tee" => self.tee.clone()).increment(*bytes as u64);
                counter!(CHUNKS, "tee" => self.tee.clone()).increment(1);
            }
            TeeEvent::BranchDetached { .. } => {
                counter!(BRANCHES_DETACHED, "tee" => self.tee.clone()).increment(1);
            }
            TeeEvent::ConsumerFinished {
                state: TaskState::Failed,
                ..
            } => {
                counter!(CONSUMER_FAILURES, "tee" => self.tee.clone()).increment(1);
            }
            TeeEvent::RunFinished { elapsed, succeeded } => {
                histogram!(RUN_DURATION_NS, "tee" => self.tee.clone())
                    .record(elapsed.as_nanos() as f64);
                let outcome = if *succeeded { "success" } else { "failure" };
                counter!(RUNS, "tee" => self.tee.clone(), "outcome" => outcome).increment(1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_init_metrics_idempotent() {
        init_metrics();
        init_metrics();
        assert!(METRICS_INITIALIZED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_recording_without_recorder() {
        // No recorder installed: recording is a no-op and must not panic
        let sink = MetricsSink::new("upload");
        assert_eq!(sink.tee(), "upload");
        sink.emit(&TeeEvent::ChunkBroadcast {
            bytes: 64,
            branches: 2,
        });
        sink.emit(&TeeEvent::RunFinished {
            elapsed: Duration::from_millis(1),
            succeeded: false,
        });
    }
}

//! Observability: structured events, tracing and metrics.
//!
//! A run reports what happens through an injected [`EventSink`]. Three sinks
//! ship with the crate and can be combined with [`FanoutSink`]:
//!
//! - [`TracingSink`]: structured log records via `tracing` (the default)
//! - [`MetricsSink`]: counters and histograms via `metrics-rs`
//! - [`NullSink`]: discards everything
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `riverfork_source_bytes` | Counter | Bytes read from the source |
//! | `riverfork_chunks` | Counter | Chunks broadcast |
//! | `riverfork_branches_detached` | Counter | Branches detached (isolate policy) |
//! | `riverfork_consumer_failures` | Counter | Failed consumer tasks |
//! | `riverfork_run_duration_ns` | Histogram | Duration of a run |
//! | `riverfork_runs` | Counter | Runs by outcome |
//!
//! ## Example
//!
//! ```rust
//! use riverfork::observability::{FanoutSink, MetricsSink, TracingSink};
//! use riverfork::Orchestrator;
//!
//! let sink = FanoutSink::new()
//!     .with(TracingSink::default())
//!     .with(MetricsSink::new("uploads"));
//! let orchestrator = Orchestrator::new().with_sink(sink);
//! ```

mod events;
mod metrics;
mod tracing_support;

pub use self::events::{EventSink, FanoutSink, NullSink, TeeEvent};
pub use self::metrics::{MetricsSink, init_metrics};
pub use self::tracing_support::{TracingSink, span_branch, span_run};

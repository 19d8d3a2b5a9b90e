//! Orchestrator: runs consumers concurrently while the calling thread drives the tee.
//!
//! A run goes through these steps:
//!
//! 1. One branch is created per consumer.
//! 2. Every consumer task is spawned on its own thread, before any data moves.
//! 3. The tee's drive loop runs on the calling thread; it is the thread that
//!    blocks when a branch is full.
//! 4. Every consumer task is joined, in consumer order.
//! 5. The results are returned, or the first failure once everything has
//!    been joined. No thread is left running and no branch is left open.
//!
//! # Example
//!
//! ```rust
//! use riverfork::{Consumer, Orchestrator};
//! use std::io::{Cursor, Read};
//!
//! let orchestrator = Orchestrator::new();
//! let results = orchestrator
//!     .run(
//!         Cursor::new(b"HELLO WORLD".to_vec()),
//!         vec![
//!             Consumer::new(|reader| {
//!                 let mut text = String::new();
//!                 reader.read_to_string(&mut text)?;
//!                 Ok(text)
//!             }),
//!             Consumer::with_capacity(2, |reader| {
//!                 let mut text = String::new();
//!                 reader.read_to_string(&mut text)?;
//!                 Ok(text.to_lowercase())
//!             }),
//!         ],
//!     )
//!     .unwrap();
//!
//! assert_eq!(results, vec!["HELLO WORLD", "hello world"]);
//! ```

use crate::branch::{Branch, BranchControl, BranchReader, BranchStats, BranchWriter};
use crate::config::TeeConfig;
use crate::error::{BoxError, Error, Result};
use crate::observability::{EventSink, TeeEvent, TracingSink, span_run};
use crate::task::{ConsumerHandle, ConsumerTask, WorkFn};
use crate::tee::{DriveSummary, StreamTee};
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::Span;

/// A consumer work function and the capacity of the branch it reads.
pub struct Consumer<T> {
    capacity: Option<usize>,
    work: WorkFn<T>,
}

impl<T: Send + 'static> Consumer<T> {
    /// A consumer reading a branch of the configured default capacity.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&mut BranchReader) -> std::result::Result<T, BoxError> + Send + 'static,
    {
        Self {
            capacity: None,
            work: Box::new(work),
        }
    }

    /// A consumer reading a branch of `capacity` bytes.
    pub fn with_capacity<F>(capacity: usize, work: F) -> Self
    where
        F: FnOnce(&mut BranchReader) -> std::result::Result<T, BoxError> + Send + 'static,
    {
        Self {
            capacity: Some(capacity),
            work: Box::new(work),
        }
    }

    /// The requested branch capacity, if one was given.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

/// What happened during a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Bytes read from the source.
    pub total_bytes: u64,
    /// Chunks read from the source.
    pub chunks: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Branches detached under the isolate policy.
    pub detached: Vec<usize>,
    /// Final counters of every branch, in consumer order.
    pub branches: Vec<BranchStats>,
}

/// Runs a tee with one concurrent consumer per branch.
pub struct Orchestrator {
    config: TeeConfig,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// An orchestrator with the default configuration, logging through `tracing`.
    pub fn new() -> Self {
        Self::with_config(TeeConfig::default())
    }

    /// An orchestrator with the given configuration.
    pub fn with_config(config: TeeConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink::default()),
        }
    }

    /// Report events to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &TeeConfig {
        &self.config
    }

    /// Broadcast `source` to every consumer and collect their results.
    ///
    /// Results are returned in consumer order. On failure the first observed
    /// error is returned (the drive loop's, then the consumers' in order),
    /// after every consumer has been joined.
    pub fn run<R, T>(&self, source: R, consumers: Vec<Consumer<T>>) -> Result<Vec<T>>
    where
        R: Read,
        T: Send + 'static,
    {
        self.run_with_report(source, consumers)
            .map(|(results, _)| results)
    }

    /// Like [`Orchestrator::run`], also returning a [`RunReport`].
    pub fn run_with_report<R, T>(
        &self,
        source: R,
        consumers: Vec<Consumer<T>>,
    ) -> Result<(Vec<T>, RunReport)>
    where
        R: Read,
        T: Send + 'static,
    {
        let capacities: Vec<Option<usize>> = consumers.iter().map(Consumer::capacity).collect();

        self.execute(source, &capacities, |readers, env| {
            let mut handles = Vec::with_capacity(readers.len());
            for (reader, consumer) in readers.into_iter().zip(consumers) {
                match env.spawn(reader, consumer.work) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        env.abort_all(&e);
                        for handle in handles {
                            let _ = handle.join();
                        }
                        return Err(e);
                    }
                }
            }
            Ok(handles)
        })
    }

    /// Broadcast `source` to two consumers with different result types.
    pub fn run_pair<R, A, B>(&self, source: R, a: Consumer<A>, b: Consumer<B>) -> Result<(A, B)>
    where
        R: Read,
        A: Send + 'static,
        B: Send + 'static,
    {
        let capacities = [a.capacity, b.capacity];

        self.execute(source, &capacities, |readers, env| {
            let [reader_a, reader_b]: [BranchReader; 2] = readers
                .try_into()
                .map_err(|_| Error::InvalidConfig("a pair run needs exactly two branches".into()))?;

            let handle_a = env.spawn(reader_a, a.work)?;
            match env.spawn(reader_b, b.work) {
                Ok(handle_b) => Ok((handle_a, handle_b)),
                Err(e) => {
                    env.abort_all(&e);
                    let _ = handle_a.join();
                    Err(e)
                }
            }
        })
        .map(|(results, _)| results)
    }

    fn execute<R, J, S>(
        &self,
        source: R,
        capacities: &[Option<usize>],
        spawn: S,
    ) -> Result<(J::Output, RunReport)>
    where
        R: Read,
        J: Joinable,
        S: FnOnce(Vec<BranchReader>, &TaskEnv<'_>) -> Result<J>,
    {
        self.config.validate()?;

        let started = Instant::now();
        let span = span_run(capacities.len());
        let _entered = span.enter();
        self.sink.emit(&TeeEvent::RunStarted {
            branches: capacities.len(),
        });

        let result = self.execute_inner(source, capacities, spawn, &span, started);

        self.sink.emit(&TeeEvent::RunFinished {
            elapsed: started.elapsed(),
            succeeded: result.is_ok(),
        });
        result
    }

    fn execute_inner<R, J, S>(
        &self,
        source: R,
        capacities: &[Option<usize>],
        spawn: S,
        span: &Span,
        started: Instant,
    ) -> Result<(J::Output, RunReport)>
    where
        R: Read,
        J: Joinable,
        S: FnOnce(Vec<BranchReader>, &TaskEnv<'_>) -> Result<J>,
    {
        let (writers, readers) = self.open_branches(capacities)?;
        let controls: Vec<BranchControl> = writers.iter().map(BranchWriter::control).collect();

        let watchdog = match self.config.deadline {
            Some(deadline) => Some(Watchdog::start(
                deadline,
                controls.clone(),
                Arc::clone(&self.sink),
                &self.config.thread_name_prefix,
            )?),
            None => None,
        };

        let env = TaskEnv {
            sink: &self.sink,
            span,
            prefix: &self.config.thread_name_prefix,
            controls: &controls,
        };

        // Consumers must be attached before any data moves
        let tasks = match spawn(readers, &env) {
            Ok(tasks) => tasks,
            Err(e) => {
                drop(writers);
                if let Some(watchdog) = watchdog {
                    watchdog.stop();
                }
                return Err(e);
            }
        };

        let mut tee = StreamTee::new(source)
            .with_chunk_size(self.config.chunk_size)
            .with_policy(self.config.failure_policy)
            .with_sink(Arc::clone(&self.sink));
        for writer in writers {
            tee.attach(writer);
        }

        let drive = tee.drive_to_completion();
        let joined = tasks.join_all();

        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }

        let (output, summary) = settle(drive, joined)?;
        let report = RunReport {
            total_bytes: summary.total_bytes,
            chunks: summary.chunks,
            elapsed: started.elapsed(),
            detached: summary.detached,
            branches: controls.iter().map(BranchControl::stats).collect(),
        };

        Ok((output, report))
    }

    fn open_branches(
        &self,
        capacities: &[Option<usize>],
    ) -> Result<(Vec<BranchWriter>, Vec<BranchReader>)> {
        let mut writers = Vec::with_capacity(capacities.len());
        let mut readers = Vec::with_capacity(capacities.len());

        for (index, capacity) in capacities.iter().enumerate() {
            let capacity = capacity.unwrap_or(self.config.default_capacity);
            let (writer, reader) = Branch::with_capacity(capacity).with_index(index).split()?;
            writers.push(writer);
            readers.push(reader);
        }

        Ok((writers, readers))
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a spawn closure needs to start consumer tasks.
struct TaskEnv<'a> {
    sink: &'a Arc<dyn EventSink>,
    span: &'a Span,
    prefix: &'a str,
    controls: &'a [BranchControl],
}

impl TaskEnv<'_> {
    fn spawn<T: Send + 'static>(
        &self,
        reader: BranchReader,
        work: WorkFn<T>,
    ) -> Result<ConsumerHandle<T>> {
        let name = format!("{}-branch-{}", self.prefix, reader.index());
        ConsumerTask::from_work(reader, work)
            .with_name(name)
            .with_sink(Arc::clone(self.sink))
            .with_parent_span(self.span.clone())
            .spawn()
    }

    /// Abort every branch so already-started consumers finish.
    fn abort_all(&self, error: &Error) {
        let reason = error.to_string();
        for control in self.controls {
            control.abort(&reason);
        }
    }
}

/// Failures collected while joining consumer tasks.
struct JoinFailure {
    first: Error,
    others: Vec<Error>,
}

impl JoinFailure {
    fn new(first: Error) -> Self {
        Self {
            first,
            others: Vec::new(),
        }
    }

    fn push(failure: &mut Option<JoinFailure>, error: Error) {
        match failure {
            Some(f) => f.others.push(error),
            None => *failure = Some(JoinFailure::new(error)),
        }
    }

    /// A broken branch is a symptom when its own consumer failed; report the
    /// consumer's error instead.
    fn root_cause(self, drive_error: Error) -> Error {
        let Error::BrokenBranch { branch } = drive_error else {
            return drive_error;
        };

        std::iter::once(self.first)
            .chain(self.others)
            .find(|e| {
                e.branch() == Some(branch)
                    && matches!(
                        e,
                        Error::ConsumerFailure { .. } | Error::ConsumerPanicked { .. }
                    )
            })
            .unwrap_or(drive_error)
    }
}

/// A set of consumer handles joined in a fixed order.
trait Joinable {
    type Output;

    fn join_all(self) -> std::result::Result<Self::Output, JoinFailure>;
}

impl<T> Joinable for Vec<ConsumerHandle<T>> {
    type Output = Vec<T>;

    fn join_all(self) -> std::result::Result<Vec<T>, JoinFailure> {
        let mut values = Vec::with_capacity(self.len());
        let mut failure = None;

        for handle in self {
            match handle.join() {
                Ok(value) => values.push(value),
                Err(e) => JoinFailure::push(&mut failure, e),
            }
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(values),
        }
    }
}

impl<A, B> Joinable for (ConsumerHandle<A>, ConsumerHandle<B>) {
    type Output = (A, B);

    fn join_all(self) -> std::result::Result<(A, B), JoinFailure> {
        let a = self.0.join();
        let b = self.1.join();

        match (a, b) {
            (Ok(a), Ok(b)) => Ok((a, b)),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(JoinFailure::new(e)),
            (Err(first), Err(second)) => Err(JoinFailure {
                first,
                others: vec![second],
            }),
        }
    }
}

fn settle<O>(
    drive: Result<DriveSummary>,
    joined: std::result::Result<O, JoinFailure>,
) -> Result<(O, DriveSummary)> {
    match (drive, joined) {
        (Ok(summary), Ok(output)) => Ok((output, summary)),
        (Ok(_), Err(failure)) => Err(failure.first),
        (Err(error), Ok(_)) => Err(error),
        (Err(error), Err(failure)) => Err(failure.root_cause(error)),
    }
}

/// Cancels every branch if the run outlives its deadline.
struct Watchdog {
    finished: Arc<(Mutex<bool>, Condvar)>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn start(
        deadline: Duration,
        controls: Vec<BranchControl>,
        sink: Arc<dyn EventSink>,
        prefix: &str,
    ) -> Result<Self> {
        let finished = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&finished);

        let thread = thread::Builder::new()
            .name(format!("{}-watchdog", prefix))
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let done = lock.lock().unwrap_or_else(PoisonError::into_inner);
                let (done, _) = cvar
                    .wait_timeout_while(done, deadline, |done| !*done)
                    .unwrap_or_else(PoisonError::into_inner);
                if *done {
                    return;
                }
                drop(done);

                sink.emit(&TeeEvent::DeadlineElapsed { deadline });
                for control in &controls {
                    control.cancel();
                }
            })
            .map_err(Error::Spawn)?;

        Ok(Self { finished, thread })
    }

    fn stop(self) {
        let (lock, cvar) = &*self.finished;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
        let _ = self.thread.join();
    }
}

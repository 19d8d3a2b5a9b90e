//! Consumer tasks: a work function bound to one branch, run on its own thread.
//!
//! The task owns the branch read end and only lends it to the work function.
//! Whatever the function does (return a value, return an error, panic), the
//! read end is closed before the task publishes its outcome. A consumer that
//! stops early therefore always unblocks the tee instead of stalling every
//! other branch behind a full buffer.

use crate::branch::BranchReader;
use crate::error::{BoxError, Error, Result};
use crate::observability::{EventSink, NullSink, TeeEvent, span_branch};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::Span;

/// Signature of a consumer work function.
pub type WorkFn<T> =
    Box<dyn FnOnce(&mut BranchReader) -> std::result::Result<T, BoxError> + Send + 'static>;

/// Lifecycle of a consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The work function is still executing.
    Running,
    /// The work function returned a value.
    Succeeded,
    /// The work function returned an error or panicked.
    Failed,
}

impl TaskState {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// A consumer work function bound to a branch, ready to be spawned.
pub struct ConsumerTask<T> {
    reader: BranchReader,
    work: WorkFn<T>,
    name: String,
    sink: Arc<dyn EventSink>,
    parent: Span,
}

impl<T: Send + 'static> ConsumerTask<T> {
    /// Bind `work` to the branch behind `reader`.
    pub fn new<F>(reader: BranchReader, work: F) -> Self
    where
        F: FnOnce(&mut BranchReader) -> std::result::Result<T, BoxError> + Send + 'static,
    {
        Self::from_work(reader, Box::new(work))
    }

    pub(crate) fn from_work(reader: BranchReader, work: WorkFn<T>) -> Self {
        let name = format!("riverfork-branch-{}", reader.index());
        Self {
            reader,
            work,
            name,
            sink: Arc::new(NullSink),
            parent: Span::current(),
        }
    }

    /// Set the thread name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Report start and completion to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Record the task's span under `parent`.
    pub fn with_parent_span(mut self, parent: Span) -> Self {
        self.parent = parent;
        self
    }

    /// Start the task on a new thread.
    ///
    /// If the thread cannot be started the read end is dropped, and thereby
    /// closed, before the error is returned.
    pub fn spawn(self) -> Result<ConsumerHandle<T>> {
        let Self {
            mut reader,
            work,
            name,
            sink,
            parent,
        } = self;

        let branch = reader.index();
        let slot = Arc::new(Slot::new());
        let task_slot = Arc::clone(&slot);

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _span = span_branch(&parent, branch).entered();
                sink.emit(&TeeEvent::ConsumerStarted { branch });

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut reader)));

                // Release the branch before the outcome becomes visible
                reader.close_read();
                drop(reader);

                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(into_task_error(branch, error)),
                    Err(payload) => Err(Error::ConsumerPanicked {
                        branch,
                        message: panic_message(payload.as_ref()),
                    }),
                };

                let (state, error) = match &result {
                    Ok(_) => (TaskState::Succeeded, None),
                    Err(e) => (TaskState::Failed, Some(e.to_string())),
                };
                sink.emit(&TeeEvent::ConsumerFinished {
                    branch,
                    state,
                    error,
                });

                task_slot.complete(result);
            })
            .map_err(Error::Spawn)?;

        Ok(ConsumerHandle {
            branch,
            slot,
            thread,
        })
    }
}

/// Handle to a running consumer task.
///
/// The outcome is written exactly once, under the slot's lock, when the task
/// reaches a terminal state.
pub struct ConsumerHandle<T> {
    branch: usize,
    slot: Arc<Slot<T>>,
    thread: JoinHandle<()>,
}

impl<T> ConsumerHandle<T> {
    /// Index of the branch the task is bound to.
    pub fn branch(&self) -> usize {
        self.branch
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.slot.lock().state
    }

    /// Whether the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the task finishes or `timeout` elapses.
    ///
    /// Returns the state at that point.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskState {
        let guard = self.slot.lock();
        let (guard, _) = self
            .slot
            .done
            .wait_timeout_while(guard, timeout, |s| !s.state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        guard.state
    }

    /// Wait for the task's thread to exit and take its outcome.
    pub fn join(self) -> Result<T> {
        let branch = self.branch;

        if let Err(payload) = self.thread.join() {
            return Err(Error::ConsumerPanicked {
                branch,
                message: panic_message(payload.as_ref()),
            });
        }

        self.slot
            .lock()
            .outcome
            .take()
            .unwrap_or_else(|| {
                Err(Error::ConsumerPanicked {
                    branch,
                    message: "task exited without an outcome".into(),
                })
            })
    }
}

struct Slot<T> {
    inner: Mutex<SlotState<T>>,
    done: Condvar,
}

struct SlotState<T> {
    state: TaskState,
    outcome: Option<Result<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                state: TaskState::Running,
                outcome: None,
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: Result<T>) {
        let mut slot = self.lock();
        slot.state = if result.is_ok() {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        slot.outcome = Some(result);
        self.done.notify_all();
    }
}

/// Turn a work function's error into a task error.
///
/// Branch errors keep their kind, including ones that travelled through the
/// `std::io` adapters; anything else becomes [`Error::ConsumerFailure`].
fn into_task_error(branch: usize, error: BoxError) -> Error {
    let error = match error.downcast::<Error>() {
        Ok(error) => return *error,
        Err(other) => other,
    };

    match error.downcast::<io::Error>() {
        Ok(io_error) => match unwrap_io(*io_error) {
            Ok(error) => error,
            Err(io_error) => Error::consumer(branch, io_error),
        },
        Err(other) => Error::ConsumerFailure {
            branch,
            source: other,
        },
    }
}

fn unwrap_io(io_error: io::Error) -> std::result::Result<Error, io::Error> {
    if !io_error.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        return Err(io_error);
    }

    let kind = io_error.kind();
    match io_error.into_inner() {
        Some(inner) => inner
            .downcast::<Error>()
            .map(|error| *error)
            .map_err(|inner| io::Error::new(kind, inner)),
        None => Err(io::Error::from(kind)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Branch;
    use std::io::Read;

    #[test]
    fn test_task_succeeds_and_closes_branch() {
        let (mut writer, reader) = Branch::with_capacity(8).split().unwrap();
        let handle = ConsumerTask::new(reader, |reader| {
            let mut out = String::new();
            reader.read_to_string(&mut out)?;
            Ok(out)
        })
        .spawn()
        .unwrap();

        writer.write_chunk(b"payload").unwrap();
        writer.close_write();

        assert_eq!(handle.join().unwrap(), "payload");
        assert!(writer.is_reader_closed());
    }

    #[test]
    fn test_failure_closes_branch_and_unblocks_writer() {
        let (mut writer, reader) = Branch::with_capacity(2).with_index(1).split().unwrap();
        let handle = ConsumerTask::new(reader, |_reader| -> std::result::Result<(), BoxError> {
            Err("service unavailable".into())
        })
        .spawn()
        .unwrap();

        // Would block forever if the failed task kept its read end open
        let write = writer.write_chunk(&[0u8; 64]);
        assert!(matches!(write, Err(Error::BrokenBranch { branch: 1 })));

        match handle.join() {
            Err(Error::ConsumerFailure { branch, source }) => {
                assert_eq!(branch, 1);
                assert_eq!(source.to_string(), "service unavailable");
            }
            other => panic!("expected ConsumerFailure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let (mut writer, reader) = Branch::with_capacity(2).split().unwrap();
        let handle = ConsumerTask::new(reader, |_reader| -> std::result::Result<(), BoxError> {
            panic!("consumer exploded")
        })
        .spawn()
        .unwrap();

        assert!(writer.write_chunk(&[0u8; 64]).unwrap_err().is_broken_branch());

        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), TaskState::Failed);
        match handle.join() {
            Err(Error::ConsumerPanicked { message, .. }) => {
                assert_eq!(message, "consumer exploded")
            }
            other => panic!("expected ConsumerPanicked, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_branch_error_keeps_kind_through_io() {
        let (writer, reader) = Branch::with_capacity(4).split().unwrap();
        writer.abort("source failed");

        let handle = ConsumerTask::new(reader, |reader| {
            let mut out = Vec::new();
            reader.read_to_end(&mut out)?;
            Ok(out)
        })
        .spawn()
        .unwrap();

        assert!(matches!(
            handle.join(),
            Err(Error::UpstreamAborted { branch: 0, .. })
        ));
    }

    #[test]
    fn test_state_transitions() {
        let (writer, reader) = Branch::with_capacity(4).split().unwrap();
        let handle = ConsumerTask::new(reader, |reader| {
            let mut buf = [0u8; 4];
            Ok(reader.read_chunk(&mut buf)?)
        })
        .with_name("state-test")
        .spawn()
        .unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_millis(20)),
            TaskState::Running
        );
        assert!(!handle.is_finished());

        writer.close_write();
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            TaskState::Succeeded
        );
        assert_eq!(handle.branch(), 0);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_sink_sees_start_and_finish() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<TeeEvent>>);
        impl EventSink for Recorder {
            fn emit(&self, event: &TeeEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        let recorder = Arc::new(Recorder::default());
        let (writer, reader) = Branch::with_capacity(4).with_index(3).split().unwrap();
        writer.close_write();

        let sink: Arc<dyn EventSink> = recorder.clone();
        ConsumerTask::new(reader, |_| Ok(()))
            .with_sink(sink)
            .spawn()
            .unwrap()
            .join()
            .unwrap();

        let events = recorder.0.lock().unwrap();
        assert_eq!(events[0], TeeEvent::ConsumerStarted { branch: 3 });
        assert_eq!(
            events[1],
            TeeEvent::ConsumerFinished {
                branch: 3,
                state: TaskState::Succeeded,
                error: None
            }
        );
    }
}

//! Bounded branch buffer.
//!
//! A branch is a fixed-capacity byte channel with exactly one writer and one
//! reader. It provides the synchronization between the tee's drive loop and a
//! consumer:
//!
//! - the writer blocks while the buffer is full,
//! - the reader blocks while the buffer is empty,
//! - either end can be closed at any time, and closing wakes the other side.
//!
//! Closing the read end turns every pending and future write into
//! [`Error::BrokenBranch`], so a consumer that gives up can never leave the
//! writer blocked. Closing the write end lets the reader drain what is
//! buffered and then observe end of stream.
//!
//! # Example
//!
//! ```rust
//! use riverfork::branch::Branch;
//! use std::io::Read;
//! use std::thread;
//!
//! let (mut writer, mut reader) = Branch::with_capacity(4).split().unwrap();
//!
//! let consumer = thread::spawn(move || {
//!     let mut out = String::new();
//!     reader.read_to_string(&mut out).unwrap();
//!     out
//! });
//!
//! writer.write_chunk(b"HELLO WORLD").unwrap();
//! writer.close_write();
//!
//! assert_eq!(consumer.join().unwrap(), "HELLO WORLD");
//! ```

use crate::config::DEFAULT_CAPACITY;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Builder for a branch channel.
#[derive(Debug, Clone, Copy)]
pub struct Branch {
    index: usize,
    capacity: usize,
}

impl Branch {
    /// A branch with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A branch holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { index: 0, capacity }
    }

    /// Set the index used to attribute errors to this branch.
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Create the two ends of the branch.
    ///
    /// Fails if the capacity is zero.
    pub fn split(self) -> Result<(BranchWriter, BranchReader)> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "branch {} capacity must be at least 1",
                self.index
            )));
        }

        let shared = Arc::new(Shared {
            index: self.index,
            state: Mutex::new(BranchState {
                buffer: VecDeque::with_capacity(self.capacity.min(64 * 1024)),
                capacity: self.capacity,
                writer: WriteEnd::Open,
                read_closed: false,
                cancelled: false,
                bytes_written: 0,
                bytes_read: 0,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        });

        Ok((
            BranchWriter {
                shared: Arc::clone(&shared),
            },
            BranchReader { shared },
        ))
    }
}

impl Default for Branch {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    index: usize,
    state: Mutex<BranchState>,
    readable: Condvar,
    writable: Condvar,
}

struct BranchState {
    buffer: VecDeque<u8>,
    capacity: usize,
    writer: WriteEnd,
    read_closed: bool,
    cancelled: bool,
    bytes_written: u64,
    bytes_read: u64,
}

enum WriteEnd {
    Open,
    Closed,
    Aborted(String),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BranchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> BranchStats {
        let state = self.lock();
        BranchStats {
            index: self.index,
            capacity: state.capacity,
            buffered: state.buffer.len(),
            bytes_written: state.bytes_written,
            bytes_read: state.bytes_read,
            write_closed: !matches!(state.writer, WriteEnd::Open),
            read_closed: state.read_closed,
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.buffer.clear();
        tracing::debug!(branch = self.index, "branch cancelled");
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Write end of a branch, owned by the tee.
///
/// Dropping a writer that was not closed aborts the branch, so the reader
/// sees [`Error::UpstreamAborted`] instead of a truncated stream that looks
/// complete.
pub struct BranchWriter {
    shared: Arc<Shared>,
}

impl BranchWriter {
    /// Index of the branch.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Write the whole chunk, blocking while the buffer is full.
    ///
    /// Bytes are accepted in pieces as the reader frees space. Fails with
    /// [`Error::BrokenBranch`] as soon as the read end is closed, even if the
    /// writer is currently blocked.
    pub fn write_chunk(&mut self, mut data: &[u8]) -> Result<()> {
        let mut state = self.shared.lock();

        loop {
            self.check_writable(&state)?;
            if data.is_empty() {
                return Ok(());
            }

            let accepted = Self::accept(&mut state, data);
            if accepted == 0 {
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            data = &data[accepted..];
            self.shared.readable.notify_one();
        }
    }

    /// Write as many bytes as fit, blocking only until at least one does.
    pub fn write_partial(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.shared.lock();

        loop {
            self.check_writable(&state)?;
            if data.is_empty() {
                return Ok(0);
            }

            let accepted = Self::accept(&mut state, data);
            if accepted > 0 {
                self.shared.readable.notify_one();
                return Ok(accepted);
            }

            state = self
                .shared
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn check_writable(&self, state: &BranchState) -> Result<()> {
        let branch = self.shared.index;
        if state.cancelled {
            return Err(Error::Cancelled { branch });
        }
        if !matches!(state.writer, WriteEnd::Open) {
            return Err(Error::ClosedBranch { branch });
        }
        if state.read_closed {
            return Err(Error::BrokenBranch { branch });
        }
        Ok(())
    }

    fn accept(state: &mut BranchState, data: &[u8]) -> usize {
        let free = state.capacity - state.buffer.len();
        let n = free.min(data.len());
        state.buffer.extend(&data[..n]);
        state.bytes_written += n as u64;
        n
    }

    /// Signal that no more data will arrive.
    ///
    /// The reader drains what is buffered and then sees end of stream.
    /// Idempotent.
    pub fn close_write(&self) {
        let mut state = self.shared.lock();
        if matches!(state.writer, WriteEnd::Open) {
            state.writer = WriteEnd::Closed;
            tracing::trace!(branch = self.shared.index, "write end closed");
            self.shared.readable.notify_all();
        }
    }

    /// Close the write end with an error.
    ///
    /// The reader drains what is buffered and then gets
    /// [`Error::UpstreamAborted`]. No effect if the write end is already closed.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut state = self.shared.lock();
        if matches!(state.writer, WriteEnd::Open) {
            let reason = reason.into();
            tracing::debug!(branch = self.shared.index, reason = %reason, "write end aborted");
            state.writer = WriteEnd::Aborted(reason);
            self.shared.readable.notify_all();
        }
    }

    /// Whether the write end is still open.
    pub fn is_open(&self) -> bool {
        matches!(self.shared.lock().writer, WriteEnd::Open)
    }

    /// Whether the reader has abandoned the branch.
    pub fn is_reader_closed(&self) -> bool {
        self.shared.lock().read_closed
    }

    /// Snapshot of the branch counters.
    pub fn stats(&self) -> BranchStats {
        self.shared.stats()
    }

    pub(crate) fn control(&self) -> BranchControl {
        BranchControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl io::Write for BranchWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_partial(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BranchWriter {
    fn drop(&mut self) {
        self.abort("writer dropped before closing");
    }
}

/// Read end of a branch, owned by a consumer.
///
/// Dropping the reader closes the read end.
pub struct BranchReader {
    shared: Arc<Shared>,
}

impl BranchReader {
    /// Index of the branch.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Read into `buf`, blocking until at least one byte is available.
    ///
    /// Returns `Ok(0)` at end of stream: the write end is closed and the
    /// buffer is fully drained. If the writer aborted, its error is returned
    /// once the buffered bytes have been read.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let branch = self.shared.index;
        let mut state = self.shared.lock();

        loop {
            if state.cancelled {
                return Err(Error::Cancelled { branch });
            }
            if state.read_closed {
                return Err(Error::ClosedBranch { branch });
            }
            if buf.is_empty() {
                return Ok(0);
            }

            if !state.buffer.is_empty() {
                let n = buf.len().min(state.buffer.len());
                for (dst, src) in buf.iter_mut().zip(state.buffer.drain(..n)) {
                    *dst = src;
                }
                state.bytes_read += n as u64;
                self.shared.writable.notify_one();
                return Ok(n);
            }

            if let WriteEnd::Aborted(reason) = &state.writer {
                return Err(Error::UpstreamAborted {
                    branch,
                    reason: reason.clone(),
                });
            }
            if matches!(state.writer, WriteEnd::Closed) {
                return Ok(0);
            }

            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Abandon the branch.
    ///
    /// Buffered bytes are discarded and any blocked or future write fails with
    /// [`Error::BrokenBranch`]. Idempotent.
    pub fn close_read(&self) {
        let mut state = self.shared.lock();
        if !state.read_closed {
            state.read_closed = true;
            state.buffer.clear();
            tracing::trace!(branch = self.shared.index, "read end closed");
            self.shared.writable.notify_all();
        }
    }

    /// Whether the stream has ended and everything has been read.
    pub fn is_eof(&self) -> bool {
        let state = self.shared.lock();
        state.buffer.is_empty() && matches!(state.writer, WriteEnd::Closed)
    }

    /// Snapshot of the branch counters.
    pub fn stats(&self) -> BranchStats {
        self.shared.stats()
    }
}

impl io::Read for BranchReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_chunk(buf)?)
    }
}

impl Drop for BranchReader {
    fn drop(&mut self) {
        self.close_read();
    }
}

/// Out-of-band handle used to cancel a branch from a third thread.
#[derive(Clone)]
pub(crate) struct BranchControl {
    shared: Arc<Shared>,
}

impl BranchControl {
    /// Fail every blocked and future operation on both ends with
    /// [`Error::Cancelled`].
    pub(crate) fn cancel(&self) {
        self.shared.cancel();
    }

    /// Abort the write end, as [`BranchWriter::abort`] does.
    pub(crate) fn abort(&self, reason: &str) {
        let mut state = self.shared.lock();
        if matches!(state.writer, WriteEnd::Open) {
            state.writer = WriteEnd::Aborted(reason.to_string());
            self.shared.readable.notify_all();
        }
    }

    pub(crate) fn stats(&self) -> BranchStats {
        self.shared.stats()
    }
}

/// Counters for a single branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchStats {
    /// Index of the branch.
    pub index: usize,
    /// Fixed buffer capacity in bytes.
    pub capacity: usize,
    /// Bytes currently buffered.
    pub buffered: usize,
    /// Total bytes accepted from the writer.
    pub bytes_written: u64,
    /// Total bytes handed to the reader.
    pub bytes_read: u64,
    /// Whether the write end is closed (cleanly or aborted).
    pub write_closed: bool,
    /// Whether the read end is closed.
    pub read_closed: bool,
}

//! Stream tee: reads a source once and broadcasts it to every branch.
//!
//! The drive loop reads a chunk from the source and writes the identical
//! bytes to each open branch, in attach order, before reading the next chunk.
//! Every branch therefore sees the full source, in source order, and no branch
//! can get ahead of another by more than one chunk plus its own buffer.
//!
//! A full branch blocks the whole loop. That is the backpressure, and it is
//! also why a consumer must close its read end when it stops reading.
//!
//! # Example
//!
//! ```rust
//! use riverfork::StreamTee;
//! use std::io::{Cursor, Read};
//! use std::thread;
//!
//! let mut tee = StreamTee::new(Cursor::new(b"HELLO WORLD".to_vec()));
//! let readers = vec![tee.default_branch().unwrap(), tee.default_branch().unwrap()];
//!
//! let consumers: Vec<_> = readers
//!     .into_iter()
//!     .map(|mut reader| {
//!         thread::spawn(move || {
//!             let mut out = Vec::new();
//!             reader.read_to_end(&mut out).unwrap();
//!             out
//!         })
//!     })
//!     .collect();
//!
//! let summary = tee.drive_to_completion().unwrap();
//! assert_eq!(summary.total_bytes, 11);
//! for consumer in consumers {
//!     assert_eq!(consumer.join().unwrap(), b"HELLO WORLD");
//! }
//! ```

use crate::branch::{Branch, BranchReader, BranchWriter};
use crate::config::{DEFAULT_CAPACITY, FailurePolicy};
use crate::error::{Error, Result};
use crate::observability::{EventSink, TeeEvent, TracingSink};
use std::io::{self, Read};
use std::sync::Arc;

/// Broadcasts one byte source to any number of bounded branches.
pub struct StreamTee<R> {
    source: R,
    chunk_size: usize,
    policy: FailurePolicy,
    branches: Vec<BranchWriter>,
    sink: Arc<dyn EventSink>,
}

/// What a completed drive loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveSummary {
    /// Bytes read from the source.
    pub total_bytes: u64,
    /// Chunks read from the source.
    pub chunks: u64,
    /// Branches detached under [`FailurePolicy::Isolate`].
    pub detached: Vec<usize>,
    /// Whether the source was read to end of stream.
    pub exhausted: bool,
}

impl<R: Read> StreamTee<R> {
    /// Create a tee over `source` with the default chunk size.
    pub fn new(source: R) -> Self {
        Self {
            source,
            chunk_size: DEFAULT_CAPACITY,
            policy: FailurePolicy::default(),
            branches: Vec::new(),
            sink: Arc::new(TracingSink::default()),
        }
    }

    /// Set the maximum number of bytes read from the source at once.
    ///
    /// Values below 1 are raised to 1.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Set the branch failure policy.
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Report events to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Add a branch with the given capacity and return its read end.
    ///
    /// Branches are numbered in the order they are added.
    pub fn branch(&mut self, capacity: usize) -> Result<BranchReader> {
        let (writer, reader) = Branch::with_capacity(capacity)
            .with_index(self.branches.len())
            .split()?;
        self.branches.push(writer);
        Ok(reader)
    }

    /// Add a branch with the default capacity.
    pub fn default_branch(&mut self) -> Result<BranchReader> {
        self.branch(DEFAULT_CAPACITY)
    }

    /// Attach the write end of a branch created elsewhere.
    pub fn attach(&mut self, writer: BranchWriter) {
        self.branches.push(writer);
    }

    /// Number of attached branches.
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Read the source to end of stream, writing every chunk to every branch.
    ///
    /// On return the source has been dropped and every branch write end is
    /// closed: cleanly on success, aborted with the error otherwise, so
    /// readers always terminate.
    pub fn drive_to_completion(self) -> Result<DriveSummary> {
        let Self {
            mut source,
            chunk_size,
            policy,
            mut branches,
            sink,
        } = self;

        let mut summary = DriveSummary::default();
        let mut buf = vec![0u8; chunk_size];

        let result = loop {
            let n = match source.read(&mut buf) {
                Ok(0) => {
                    summary.exhausted = true;
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::SourceRead(e)),
            };

            summary.total_bytes += n as u64;
            summary.chunks += 1;

            if let Err(e) = broadcast(&mut branches, &buf[..n], policy, &mut summary, &*sink) {
                break Err(e);
            }

            if !branches.is_empty() && !branches.iter().any(BranchWriter::is_open) {
                // Every reader is gone; nobody needs the rest of the source
                break Ok(());
            }
        };

        drop(source);

        match &result {
            Ok(()) => {
                for writer in &branches {
                    writer.close_write();
                }
                if summary.exhausted {
                    sink.emit(&TeeEvent::SourceExhausted {
                        total_bytes: summary.total_bytes,
                        chunks: summary.chunks,
                    });
                }
            }
            Err(e) => {
                let reason = e.to_string();
                for writer in &branches {
                    writer.abort(reason.as_str());
                }
                sink.emit(&TeeEvent::DriveFailed { message: reason });
            }
        }

        result.map(|()| summary)
    }

    /// Tear the tee down without driving it.
    ///
    /// The source is dropped and every reader sees
    /// [`Error::UpstreamAborted`] once it has drained.
    pub fn close(self) {
        for writer in &self.branches {
            writer.abort("tee closed before the source was read");
        }
    }
}

fn broadcast(
    branches: &mut [BranchWriter],
    chunk: &[u8],
    policy: FailurePolicy,
    summary: &mut DriveSummary,
    sink: &dyn EventSink,
) -> Result<()> {
    let mut delivered = 0;

    for writer in branches.iter_mut() {
        if !writer.is_open() {
            continue;
        }

        match writer.write_chunk(chunk) {
            Ok(()) => delivered += 1,
            Err(e) if e.is_broken_branch() && policy == FailurePolicy::Isolate => {
                writer.close_write();
                summary.detached.push(writer.index());
                sink.emit(&TeeEvent::BranchDetached {
                    branch: writer.index(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    sink.emit(&TeeEvent::ChunkBroadcast {
        bytes: chunk.len(),
        branches: delivered,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const INPUT: &str = "This is the input data for testing";

    fn drain(mut reader: BranchReader, read_size: usize) -> thread::JoinHandle<Result<Vec<u8>>> {
        thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = vec![0u8; read_size];
            loop {
                let n = reader.read_chunk(&mut buf)?;
                if n == 0 {
                    return Ok(out);
                }
                out.extend_from_slice(&buf[..n]);
            }
        })
    }

    /// Yields its data, then fails.
    struct FailingSource {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection reset")),
                n => Ok(n),
            }
        }
    }

    /// Records whether it was dropped.
    struct TrackedSource {
        dropped: Arc<AtomicBool>,
    }

    impl Read for TrackedSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Drop for TrackedSource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Interrupts every other call.
    struct InterruptingSource {
        data: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for InterruptingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn test_writer_finishes_first() {
        // The whole input fits in one write; readers need several reads
        let mut tee = StreamTee::new(Cursor::new(INPUT.as_bytes().to_vec()));
        let a = drain(tee.default_branch().unwrap(), 5);
        let b = drain(tee.default_branch().unwrap(), 5);

        tee.drive_to_completion().unwrap();

        assert_eq!(a.join().unwrap().unwrap(), INPUT.as_bytes());
        assert_eq!(b.join().unwrap().unwrap(), INPUT.as_bytes());
    }

    #[test]
    fn test_reader_waits_on_writer() {
        // Buffer smaller than the input, readers ask for a lot
        let mut tee = StreamTee::new(Cursor::new(INPUT.as_bytes().to_vec())).with_chunk_size(2);
        let a = drain(tee.branch(2).unwrap(), 1024);
        let b = drain(tee.branch(2).unwrap(), 1024);

        let summary = tee.drive_to_completion().unwrap();

        assert_eq!(summary.total_bytes, INPUT.len() as u64);
        assert_eq!(summary.chunks, INPUT.len().div_ceil(2) as u64);
        assert_eq!(a.join().unwrap().unwrap(), INPUT.as_bytes());
        assert_eq!(b.join().unwrap().unwrap(), INPUT.as_bytes());
    }

    #[test]
    fn test_writer_no_reader() {
        let mut tee = StreamTee::new(Cursor::new(INPUT.as_bytes().to_vec())).with_chunk_size(2);
        let reader = tee.branch(2).unwrap();

        let driver = thread::spawn(move || tee.drive_to_completion());

        // Interrupt the blocked writer
        thread::sleep(Duration::from_millis(50));
        reader.close_read();

        let result = driver.join().unwrap();
        assert!(matches!(result, Err(Error::BrokenBranch { branch: 0 })));
    }

    #[test]
    fn test_drive_closes_source_and_branches() {
        let dropped = Arc::new(AtomicBool::new(false));
        let mut tee = StreamTee::new(TrackedSource {
            dropped: Arc::clone(&dropped),
        });
        let a = tee.default_branch().unwrap();
        let b = tee.default_branch().unwrap();

        let summary = tee.drive_to_completion().unwrap();

        assert!(summary.exhausted);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(a.is_eof());
        assert!(b.is_eof());
        assert!(a.stats().write_closed);
    }

    #[test]
    fn test_source_error_aborts_branches() {
        let mut tee = StreamTee::new(FailingSource {
            data: Cursor::new(b"partial".to_vec()),
        });
        let a = drain(tee.default_branch().unwrap(), 64);

        let result = tee.drive_to_completion();

        assert!(matches!(result, Err(Error::SourceRead(_))));
        assert!(matches!(
            a.join().unwrap(),
            Err(Error::UpstreamAborted { branch: 0, .. })
        ));
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let mut tee = StreamTee::new(InterruptingSource {
            data: Cursor::new(b"retry me".to_vec()),
            interrupt: false,
        })
        .with_chunk_size(3);
        let a = drain(tee.branch(4).unwrap(), 16);

        tee.drive_to_completion().unwrap();
        assert_eq!(a.join().unwrap().unwrap(), b"retry me");
    }

    #[test]
    fn test_isolate_keeps_healthy_branches() {
        let input: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let mut tee = StreamTee::new(Cursor::new(input.clone()))
            .with_chunk_size(16)
            .with_policy(FailurePolicy::Isolate);

        let quitter = tee.branch(16).unwrap();
        let healthy = drain(tee.branch(16).unwrap(), 7);
        quitter.close_read();

        let summary = tee.drive_to_completion().unwrap();

        assert_eq!(summary.detached, vec![0]);
        assert!(summary.exhausted);
        assert_eq!(healthy.join().unwrap().unwrap(), input);
    }

    #[test]
    fn test_isolate_stops_when_every_branch_detached() {
        let mut tee = StreamTee::new(Cursor::new(vec![7u8; 1024]))
            .with_chunk_size(8)
            .with_policy(FailurePolicy::Isolate);
        tee.branch(8).unwrap().close_read();

        let summary = tee.drive_to_completion().unwrap();

        assert!(!summary.exhausted);
        assert_eq!(summary.chunks, 1);
        assert_eq!(summary.detached, vec![0]);
    }

    #[test]
    fn test_close_without_driving() {
        let mut tee = StreamTee::new(Cursor::new(b"unused".to_vec()));
        let mut reader = tee.default_branch().unwrap();
        assert_eq!(tee.branch_count(), 1);

        tee.close();

        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read_chunk(&mut buf),
            Err(Error::UpstreamAborted { .. })
        ));
    }

    #[test]
    fn test_attach_external_writer() {
        let (writer, reader) = Branch::with_capacity(3).with_index(5).split().unwrap();
        let mut tee = StreamTee::new(Cursor::new(b"attached".to_vec()));
        tee.attach(writer);

        let out = drain(reader, 4);
        tee.drive_to_completion().unwrap();
        assert_eq!(out.join().unwrap().unwrap(), b"attached");
    }

    #[test]
    fn test_zero_capacity_branch_rejected() {
        let mut tee = StreamTee::new(Cursor::new(Vec::new()));
        assert!(matches!(tee.branch(0), Err(Error::InvalidConfig(_))));
        assert_eq!(tee.branch_count(), 0);
    }
}

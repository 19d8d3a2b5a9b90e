//! Error types for riverfork.

use std::io;
use thiserror::Error;

/// Result type alias using riverfork's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by consumer work functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for tee operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The source failed before reaching end of stream.
    #[error("source read failed: {0}")]
    SourceRead(#[source] io::Error),

    /// The branch reader went away while the writer still had data to deliver.
    #[error("branch {branch} is broken: reader closed before the stream ended")]
    BrokenBranch {
        /// Index of the branch.
        branch: usize,
    },

    /// Write attempted after the writer side of the branch was closed.
    #[error("branch {branch} is closed for writing")]
    ClosedBranch {
        /// Index of the branch.
        branch: usize,
    },

    /// A consumer work function returned an error.
    #[error("consumer on branch {branch} failed: {source}")]
    ConsumerFailure {
        /// Index of the branch the consumer was bound to.
        branch: usize,
        /// The error returned by the work function.
        #[source]
        source: BoxError,
    },

    /// A consumer work function panicked.
    #[error("consumer on branch {branch} panicked: {message}")]
    ConsumerPanicked {
        /// Index of the branch the consumer was bound to.
        branch: usize,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// The writer aborted the branch; the stream is incomplete.
    #[error("branch {branch} aborted upstream: {reason}")]
    UpstreamAborted {
        /// Index of the branch.
        branch: usize,
        /// Why the writer gave up.
        reason: String,
    },

    /// The run deadline elapsed while the branch was still in use.
    #[error("branch {branch} cancelled: deadline elapsed")]
    Cancelled {
        /// Index of the branch.
        branch: usize,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A consumer thread could not be started.
    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[source] io::Error),
}

impl Error {
    /// Wrap a consumer's error.
    pub fn consumer<E>(branch: usize, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::ConsumerFailure {
            branch,
            source: error.into(),
        }
    }

    /// Whether this is a [`Error::BrokenBranch`].
    pub fn is_broken_branch(&self) -> bool {
        matches!(self, Self::BrokenBranch { .. })
    }

    /// Whether this error came from a deadline cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The branch this error is attributed to, if any.
    pub fn branch(&self) -> Option<usize> {
        match self {
            Self::BrokenBranch { branch }
            | Self::ClosedBranch { branch }
            | Self::ConsumerFailure { branch, .. }
            | Self::ConsumerPanicked { branch, .. }
            | Self::UpstreamAborted { branch, .. }
            | Self::Cancelled { branch } => Some(*branch),
            Self::SourceRead(_) | Self::InvalidConfig(_) | Self::Spawn(_) => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match &error {
            Error::BrokenBranch { .. } => io::ErrorKind::BrokenPipe,
            Error::Cancelled { .. } => io::ErrorKind::TimedOut,
            Error::UpstreamAborted { .. } => io::ErrorKind::ConnectionAborted,
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_attribution() {
        assert_eq!(Error::BrokenBranch { branch: 3 }.branch(), Some(3));
        assert_eq!(Error::consumer(1, "boom").branch(), Some(1));
        assert_eq!(Error::InvalidConfig("x".into()).branch(), None);
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let err: io::Error = Error::BrokenBranch { branch: 0 }.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = Error::Cancelled { branch: 0 }.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let inner = err.into_inner().unwrap();
        assert!(inner.downcast_ref::<Error>().unwrap().is_cancelled());
    }

    #[test]
    fn test_consumer_error_display() {
        let err = Error::consumer(2, "upstream service rejected payload");
        assert_eq!(
            err.to_string(),
            "consumer on branch 2 failed: upstream service rejected payload"
        );
    }
}

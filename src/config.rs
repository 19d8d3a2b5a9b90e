//! Run configuration.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default branch capacity and source chunk size, in bytes.
pub const DEFAULT_CAPACITY: usize = 2048;

/// What the drive loop does when a single branch breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort every branch on the first write failure (default).
    #[default]
    AbortAll,
    /// Detach only the broken branch and keep feeding the others.
    ///
    /// Source errors still abort every branch.
    Isolate,
}

/// Configuration for a tee run.
#[derive(Debug, Clone)]
pub struct TeeConfig {
    /// Maximum bytes requested from the source per drive-loop iteration.
    pub chunk_size: usize,

    /// Capacity of branches created without an explicit capacity.
    pub default_capacity: usize,

    /// Wall-clock limit for a whole run. `None` waits indefinitely.
    ///
    /// Only operations blocked on a branch are cancelled. A source blocked
    /// inside `read` and a work function blocked on something other than its
    /// branch run on until they return.
    pub deadline: Option<Duration>,

    /// Branch failure handling.
    pub failure_policy: FailurePolicy,

    /// Consumer threads are named `<prefix>-branch-<index>`.
    pub thread_name_prefix: String,
}

impl Default for TeeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CAPACITY,
            default_capacity: DEFAULT_CAPACITY,
            deadline: None,
            failure_policy: FailurePolicy::AbortAll,
            thread_name_prefix: "riverfork".to_string(),
        }
    }
}

impl TeeConfig {
    /// Sizing used for file uploads fanned out to remote services.
    pub fn upload() -> Self {
        Self {
            chunk_size: 4096,
            default_capacity: 4096,
            ..Self::default()
        }
    }

    /// Small buffers for memory-constrained callers.
    pub fn low_memory() -> Self {
        Self {
            chunk_size: 256,
            default_capacity: 256,
            ..Self::default()
        }
    }

    /// Set the source chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the default branch capacity.
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    /// Set a deadline for the whole run.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the consumer thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be at least 1".into()));
        }
        if self.default_capacity == 0 {
            return Err(Error::InvalidConfig(
                "default branch capacity must be at least 1".into(),
            ));
        }
        if self.deadline == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("deadline must be positive".into()));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(Error::InvalidConfig(
                "thread name prefix must not contain NUL bytes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TeeConfig::default();
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.default_capacity, 2048);
        assert_eq!(config.failure_policy, FailurePolicy::AbortAll);
        assert!(config.deadline.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(TeeConfig::upload().default_capacity, 4096);
        assert_eq!(TeeConfig::low_memory().chunk_size, 256);
    }

    #[test]
    fn test_validation() {
        assert!(TeeConfig::default().with_chunk_size(0).validate().is_err());
        assert!(
            TeeConfig::default()
                .with_default_capacity(0)
                .validate()
                .is_err()
        );
        assert!(
            TeeConfig::default()
                .with_deadline(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            TeeConfig::default()
                .with_deadline(Duration::from_secs(5))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_thread_name_prefix_rejects_nul() {
        let result = TeeConfig::default()
            .with_thread_name_prefix("up\0load")
            .validate();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(
            TeeConfig::default()
                .with_thread_name_prefix("upload")
                .validate()
                .is_ok()
        );
    }
}

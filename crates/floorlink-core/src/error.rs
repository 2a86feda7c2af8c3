//! Error types for Floorlink loaders
//!
//! Every loader reports failures through [`LoaderError`]. The variants follow
//! the lifecycle taxonomy:
//! - setup failures before the first load
//! - timeouts and transport failures (retried)
//! - malformed payloads (surfaced immediately)
//! - calls made in the wrong lifecycle state (logged, returned, never panicking)
//! - push channel failures (non-fatal to a snapshot load)

use crate::state::LoaderState;
use serde::Serialize;

/// Main loader error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum LoaderError {
    /// Setup failed before any load could run
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Operation exceeded its time budget
    #[error("operation timed out after {duration_ms}ms")]
    Timeout {
        /// Budget that was exceeded
        duration_ms: u64,
    },

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Response did not have the expected shape
    #[error("invalid response: {0}")]
    Validation(String),

    /// Method called in a lifecycle state that does not allow it
    #[error("cannot {operation} while {state}")]
    State {
        /// Rejected operation
        operation: &'static str,
        /// State the loader was in
        state: LoaderState,
    },

    /// Push channel could not be established or failed later
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// A required collaborator was not injected
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    /// Cancelled through `abort()` or `dispose()`
    #[error("operation cancelled")]
    Cancelled,
}

/// Coarse error classification carried in events and status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// See [`LoaderError::Initialization`]
    Initialization,
    /// See [`LoaderError::Timeout`]
    Timeout,
    /// See [`LoaderError::Network`]
    Network,
    /// See [`LoaderError::Validation`]
    Validation,
    /// See [`LoaderError::State`]
    State,
    /// See [`LoaderError::Subscription`]
    Subscription,
    /// See [`LoaderError::Cancelled`]
    Cancelled,
}

impl LoaderError {
    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) | Self::MissingDependency(_) => ErrorKind::Initialization,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::Network,
            Self::Validation(_) => ErrorKind::Validation,
            Self::State { .. } => ErrorKind::State,
            Self::Subscription(_) => ErrorKind::Subscription,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network(_))
    }

    /// Check if error leaves the loader usable without intervention
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::MissingDependency(_))
    }

    /// Create network error
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create validation error
    #[inline]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create timeout error from a duration
    #[inline]
    #[must_use]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn loader_error_display() {
        let err = LoaderError::State {
            operation: "load",
            state: LoaderState::Disposed,
        };
        assert_eq!(err.to_string(), "cannot load while Disposed");

        let err = LoaderError::timeout(Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn loader_error_is_retryable() {
        assert!(LoaderError::network("reset").is_retryable());
        assert!(LoaderError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(!LoaderError::validation("bad shape").is_retryable());
        assert!(!LoaderError::Cancelled.is_retryable());
        assert!(!LoaderError::Subscription("refused".into()).is_retryable());
    }

    #[test]
    fn loader_error_kinds() {
        assert_eq!(
            LoaderError::MissingDependency("api").kind(),
            ErrorKind::Initialization
        );
        assert_eq!(LoaderError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(!LoaderError::MissingDependency("api").is_recoverable());
        assert!(LoaderError::network("x").is_recoverable());
    }
}

//! Error types for the Local Storage Manager
//!
//! Provides structured error types for all engine components including
//! disk discovery, the LVM and partition engines, reconciliation and the
//! control-plane adapters. Every variant maps onto a stable [`ErrorCode`]
//! that the volume-provisioning adapter translates into its status codes.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the storage manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("{kind} already exists: {name} ({reason})")]
    AlreadyExists {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    ResourceExhausted { requested: u64, available: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Size out of range: current {current} bytes, requested {requested} bytes")]
    OutOfRange { current: u64, requested: u64 },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    #[error("Operation already in progress for key {key}")]
    Aborted { key: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("Command failed: {command}: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Failed to parse tool output: {0}")]
    Parse(String),

    // =========================================================================
    // Internal / Configuration Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid disk selector pattern: {0}")]
    Pattern(#[from] regex::Error),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Serialization / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status taxonomy surfaced to the volume-provisioning adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    InvalidArgument,
    OutOfRange,
    Aborted,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NotFound => write!(f, "NotFound"),
            ErrorCode::AlreadyExists => write!(f, "AlreadyExists"),
            ErrorCode::ResourceExhausted => write!(f, "ResourceExhausted"),
            ErrorCode::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorCode::OutOfRange => write!(f, "OutOfRange"),
            ErrorCode::Aborted => write!(f, "Aborted"),
            ErrorCode::Internal => write!(f, "Internal"),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for an `AlreadyExists` error
    pub fn already_exists(kind: &str, name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Map this error onto the adapter-facing status taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Error::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Error::InvalidArgument(_) | Error::Configuration(_) | Error::Pattern(_) => {
                ErrorCode::InvalidArgument
            }
            Error::OutOfRange { .. } => ErrorCode::OutOfRange,
            Error::Aborted { .. } => ErrorCode::Aborted,
            _ => ErrorCode::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Aborted { .. }
            | Error::Kube(_)
            | Error::CommandFailed { .. }
            | Error::Timeout(_) => ErrorAction::RequeueWithBackoff,

            // Capacity may free up once other volumes go away
            Error::ResourceExhausted { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Caller errors - don't retry automatically
            Error::InvalidArgument(_)
            | Error::OutOfRange { .. }
            | Error::AlreadyExists { .. }
            | Error::Configuration(_)
            | Error::Pattern(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Aborted { .. }
                | Error::Kube(_)
                | Error::CommandFailed { .. }
                | Error::Timeout(_)
        )
    }
}

/// Result type alias for the storage manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_found("Volume", "v1").code(), ErrorCode::NotFound);
        assert_eq!(
            Error::already_exists("Volume", "v1", "size mismatch").code(),
            ErrorCode::AlreadyExists
        );
        assert_eq!(
            Error::OutOfRange {
                current: 10,
                requested: 5
            }
            .code(),
            ErrorCode::OutOfRange
        );
        assert_eq!(
            Error::Aborted { key: "v1".into() }.code(),
            ErrorCode::Aborted
        );
        assert_eq!(
            Error::CommandFailed {
                command: "lvcreate".into(),
                stderr: "boom".into()
            }
            .code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_error_actions() {
        let err = Error::ResourceExhausted {
            requested: 1000,
            available: 500,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::OutOfRange {
            current: 10,
            requested: 5,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Aborted {
            key: "volume-a".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }
}

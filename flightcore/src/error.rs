//! Core error types for flight execution.
//!
//! Library errors use `thiserror` enums with constructor helpers; the
//! binary layers `anyhow` on top. Interventions travel separately via
//! [`crate::intervention::InterventionNeeded`] so that callers can match
//! on them without digging through a general error enum.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for flight-core operations
pub type FlightResult<T> = Result<T, FlightError>;

/// Errors that can occur in the execution core
#[derive(Error, Debug)]
pub enum FlightError {
    /// Flight plan file not found
    #[error("flight plan not found at {path}")]
    PlanNotFound { path: PathBuf },

    /// Flight plan failed validation (unknown deps, cycles)
    #[error("invalid flight plan: {message}")]
    InvalidPlan { message: String },

    /// Waypoint id not present in the flight plan
    #[error("unknown waypoint: {id}")]
    UnknownWaypoint { id: String },

    /// Journal file is missing its schema header line
    #[error("execution log at {path} has no header line")]
    MissingHeader { path: PathBuf },

    /// Journal file declares a schema this reader does not understand
    #[error("unsupported journal schema '{schema}' in {path}")]
    UnsupportedSchema { schema: String, path: PathBuf },

    /// Git operation failed
    #[error("git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Receipt is structurally unusable (no evidence at all)
    #[error("receipt error: {message}")]
    Receipt { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Provider-side failure (classified)
    #[error(transparent)]
    Provider(#[from] crate::provider::ProviderError),
}

impl FlightError {
    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid-plan error
    pub fn invalid_plan(message: impl Into<String>) -> Self {
        Self::InvalidPlan {
            message: message.into(),
        }
    }

    /// Create an unknown-waypoint error
    pub fn unknown_waypoint(id: impl Into<String>) -> Self {
        Self::UnknownWaypoint { id: id.into() }
    }

    /// Create a receipt error
    pub fn receipt(message: impl Into<String>) -> Self {
        Self::Receipt {
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Git { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Provider(p) => p.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlightError::git("commit", "nothing to commit");
        assert!(err.to_string().contains("commit"));
        assert!(err.to_string().contains("nothing to commit"));

        let err = FlightError::unknown_waypoint("WP-9");
        assert!(err.to_string().contains("WP-9"));
    }

    #[test]
    fn test_git_lock_is_retryable() {
        let err = FlightError::git("add", "fatal: Unable to create lock file");
        assert!(err.is_retryable());

        let err = FlightError::git("commit", "nothing to commit");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_interrupted_is_retryable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted");
        let err: FlightError = io_err.into();
        assert!(err.is_retryable());
    }
}

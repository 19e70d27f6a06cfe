//! Error types for the worker runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationReason;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Durable error: {0}")]
    Durable(#[from] DurableError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Status codes reported by the orchestration engine transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Cancelled,
    DeadlineExceeded,
    Unimplemented,
    Unavailable,
    NotFound,
    InvalidArgument,
    Unauthenticated,
    Internal,
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unimplemented => "unimplemented",
            Self::Unavailable => "unavailable",
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::Unauthenticated => "unauthenticated",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Transport-level failure talking to the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: StatusCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn is_unimplemented(&self) -> bool {
        self.code == StatusCode::Unimplemented
    }
}

/// Error raised by a task implementation.
///
/// A non-retryable error tells the engine not to schedule another attempt.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<DurableError> for TaskError {
    fn from(err: DurableError) -> Self {
        match err {
            DurableError::NotDurable => Self::non_retryable(err.to_string()),
            other => Self::new(other.to_string()),
        }
    }
}

/// Output contract violations, reported separately from task failures.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Task output must be a key-value object, got {kind}")]
    NotAnObject { kind: &'static str },

    #[error("Task output contains a NUL (\\u0000) character, which cannot be persisted")]
    NulCharacter,

    #[error("Task output could not be serialized: {0}")]
    Json(#[from] serde_json::Error),
}

/// Task registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task {name} is already registered")]
    Duplicate { name: String },

    #[error("No task registered for action {name}")]
    NotFound { name: String },
}

/// Action listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Worker registration failed: {0}")]
    Registration(EngineError),

    #[error("Listener gave up after {retries} retries: {last}")]
    RetriesExhausted { retries: u32, last: EngineError },

    #[error("Listener thread failed: {0}")]
    Thread(String),
}

/// Durable subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    #[error("Durable event stream closed before a result arrived")]
    StreamClosed,

    #[error("Durable wait registration failed: {0}")]
    Registration(EngineError),

    #[error("Eviction of {step_run_id} was not acknowledged: {source}")]
    EvictionRejected {
        step_run_id: String,
        source: EngineError,
    },

    #[error("Restore of {step_run_id} failed: {source}")]
    RestoreFailed {
        step_run_id: String,
        source: EngineError,
    },

    #[error("Durable operation requires a durable task context")]
    NotDurable,

    #[error("Run {key} was cancelled while waiting for a durable slot")]
    AdmissionCancelled { key: String },

    #[error("Durable wait interrupted: run cancelled ({0})")]
    Cancelled(CancellationReason),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_are_retryable() {
        let err: TaskError = anyhow::anyhow!("boom").context("while fetching").into();
        assert!(err.retryable);
        assert!(err.message.contains("while fetching"));
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn non_retryable_flag() {
        assert!(!TaskError::non_retryable("bad input").retryable);
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::unavailable("connection refused");
        assert_eq!(err.to_string(), "unavailable: connection refused");
        assert!(!err.is_unimplemented());
        assert!(EngineError::unimplemented("ListenV2").is_unimplemented());
    }

    #[test]
    fn status_code_serde() {
        let json = serde_json::to_string(&StatusCode::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"DEADLINE_EXCEEDED\"");
    }
}

//! Error types for Chatflow.
//!
//! All errors in Chatflow are represented by the `ChatflowError` enum. The
//! variants follow the failure taxonomy of the engine: configuration problems
//! are rejected before execution, node failures carry a retry classification,
//! and transition/timeout failures are surfaced without retrying.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Chatflow operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum ChatflowError {
    /// Engine-level errors (startup, shutdown, lifecycle).
    #[error("{0}")]
    Engine(String),

    /// Configuration parsing errors.
    #[error("{0}")]
    Config(String),

    /// Data conversion errors (JSON, TOML).
    #[error("{0}")]
    Convert(String),

    /// Invalid flow graph or trigger configuration.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Node construction errors (unknown type, malformed config).
    #[error("{0}")]
    Node(String),

    /// A node failed while executing.
    #[error("{code}: {message}")]
    Execution {
        code: String,
        message: String,
        retryable: bool,
    },

    /// Step ceiling, wall-clock ceiling or per-call timeout exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The next node could not be resolved.
    #[error("transition error: {0}")]
    Transition(String),

    /// Trigger matching or registration errors.
    #[error("{0}")]
    Trigger(String),

    /// Another worker holds the execution, or an active execution already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested operation is not valid in the current execution state.
    #[error("invalid state: {0}")]
    State(String),

    /// A flow, execution or trigger was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The flow rate limit was exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The execution was cancelled while a step was in flight.
    #[error("execution cancelled")]
    Cancelled,

    /// Storage operation errors.
    #[error("{0}")]
    Store(String),

    /// Event queue errors.
    #[error("{0}")]
    Queue(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),
}

impl ChatflowError {
    /// A node failure that may succeed when attempted again.
    pub fn retryable(
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ChatflowError::Execution {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A node failure that must not be retried.
    pub fn fatal(
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ChatflowError::Execution {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatflowError::Execution {
                retryable: true,
                ..
            }
        )
    }

    /// Short machine-readable code, recorded on failed steps.
    pub fn code(&self) -> &str {
        match self {
            ChatflowError::Execution {
                code,
                ..
            } => code,
            ChatflowError::Engine(_) => "engine",
            ChatflowError::Config(_) => "config",
            ChatflowError::Convert(_) => "convert",
            ChatflowError::Validation(_) => "validation",
            ChatflowError::Node(_) => "node",
            ChatflowError::Timeout(_) => "timeout",
            ChatflowError::Transition(_) => "transition",
            ChatflowError::Trigger(_) => "trigger",
            ChatflowError::Conflict(_) => "conflict",
            ChatflowError::State(_) => "state",
            ChatflowError::NotFound(_) => "not_found",
            ChatflowError::RateLimited(_) => "rate_limited",
            ChatflowError::Cancelled => "cancelled",
            ChatflowError::Store(_) => "store",
            ChatflowError::Queue(_) => "queue",
            ChatflowError::IoError(_) => "io",
        }
    }
}

impl From<ChatflowError> for String {
    fn from(val: ChatflowError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for ChatflowError {
    fn from(error: std::io::Error) -> Self {
        ChatflowError::IoError(error.to_string())
    }
}

impl From<ChatflowError> for std::io::Error {
    fn from(val: ChatflowError) -> Self {
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for ChatflowError {
    fn from(_: FromUtf8Error) -> Self {
        ChatflowError::Convert("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for ChatflowError {
    fn from(error: serde_json::Error) -> Self {
        ChatflowError::Convert(error.to_string())
    }
}

impl From<jsonschema::ValidationError<'_>> for ChatflowError {
    fn from(error: jsonschema::ValidationError<'_>) -> Self {
        ChatflowError::Node(error.to_string())
    }
}

impl From<cron::error::Error> for ChatflowError {
    fn from(error: cron::error::Error) -> Self {
        ChatflowError::Validation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ChatflowError::retryable("send_failed", "socket closed").is_retryable());
        assert!(!ChatflowError::fatal("bad_config", "missing url").is_retryable());
        assert!(!ChatflowError::Transition("ambiguous".into()).is_retryable());
        assert!(!ChatflowError::Timeout("step limit".into()).is_retryable());
    }

    #[test]
    fn test_error_code() {
        assert_eq!(ChatflowError::retryable("http_503", "unavailable").code(), "http_503");
        assert_eq!(ChatflowError::Cancelled.code(), "cancelled");
        assert_eq!(ChatflowError::fatal("x", "boom").to_string(), "x: boom");
    }
}

//! Typed error hierarchy for downdraft
//!
//! Every error type includes context about what went wrong and whether
//! the operation can be retried. Connection-level failures use the closed
//! [`FailureReason`] taxonomy so callers can match on them exhaustively.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A download connection failed with a classified reason
    #[error("Connection failed ({reason}): {message}")]
    Connection {
        reason: FailureReason,
        message: String,
    },

    /// Network-related errors (connection, timeout, DNS, etc.)
    #[error("Network error: {message}")]
    Network {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// An action was dispatched that the current state does not accept
    #[error("Invalid action '{action}' for state '{state}'")]
    InvalidAction {
        state: &'static str,
        action: &'static str,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Task not found in the manager
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A state-machine handler reported an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Closed taxonomy of download-connection failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Destination file could not be opened or written
    FileNotWritable,
    /// The initial fetch request could not be sent
    InitialFetchFailed,
    /// The server replied with an unusable response
    BadFetchResponse,
    /// The response body stream broke mid-transfer
    StreamError,
    /// The URL resolver failed to produce a URL
    UrlResolveFailed,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FileNotWritable => "file_not_writable",
            Self::InitialFetchFailed => "initial_fetch_failed",
            Self::BadFetchResponse => "bad_fetch_response",
            Self::StreamError => "stream_error",
            Self::UrlResolveFailed => "url_resolve_failed",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { reason, .. } => !matches!(reason, FailureReason::FileNotWritable),
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { .. } => false,
            _ => false,
        }
    }

    /// Create a connection error
    pub fn connection(reason: FailureReason, message: impl Into<String>) -> Self {
        Self::Connection {
            reason,
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(status: Option<u16>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Network {
            status,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// The connection failure reason, if this is a connection error
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Connection { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let retryable = err.is_timeout() || err.is_connect();
        Self::Network {
            status,
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidInput {
            field: "url",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

//! Error types for the cluster session store.
//!
//! Failures of the IPC channel (connection loss, timeouts, malformed frames)
//! are folded into a single [`SessionError::Unavailable`] variant. Callers are
//! expected to treat an unavailable store as an anonymous session rather than
//! failing the request.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why the store could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    /// The peer is between connections to the coordinator.
    #[error("not connected to coordinator")]
    NotConnected,

    /// The connection dropped while the request was in flight.
    #[error("connection to coordinator lost")]
    ConnectionLost,

    /// No response arrived within the configured interval.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The other end sent something that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Main error type for the session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Session unavailable: {0}")]
    Unavailable(Unavailable),

    #[error("Internal store error: {0}")]
    Internal(String),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for session store operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<Unavailable> for SessionError {
    fn from(cause: Unavailable) -> Self {
        SessionError::Unavailable(cause)
    }
}

impl SessionError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SessionError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// True when the store could not be reached at all.
    ///
    /// Middleware should downgrade these to an unauthenticated session.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SessionError::Unavailable(_))
    }

    /// True when the addressed session does not exist or has expired.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound { .. })
    }

    /// The underlying unavailability cause, if any.
    pub fn unavailable_cause(&self) -> Option<&Unavailable> {
        match self {
            SessionError::Unavailable(cause) => Some(cause),
            _ => None,
        }
    }
}

use std::fmt;

use thiserror::Error;

/// How a processing failure should be handled by the retry policy.
///
/// Transient kinds are worth retrying with backoff; permanent kinds go
/// straight to the failed queue without burning retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An external call did not answer in time.
    Timeout,
    /// Could not reach an external system (broker, store, LLM backend).
    Connection,
    /// The document store rejected or lost an operation.
    Storage,
    /// Resource exhaustion (pool saturation, rate limits).
    ResourceExhausted,
    /// Input content that will never parse, no matter how often we retry.
    Parse,
    /// Input that is well-formed but semantically unusable.
    InvalidInput,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::Timeout
            | ErrorKind::Connection
            | ErrorKind::Storage
            | ErrorKind::ResourceExhausted => true,
            ErrorKind::Parse | ErrorKind::InvalidInput => false,
        }
    }

    /// Stable name recorded in `error_type` on failed events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Timeout Error",
            ErrorKind::Connection => "Connection Error",
            ErrorKind::Storage => "Storage Error",
            ErrorKind::ResourceExhausted => "Resource Exhausted",
            ErrorKind::Parse => "Parse Error",
            ErrorKind::InvalidInput => "Invalid Input",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failure during a stage's transformation.
///
/// Stages return this instead of raising through `anyhow` so that the retry
/// policy can branch on the error kind without downcasting.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(error: serde_json::Error) -> Self {
        ProcessingError::parse(error.to_string())
    }
}

impl From<sqlx::Error> for ProcessingError {
    fn from(error: sqlx::Error) -> Self {
        ProcessingError::storage(error.to_string())
    }
}

//! Error types for the acquisition agent

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SiphonError>;

#[derive(Error, Debug)]
pub enum SiphonError {
    /// Configuration error (invalid or missing field, unparseable file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error from the fallback store or config loading
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error surfaced by the MongoDB driver
    #[error("Primary store error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// The circuit breaker is open; the primary write was not issued
    #[error("Primary store circuit is open")]
    CircuitOpen,

    /// A primary write exceeded its per-call deadline
    #[error("Primary write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// OPC UA transport failure (connect, session, service call)
    #[error("OPC UA transport error: {0}")]
    Transport(String),

    /// Subscription could not be created or applied
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The ingress queue has been closed
    #[error("Sample queue is closed")]
    QueueClosed,

    /// The supervisor is already running
    #[error("Agent is already running")]
    AlreadyRunning,

    /// Operation cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,
}

impl SiphonError {
    /// Check if this error is transient (the next attempt may succeed)
    pub fn is_transient(&self) -> bool {
        match self {
            SiphonError::Io(io_err) => is_io_transient(io_err),
            SiphonError::Mongo(err) => is_mongo_transient(err),
            SiphonError::WriteTimeout(_) => true,
            SiphonError::Transport(_) => true,
            SiphonError::CircuitOpen => false,
            SiphonError::Config(_)
            | SiphonError::Json(_)
            | SiphonError::Subscription(_)
            | SiphonError::QueueClosed
            | SiphonError::AlreadyRunning
            | SiphonError::Cancelled => false,
        }
    }

    /// Check if this error is fatal (no amount of retrying will help)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SiphonError::Config(_) | SiphonError::AlreadyRunning | SiphonError::QueueClosed
        )
    }
}

fn is_io_transient(io_err: &io::Error) -> bool {
    use io::ErrorKind::*;
    matches!(
        io_err.kind(),
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | BrokenPipe
            | TimedOut
            | Interrupted
            | WouldBlock
            | WriteZero
    )
}

fn is_mongo_transient(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(
        err.kind.as_ref(),
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
    )
}

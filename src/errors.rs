//! Management Client Error Types
//!
//! This module defines the error type shared by the client, its configuration and
//! the collaborator traits. Callers should treat [`Error::Closed`] as terminal and
//! [`Error::ChannelCreation`] as possibly retriable, depending on its source.

use std::io;
use thiserror::Error;

/// The main Error type for the management client
#[derive(Error, Debug)]
pub enum Error {
    /// The object was used after it had been closed
    #[error("{0} is closed")]
    Closed(String),

    /// The connection strategy factory failed with an error of foreign origin
    #[error("Failed to create management channel: {0}")]
    ChannelCreation(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// I/O errors, including an interrupted wait for endpoint closure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The collaborator does not implement the requested operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// An in-flight operation was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The channel an operation was bound to closed underneath it
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Transport-related errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeouts
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON errors while loading configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Error returned by any use of a closed object named `what`
    pub fn closed(what: &str) -> Self {
        Error::Closed(what.to_string())
    }

    /// Interruption-flavored I/O error
    pub fn interrupted(message: impl Into<String>) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::Interrupted, message.into()))
    }

    /// Wrap a failure reported by a connection strategy factory.
    ///
    /// Errors that already are crate errors keep their category, everything
    /// else becomes [`Error::ChannelCreation`].
    pub fn from_creation_failure(error: anyhow::Error) -> Self {
        match error.downcast::<Error>() {
            Ok(error) => error,
            Err(other) => Error::ChannelCreation(other.into()),
        }
    }

    /// Turn a caught panic payload into an error
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) =>
                match payload.downcast::<&'static str>() {
                    Ok(message) => message.to_string(),
                    Err(_) => "unknown panic".to_string(),
                }
        };
        Error::Other(format!("panicked: {}", message))
    }

    /// Check whether this is a use-after-close error
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    /// Check whether this error reports an interrupted wait
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

// Manual implementation of Clone that handles non-cloneable sources
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Closed(s) => Error::Closed(s.clone()),
            Error::ChannelCreation(e) => Error::ChannelCreation(e.to_string().into()),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::UnsupportedOperation(s) => Error::UnsupportedOperation(s.clone()),
            Error::Cancelled(s) => Error::Cancelled(s.clone()),
            Error::ChannelClosed(s) => Error::ChannelClosed(s.clone()),
            Error::Transport(s) => Error::Transport(s.clone()),
            Error::Timeout(s) => Error::Timeout(s.clone()),
            Error::Configuration(s) => Error::Configuration(s.clone()),
            Error::Json(e) => Error::Configuration(format!("JSON error: {}", e)),
            Error::Other(s) => Error::Other(s.clone()),
        }
    }
}

//! Error types
//!
//! One variant per failure class a streaming session can run into. Most of
//! these end a session with a single protocol status; none of them are
//! retried inside this crate.

use std::fmt;
use std::io;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Control operation a consumer asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// Pause / unpause
    Pause,
    /// Seek to a position
    Seek,
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOp::Pause => write!(f, "pause"),
            ControlOp::Seek => write!(f, "seek"),
        }
    }
}

/// Error type for session, element and mapper operations
#[derive(Debug)]
pub enum Error {
    /// Media path could not be resolved to an element or export
    StreamNotFound(String),
    /// Capabilities of the producer and consumer do not intersect
    CapabilityMismatch(String),
    /// Authorizer denied the request, or did not answer in time
    Unauthorized(String),
    /// Export already serves its maximum number of clients
    TooManyClients {
        /// Export path
        export_path: String,
        /// Configured limit
        limit: i32,
    },
    /// Element refused the attachment
    AddRequestFailed(String),
    /// Request is already attached to the element
    AlreadyAttached(String),
    /// Element could not produce media (decode/split failure)
    Producer(String),
    /// Wire side failed or went away
    Transport(String),
    /// Controller does not support the operation
    Unsupported(ControlOp),
    /// Object is closing or closed
    Closed,
    /// Name already registered
    Duplicate(String),
    /// Request already has a controller driving it
    ControllerBusy(String),
    /// Request URL could not be parsed
    InvalidUrl(String),
    /// I/O error
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StreamNotFound(path) => write!(f, "Stream not found: {}", path),
            Error::CapabilityMismatch(media) => write!(f, "Capability mismatch for: {}", media),
            Error::Unauthorized(path) => write!(f, "Not authorized: {}", path),
            Error::TooManyClients { export_path, limit } => {
                write!(f, "Too many clients on {} (limit {})", export_path, limit)
            }
            Error::AddRequestFailed(media) => write!(f, "Cannot add request on: {}", media),
            Error::AlreadyAttached(element) => {
                write!(f, "Request already attached to element: {}", element)
            }
            Error::Producer(msg) => write!(f, "Producer error: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Unsupported(op) => write!(f, "Operation not supported: {}", op),
            Error::Closed => write!(f, "Closed"),
            Error::Duplicate(name) => write!(f, "Already registered: {}", name),
            Error::ControllerBusy(owner) => write!(f, "Request already controlled by: {}", owner),
            Error::InvalidUrl(url) => write!(f, "Invalid request url: {}", url),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Result string recorded in stream stats for a terminal error
    pub fn stats_result(&self) -> &'static str {
        match self {
            Error::StreamNotFound(_) | Error::CapabilityMismatch(_) => "STREAM NOT FOUND",
            Error::Unauthorized(_) => "AUTHORIZATION FAILED",
            Error::TooManyClients { .. } => "TOO MANY REQUESTS",
            Error::AddRequestFailed(_) | Error::AlreadyAttached(_) => "ADD REQUEST FAILED",
            Error::Producer(_) => "PRODUCER ERROR",
            Error::Transport(_) | Error::Io(_) => "TRANSPORT ERROR",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Closed => "CLOSED",
            Error::Duplicate(_) => "DUPLICATE",
            Error::ControllerBusy(_) => "CONTROLLER BUSY",
            Error::InvalidUrl(_) => "BAD REQUEST",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::TooManyClients {
            export_path: "live/a".into(),
            limit: 2,
        };
        assert_eq!(err.to_string(), "Too many clients on live/a (limit 2)");
        assert_eq!(
            Error::Unsupported(ControlOp::Seek).to_string(),
            "Operation not supported: seek"
        );
    }

    #[test]
    fn test_stats_result() {
        assert_eq!(
            Error::StreamNotFound("x".into()).stats_result(),
            "STREAM NOT FOUND"
        );
        assert_eq!(
            Error::Unauthorized("x".into()).stats_result(),
            "AUTHORIZATION FAILED"
        );
    }

    #[test]
    fn test_io_source() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(std::error::Error::source(&err).is_some());
    }
}

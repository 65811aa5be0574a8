use crate::parser::Status;
use std::io;
use thiserror::Error as ThisError;

/// Errors surfaced by the client.
///
/// Everything that happens on the reactor side is delivered through operation
/// futures; the reactor itself never panics into application code.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The key is empty, longer than 250 bytes, or contains a forbidden byte.
    /// Rejected synchronously, before the operation is submitted.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The ingress queue is at capacity; retry later or shed load.
    #[error("operation queue full")]
    QueueFull,
    /// The future was not resolved within the operation timeout. The
    /// operation itself keeps running and may still complete on the server.
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled before a response was delivered.
    #[error("operation cancelled")]
    Cancelled,
    /// The connection to the named server was lost while the operation was
    /// queued or in flight. Only reported under `FailureMode::Cancel`, or
    /// when redistribution finds no live node.
    #[error("connection to {0} lost")]
    ConnectionLost(String),
    /// The client has been shut down; no further operations are accepted.
    #[error("client is shut down")]
    Shutdown,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// A protocol-level status, including verbatim `SERVER_ERROR` and
    /// `CLIENT_ERROR` messages from the server.
    #[error("protocol: {0}")]
    Protocol(Status),
    /// A transcoder failed to convert between bytes and a typed value.
    #[error("transcode: {0}")]
    Transcode(String),
}

impl From<Status> for Error {
    fn from(s: Status) -> Self {
        Error::Protocol(s)
    }
}

// I/O errors are compared by kind so tests can assert on exact results.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::InvalidKey(a), Error::InvalidKey(b)) => a == b,
            (Error::QueueFull, Error::QueueFull) => true,
            (Error::Timeout, Error::Timeout) => true,
            (Error::Cancelled, Error::Cancelled) => true,
            (Error::ConnectionLost(a), Error::ConnectionLost(b)) => a == b,
            (Error::Shutdown, Error::Shutdown) => true,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            (Error::Protocol(a), Error::Protocol(b)) => a == b,
            (Error::Transcode(a), Error::Transcode(b)) => a == b,
            _ => false,
        }
    }
}

//! Error types for control-socket clients.

use thiserror::Error;

/// Errors that can occur talking to the control socket.
#[derive(Debug, Error)]
pub enum ControlError {
    /// I/O error communicating with the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The daemon closed the connection without replying.
    #[error("connection closed without a reply")]
    ConnectionClosed,

    /// The request/reply exchange timed out.
    #[error("request timed out")]
    Timeout,
}

/// Result type for control operations.
pub type Result<T> = std::result::Result<T, ControlError>;

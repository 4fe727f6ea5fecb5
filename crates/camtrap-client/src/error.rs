use std::io;
use thiserror::Error;

/// Failures of a bus connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Timed out after {timeout_ms}ms during {operation}")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Handshake with the bus failed: {0}")]
    Handshake(String),

    #[error("Frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection to the bus lost: {0}")]
    Disconnected(String),

    #[error("Socket is closed")]
    Closed,

    #[error("Operation not supported by a {0} socket")]
    WrongRole(&'static str),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<crate::framing::FrameError> for TransportError {
    fn from(err: crate::framing::FrameError) -> Self {
        match err {
            crate::framing::FrameError::TooLarge { len, max } => {
                TransportError::FrameTooLarge { len, max }
            }
            crate::framing::FrameError::Io(e) => TransportError::Io(e.to_string()),
        }
    }
}

/// Outcome of a failed `receive`.
///
/// A timeout is the normal idle signal and is kept apart from real failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    #[error("No frame arrived before the timeout")]
    Timeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RecvError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RecvError::Timeout)
    }
}

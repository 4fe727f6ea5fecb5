//! Error types shared by every camera-traps crate.
//!
//! Crate-specific failures (codec, transport, plugins) have their own enums in
//! their crates; this module holds the errors that cross crate boundaries:
//! configuration, persistence and I/O. All variants are serializable so they
//! can be written into structured log records.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using CamtrapError as the error type.
pub type Result<T> = std::result::Result<T, CamtrapError>;

/// Top-level error type for pipeline operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum CamtrapError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence errors (oracle records, power summaries)
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors related to configuration.
///
/// These errors occur when loading, parsing, or validating configuration files.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Duplicate plugin name
    #[error("Duplicate plugin name: {name}")]
    DuplicatePluginName { name: String },

    /// Environment variable error
    #[error("Environment variable error: {details}")]
    EnvironmentVariableError { details: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while persisting plugin state to disk.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum PersistenceError {
    /// Another writer holds the lock file
    #[error("Lock on {path} is held by another writer")]
    LockContended { path: String },

    /// Gave up waiting for the lock file
    #[error("Timed out after {waited_ms}ms waiting for lock on {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    /// The persisted document could not be parsed
    #[error("Corrupt record file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Writing or renaming the document failed
    #[error("Failed to write {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}

impl PersistenceError {
    /// Creates a corrupt file error.
    pub fn corrupt(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a write failed error.
    pub fn write_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistenceError::LockContended { .. })
    }
}

/// Wrapper for I/O errors to make them serializable.
#[derive(Debug, Error, Serialize, Deserialize)]
#[error("I/O error: {kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for CamtrapError {
    fn from(err: io::Error) -> Self {
        CamtrapError::Io(err.into())
    }
}

/// Serializable subset of std::io::ErrorKind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    AddrInUse,
    AlreadyExists,
    InvalidData,
    TimedOut,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused => IoErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => IoErrorKind::ConnectionReset,
            io::ErrorKind::AddrInUse => IoErrorKind::AddrInUse,
            io::ErrorKind::AlreadyExists => IoErrorKind::AlreadyExists,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_error_transient() {
        let err = PersistenceError::LockContended {
            path: "/tmp/oracle.json.lock".to_string(),
        };
        assert!(err.is_transient());

        let err = PersistenceError::corrupt("/tmp/oracle.json", "expected value at line 1");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_serialization() {
        let err = CamtrapError::Config(ConfigError::invalid_value("store.thresholds", "above 1.0"));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Config"));
        assert!(json.contains("store.thresholds"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: CamtrapError = io_err.into();
        match err {
            CamtrapError::Io(inner) => assert_eq!(inner.kind, IoErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Error types for blockq_core.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::adder::AddEvent;

/// Result type alias using blockq_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-distinguishable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad option combination or unknown backend/strategy.
    InvalidConfiguration,
    /// Malformed CID, empty identifier, unreadable source.
    InvalidInput,
    /// Block or reference absent.
    NotFound,
    /// Declared CID does not match the recomputed hash.
    IntegrityFault,
    /// Deletion refused because the block is pinned with no alternate copy.
    PinConflict,
    /// Caller-initiated abort.
    Cancelled,
    /// Underlying storage I/O failure.
    BackendFailure,
    /// Ingestion aborted mid-walk.
    IngestFailure,
}

impl ErrorKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IntegrityFault => "integrity_fault",
            ErrorKind::PinConflict => "pin_conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::IngestFailure => "ingest_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during block store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Invalid option combination or configuration value.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Invalid user-supplied input.
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Block not found in store.
    #[error("Block not found: {cid}")]
    NotFound { cid: String },

    /// Content does not hash to its declared CID.
    #[error("Integrity fault for {cid}: {reason}")]
    IntegrityFault { cid: String, reason: String },

    /// Block is pinned and no other copy exists.
    #[error("{reason}")]
    PinConflict { cid: String, reason: String },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Storage backend failed (other than I/O).
    #[error("Backend failure: {reason}")]
    BackendFailure { reason: String },

    /// A referenced external file is missing or shorter than recorded.
    #[error("Filestore source unavailable at {path}: {reason}")]
    FileUnavailable { path: PathBuf, reason: String },

    /// Ingestion aborted; carries the completion events emitted before the failure.
    #[error("Ingest failed after {} completed entries: {cause}", completed.len())]
    IngestFailure {
        cause: Box<Error>,
        completed: Vec<AddEvent>,
    },

    /// Path already exists (for export).
    #[error("Path already exists: {path}")]
    PathExists { path: PathBuf },

    /// Unsupported hash algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

impl Error {
    /// The machine-distinguishable class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::BackendFailure { .. } | Error::FileUnavailable { .. } => {
                ErrorKind::BackendFailure
            }
            Error::InvalidConfiguration { .. } | Error::UnsupportedAlgorithm { .. } => {
                ErrorKind::InvalidConfiguration
            }
            Error::InvalidInput { .. } | Error::PathExists { .. } => ErrorKind::InvalidInput,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::IntegrityFault { .. } => ErrorKind::IntegrityFault,
            Error::PinConflict { .. } => ErrorKind::PinConflict,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::IngestFailure { .. } => ErrorKind::IngestFailure,
        }
    }

    /// True for a missing block or reference.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Create an InvalidConfiguration error.
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Create an InvalidInput error.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(cid: impl fmt::Display) -> Self {
        Error::NotFound {
            cid: cid.to_string(),
        }
    }

    /// Create an IntegrityFault error.
    pub fn integrity_fault(cid: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::IntegrityFault {
            cid: cid.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a PinConflict error.
    pub fn pin_conflict(cid: impl fmt::Display, reason: impl Into<String>) -> Self {
        Error::PinConflict {
            cid: cid.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a BackendFailure error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Error::BackendFailure {
            reason: reason.into(),
        }
    }

    /// Create a FileUnavailable error.
    pub fn file_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::FileUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a PathExists error.
    pub fn path_exists(path: impl Into<PathBuf>) -> Self {
        Error::PathExists { path: path.into() }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::backend(format!("record encoding: {}", err))
    }
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Self {
        Error::invalid_input(format!("invalid content id: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            Error::invalid_configuration("x").kind(),
            ErrorKind::InvalidConfiguration
        );
        assert_eq!(Error::not_found("bafy").kind(), ErrorKind::NotFound);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::file_unavailable("/nope", "gone").kind(),
            ErrorKind::BackendFailure
        );
        assert_eq!(ErrorKind::PinConflict.as_str(), "pin_conflict");
    }

    #[test]
    fn test_io_not_found_is_backend_failure() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_pin_conflict_message_is_reason() {
        let err = Error::pin_conflict("bafyx", "pinned: recursive");
        assert_eq!(err.to_string(), "pinned: recursive");
    }
}

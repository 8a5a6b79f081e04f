//! Error types for the snapshot subsystem
//!
//! This module defines all error types used by snapshot creation and
//! snapshot recovery. We use `thiserror` for automatic `Display` and `Error`
//! trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types for snapshot and recovery operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A request argument was rejected (unknown mode, bad config value)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A snapshot run is already active
    #[error("Snapshot already running")]
    AlreadyRunning,

    /// I/O error (open, write, fsync, read)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kernel accepted fewer bytes than requested
    #[error("Short write: wrote {written} of {requested} bytes")]
    ShortWrite {
        /// Bytes actually written
        written: usize,
        /// Bytes requested
        requested: usize,
    },

    /// The item scan or a redo operation ran out of memory
    #[error("Out of memory")]
    OutOfMemory,

    /// The snapshot artifact is malformed, truncated or has no Done record
    #[error("Corrupt snapshot artifact: {0}")]
    CorruptArtifact(String),

    /// A single record does not fit the buffer or the record size limit
    #[error("Record too large: {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge {
        /// Encoded size of the record
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// The run was stopped on request before it completed
    #[error("Snapshot stopped before completion")]
    Stopped,

    /// The owning engine is shutting down
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// The background worker could not accept the run
    #[error("Snapshot worker unavailable")]
    WorkerUnavailable,
}

impl SnapshotError {
    /// Build an `InvalidArgument` error
    pub fn invalid(msg: impl Into<String>) -> Self {
        SnapshotError::InvalidArgument(msg.into())
    }

    /// Build a `CorruptArtifact` error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        SnapshotError::CorruptArtifact(msg.into())
    }

    /// True for failures of the underlying file I/O
    pub fn is_io(&self) -> bool {
        matches!(self, SnapshotError::Io(_) | SnapshotError::ShortWrite { .. })
    }

    /// True for artifact corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, SnapshotError::CorruptArtifact(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_argument() {
        let err = SnapshotError::invalid("mode 7");
        let msg = err.to_string();
        assert!(msg.contains("Invalid argument"));
        assert!(msg.contains("mode 7"));
    }

    #[test]
    fn test_error_display_short_write() {
        let err = SnapshotError::ShortWrite {
            written: 3,
            requested: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("wrote 3 of 10"));
        assert!(err.is_io());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: SnapshotError = io_err.into();
        assert!(matches!(err, SnapshotError::Io(_)));
        assert!(err.is_io());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_error_corrupt() {
        let err = SnapshotError::corrupt("missing done record");
        assert!(err.is_corruption());
        assert!(err.to_string().contains("missing done record"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_error() -> Result<u64> {
            Err(SnapshotError::AlreadyRunning)
        }

        assert!(matches!(returns_error(), Err(SnapshotError::AlreadyRunning)));
    }
}

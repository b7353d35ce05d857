//! Error types for quicksnap
//!
//! This module defines the error type shared by every layer of the workspace.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Note that a failed snapshot *operation* is not reported through this type:
//! operations record a [`FailureReason`](crate::FailureReason) and a terminal
//! [`OperationStatus`](crate::OperationStatus). `Error` covers the plumbing
//! underneath (files and snapshot names).

use std::io;
use thiserror::Error;

/// Result type alias for quicksnap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared across the quicksnap crates
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (snapshot files, RAM file, configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot name cannot be used as a directory name
    #[error("Invalid snapshot name: {0:?}")]
    InvalidName(String),
}

impl Error {
    /// Returns the raw OS error code if this wraps an I/O error that has one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_error_display_invalid_name() {
        let err = Error::InvalidName("../etc".to_string());
        assert!(err.to_string().contains("\"../etc\""));
    }

    #[test]
    fn test_error_from_io() {
        let err: Error = io::Error::from_raw_os_error(28).into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.raw_os_error(), Some(28));
    }

    #[test]
    fn test_raw_os_error_absent_for_other_variants() {
        assert_eq!(Error::InvalidName("a/b".into()).raw_os_error(), None);
        let custom = Error::Io(io::Error::new(io::ErrorKind::Other, "no errno"));
        assert_eq!(custom.raw_os_error(), None);
    }
}

//! Operation-level types shared by the snapshot layers
//!
//! - OperationStatus: terminal state of one save or load
//! - SnapshotOperation: which callback table applies
//! - OperationStage: start/end notification for operation observers

use std::fmt;

/// Status of a single save or load operation
///
/// Advances once from `NotStarted` to one of the terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationStatus {
    /// Nothing has happened yet
    #[default]
    NotStarted,
    /// Completed successfully
    Ok,
    /// Failed after state may have been touched
    Error,
    /// Failed a pre-flight check; nothing was changed
    ErrorNotChanged,
}

impl OperationStatus {
    /// True for `Ok`
    pub fn is_ok(self) -> bool {
        self == OperationStatus::Ok
    }

    /// True for either error variant
    pub fn is_error(self) -> bool {
        matches!(self, OperationStatus::Error | OperationStatus::ErrorNotChanged)
    }

    /// True once the status left `NotStarted`
    pub fn is_terminal(self) -> bool {
        self != OperationStatus::NotStarted
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::NotStarted => "not-started",
            OperationStatus::Ok => "ok",
            OperationStatus::Error => "error",
            OperationStatus::ErrorNotChanged => "error-not-changed",
        };
        f.write_str(s)
    }
}

/// Kind of snapshot operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotOperation {
    /// Save VM state to disk
    Save,
    /// Restore VM state from disk
    Load,
    /// Remove a snapshot
    Delete,
}

impl fmt::Display for SnapshotOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotOperation::Save => "save",
            SnapshotOperation::Load => "load",
            SnapshotOperation::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Stage reported to operation observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStage {
    /// Operation is starting
    Start,
    /// Operation finished (successfully or not)
    End,
}

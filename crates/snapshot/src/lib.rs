//! Snapshot orchestration for quicksnap
//!
//! This crate drives save, load and delete of whole-VM snapshots:
//! - paths: snapshot directory layout
//! - metadata: per-snapshot metadata record and pre-flight validation
//! - host / vm: collaborator traits (VM control, UI, hang detector, guest)
//! - saver / loader: one operation each, wrapping the RAM protocol
//! - snapshotter: the state machine and callback table handed to the VM
//! - testing: in-process fakes for every collaborator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod host;
pub mod loader;
pub mod metadata;
pub mod paths;
pub mod saver;
pub mod snapshotter;
pub mod testing;
pub mod vm;

pub use host::{
    Collaborators, GuestBridge, HangDetector, HangResumeGuard, HostEnvironment, MessageSeverity,
    WindowAgent, DEFAULT_MESSAGE_TIMEOUT,
};
pub use loader::Loader;
pub use metadata::{MetadataError, Snapshot, SnapshotMetadata, VmConfiguration, METADATA_VERSION};
pub use paths::{
    SnapshotPaths, METADATA_FILE_NAME, QUICKBOOT_CHOICE_FILE_NAME, RAM_FILE_NAME, SNAPSHOTS_DIR,
};
pub use saver::Saver;
pub use snapshotter::{OperationObserver, Snapshotter, SnapshotterState};
pub use vm::{OperationCallbacks, RamOperations, SnapshotCallbacks, VmOperations};

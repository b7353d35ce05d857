//! quicksnap - whole-VM snapshots and quickboot
//!
//! quicksnap saves and restores the full state of a running virtual machine
//! so it can resume in well under a second instead of cold booting. The VM
//! serializes its own device state; quicksnap owns everything around it:
//!
//! - the save/load/delete state machine and the callback table the VM
//!   drives ([`Snapshotter`])
//! - guest RAM persistence with zero-page elision on background threads
//!   ([`RamSaver`], [`RamLoader`])
//! - the failure taxonomy deciding between "cold boot and carry on" and
//!   "reset the VM" ([`FailureReason`], [`FailureClass`])
//! - the quickboot policy and post-load liveness monitor ([`Quickboot`])
//!
//! # Quick Start
//!
//! ```ignore
//! use quicksnap::{SnapshotContext, ThreadLooper};
//!
//! let context = SnapshotContext::open(avd_dir, collaborators, Arc::new(ThreadLooper::new()?))?;
//! context.quickboot().load("");
//! // ... run the VM ...
//! context.quickboot().save_on_exit("");
//! ```
//!
//! # Architecture
//!
//! Layers, each depending only on those above it:
//! - `quicksnap-core`: taxonomy, RAM block descriptors, shared types
//! - `quicksnap-ram`: RAM file format, zero-page detector, background workers
//! - `quicksnap-snapshot`: metadata, Saver/Loader, Snapshotter, collaborator traits
//! - `quicksnap-quickboot`: configuration, scheduling, liveness, policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;

pub use context::{finalize, get, initialize, ContextError, SnapshotContext};

pub use quicksnap_core::{
    is_valid_snapshot_name, AlignedMemory, Error, FailureClass, FailureReason, HostRegion,
    OperationStage, OperationStatus, RamBlock, RamBlockFlags, Result, SnapshotOperation,
    DEFAULT_BOOT_SNAPSHOT, PAGE_SIZE,
};
pub use quicksnap_quickboot::{
    ConfigError, LivenessMonitor, LivenessOutcome, LoadFailureReport, ManualLooper, Quickboot,
    QuickbootChoice, QuickbootConfig, QuickbootState, SaveOutcome, SaveSkipReason, Scheduler,
    ThreadLooper, TimerHandle,
};
pub use quicksnap_ram::{is_buffer_zeroed, RamLoadStats, RamLoader, RamSaveStats, RamSaver};
pub use quicksnap_snapshot::{
    testing, Collaborators, GuestBridge, HangDetector, HostEnvironment, MessageSeverity,
    OperationCallbacks, RamOperations, Snapshot, SnapshotCallbacks, SnapshotMetadata,
    SnapshotPaths, Snapshotter, SnapshotterState, VmConfiguration, VmOperations, WindowAgent,
};

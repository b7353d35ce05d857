//! Core types for quicksnap
//!
//! This crate defines the foundational types used by every other layer:
//! - FailureReason / FailureClass: failure taxonomy and its three-way banding
//! - OperationStatus, SnapshotOperation, OperationStage: operation bookkeeping
//! - RamBlock / RamBlockFlags: guest RAM block descriptors
//! - HostRegion / AlignedMemory: non-owning and owned host memory
//! - Error: error type shared across crates
//! - limits: fixed constants and name validation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod failure;
pub mod limits;
pub mod memory;
pub mod ram_block;
pub mod types;

pub use error::{Error, Result};
pub use failure::{
    FailureClass, FailureReason, EINVAL, ENOENT, ENOSPC, UNRECOVERABLE_ERROR_LIMIT,
    VALIDATION_ERROR_LIMIT,
};
pub use limits::{
    is_valid_snapshot_name, DEFAULT_BOOT_SNAPSHOT, MIN_FREE_DISK_BYTES, PAGE_SIZE,
    SNAPSHOT_CRASH_THRESHOLD_MS,
};
pub use memory::{AlignedMemory, HostRegion};
pub use ram_block::{portable_path, RamBlock, RamBlockFlags};
pub use types::{OperationStage, OperationStatus, SnapshotOperation};

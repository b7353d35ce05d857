//! VM-control boundary
//!
//! The VM owns CPU and device state serialization. It drives a snapshot
//! operation by calling back into the core at fixed points:
//!
//! ```text
//! save:   on_start -> register_block* -> save_page* -> saving_complete -> on_end
//! load:   on_start -> register_block* -> start_loading -> load_ram* -> on_end
//! delete: on_start -> on_end
//! ```
//!
//! A failure before `on_start` is reported through `on_quick_fail` instead.
//! The callbacks are passed to each [`VmOperations`] call rather than
//! stored, so the VM never holds a reference back into the core.

use quicksnap_core::{FailureReason, RamBlock, SnapshotOperation};

use crate::metadata::VmConfiguration;

/// Operation lifecycle callbacks, one table per [`SnapshotOperation`]
pub trait OperationCallbacks {
    /// Operation is about to start; false aborts it
    fn on_start(&self, op: SnapshotOperation, name: &str) -> bool;

    /// Operation finished with `result` (0 = success)
    fn on_end(&self, op: SnapshotOperation, name: &str, result: i32) -> bool;

    /// Operation failed before it started; `result` is a negative errno
    fn on_quick_fail(&self, op: SnapshotOperation, name: &str, result: i32);

    /// Whether the VM should stop the operation early
    fn is_canceled(&self, op: SnapshotOperation, name: &str) -> bool;
}

/// Page-level RAM transfer callbacks
pub trait RamOperations {
    /// Register one RAM block for the current operation
    fn register_block(&self, op: SnapshotOperation, block: RamBlock);

    /// Begin streaming RAM back into host memory
    fn start_loading(&self) -> bool;

    /// Persist one dirty page
    ///
    /// Returns the number of bytes taken over; the VM must not save them
    /// itself. Zero means the page was not handled.
    fn save_page(&self, block_offset: u64, page_offset: u64, size: usize) -> usize;

    /// All pages were handed over; flush and report success
    fn saving_complete(&self) -> bool;

    /// Make sure `ptr..ptr+size` holds loaded contents before the VM reads it
    fn load_ram(&self, ptr: *const u8, size: usize);
}

/// Full callback table handed to the VM
pub trait SnapshotCallbacks: OperationCallbacks + RamOperations {}

impl<T: OperationCallbacks + RamOperations + ?Sized> SnapshotCallbacks for T {}

/// Operations the VM exposes to the snapshot core
pub trait VmOperations: Send + Sync {
    /// Save VM state as `name`, calling back into `callbacks`
    fn snapshot_save(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool;

    /// Load VM state from `name`
    fn snapshot_load(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool;

    /// Delete the VM-owned parts of `name`
    fn snapshot_delete(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool;

    /// Pause guest execution
    fn vm_stop(&self);

    /// Resume guest execution
    fn vm_start(&self);

    /// Reboot the guest from scratch
    fn vm_reset(&self);

    /// The process is shutting down after this save
    fn set_exiting(&self);

    /// Something in the VM asked for the next save to be skipped
    fn is_snapshot_save_skipped(&self) -> bool;

    /// Record why loading `name` failed
    fn set_failure_reason(&self, name: &str, reason: FailureReason);

    /// Configuration of the running VM
    fn vm_configuration(&self) -> VmConfiguration;
}

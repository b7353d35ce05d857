//! Testing utilities for the snapshot layer
//!
//! Deterministic in-process fakes for every collaborator, so the whole
//! save/load/delete protocol runs without a hypervisor:
//!
//! - **FakeVm**: owns guest RAM blocks and drives the callback table the way
//!   a VM does, with injectable failures
//! - **Host fakes**: recording window and hang detector, a settable host
//!   environment and guest bridge
//! - **FakeHost**: all of the above wired into [`Collaborators`]
//!
//! # Example
//!
//! ```ignore
//! use quicksnap_snapshot::testing::FakeHost;
//!
//! let host = FakeHost::new(&paths);
//! host.vm.write_ram("pc.ram", 0, b"hello");
//! let snapshotter = Snapshotter::new(paths, host.collaborators());
//! ```

mod fake_vm;
mod host;

pub use fake_vm::{FakeVm, DEVICE_STATE_FILE_NAME};
pub use host::{FakeGuestBridge, RecordingHangDetector, RecordingWindow, StaticEnvironment};

use std::sync::Arc;

use crate::host::Collaborators;
use crate::paths::SnapshotPaths;

/// Every fake, shared with the collaborators handed to the code under test
#[derive(Clone)]
pub struct FakeHost {
    /// VM
    pub vm: Arc<FakeVm>,
    /// Window
    pub window: Arc<RecordingWindow>,
    /// Hang detector
    pub hang_detector: Arc<RecordingHangDetector>,
    /// Environment
    pub environment: Arc<StaticEnvironment>,
    /// Guest bridge
    pub guest: Arc<FakeGuestBridge>,
}

impl FakeHost {
    /// A booted, online guest with one RAM block on a snapshot-capable host
    pub fn new(paths: &SnapshotPaths) -> Self {
        FakeHost {
            vm: Arc::new(FakeVm::with_default_blocks(paths.clone())),
            window: Arc::new(RecordingWindow::default()),
            hang_detector: Arc::new(RecordingHangDetector::default()),
            environment: Arc::new(StaticEnvironment::default()),
            guest: Arc::new(FakeGuestBridge::booted()),
        }
    }

    /// Collaborators backed by these fakes
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            vm: self.vm.clone(),
            window: self.window.clone(),
            hang_detector: self.hang_detector.clone(),
            environment: self.environment.clone(),
            guest: self.guest.clone(),
        }
    }
}

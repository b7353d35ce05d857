//! One load operation
//!
//! A [`Loader`] validates the target [`Snapshot`] before the VM touches any
//! guest state, then owns the [`RamLoader`] that streams RAM back. A
//! validation failure leaves the status at `ErrorNotChanged`: the running
//! session is intact and can simply continue.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use quicksnap_core::{FailureReason, OperationStatus};
use quicksnap_ram::{RamLoadStats, RamLoader};
use tracing::{debug, warn};

use crate::metadata::{Snapshot, VmConfiguration};

/// Loads VM state from one snapshot
pub struct Loader {
    snapshot: Snapshot,
    base_dir: PathBuf,
    status: OperationStatus,
    ram: Option<RamLoader>,
    prepared: bool,
    started: Instant,
    duration: Option<Duration>,
}

impl Loader {
    /// Create a loader; RAM block paths resolve against `base_dir`
    pub fn new(snapshot: Snapshot, base_dir: &Path) -> Self {
        Loader {
            snapshot,
            base_dir: base_dir.to_path_buf(),
            status: OperationStatus::NotStarted,
            ram: None,
            prepared: false,
            started: Instant::now(),
            duration: None,
        }
    }

    /// A loader for a load the VM failed before it started
    ///
    /// `errno` is positive.
    pub fn failed(mut snapshot: Snapshot, base_dir: &Path, errno: i32) -> Self {
        snapshot.save_failure(FailureReason::from_errno(errno));
        let mut loader = Loader::new(snapshot, base_dir);
        loader.prepared = true;
        loader.status = OperationStatus::Error;
        loader.duration = Some(Duration::ZERO);
        loader
    }

    /// Run pre-flight validation against the running VM
    pub fn prepare(&mut self, config: &VmConfiguration, renderer: &str) -> OperationStatus {
        if self.prepared {
            return self.status;
        }
        self.prepared = true;
        match self.snapshot.validate_for_loading(config, renderer) {
            Ok(()) => {
                self.ram = Some(RamLoader::new(&self.snapshot.ram_file_path(), &self.base_dir));
                debug!(target: "quicksnap::snapshotter", name = %self.snapshot.name(),
                    "snapshot load prepared");
            }
            Err(reason) => {
                debug!(target: "quicksnap::snapshotter", name = %self.snapshot.name(),
                    reason = reason.code(), "snapshot failed validation");
                self.status = OperationStatus::ErrorNotChanged;
            }
        }
        self.status
    }

    /// Begin the operation, validating first if that has not happened yet
    pub fn start(&mut self, config: &VmConfiguration, renderer: &str) -> OperationStatus {
        self.prepare(config, renderer)
    }

    /// Finish the operation
    ///
    /// Success needs both the VM and the RAM stream to succeed; the RAM
    /// stream is joined here so every page is resident afterwards.
    pub fn complete(&mut self, succeeded: bool) -> OperationStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.duration = Some(self.started.elapsed());

        let ram_ok = match self.ram.as_mut() {
            Some(ram) if ram.was_started() => ram.join(),
            Some(ram) => {
                ram.interrupt();
                false
            }
            None => false,
        };
        if succeeded && ram_ok {
            self.status = OperationStatus::Ok;
            self.snapshot.increment_successful_loads();
            return self.status;
        }

        let reason = if succeeded {
            self.ram
                .as_ref()
                .and_then(RamLoader::failure_reason)
                .unwrap_or(FailureReason::RamFailed)
        } else {
            FailureReason::EmulationEngineFailed
        };
        warn!(target: "quicksnap::snapshotter", name = %self.snapshot.name(),
            reason = reason.code(), "snapshot load failed");
        self.status = OperationStatus::Error;
        self.snapshot.save_failure(reason);
        self.status
    }

    /// Wait until every RAM page is resident
    pub fn synchronize(&mut self) -> bool {
        match self.ram.as_mut() {
            Some(ram) if ram.was_started() => ram.join(),
            _ => true,
        }
    }

    /// Stop streaming RAM
    pub fn interrupt(&mut self) {
        if let Some(ram) = self.ram.as_mut() {
            ram.interrupt();
        }
    }

    /// The VM found the loaded state unusable after the fact
    pub fn on_invalid_snapshot_load(&mut self) {
        if let Some(ram) = self.ram.as_mut() {
            ram.invalidate();
        }
        self.status = OperationStatus::Error;
        self.snapshot.save_failure(FailureReason::CorruptedData);
        self.report_invalid();
    }

    /// Count this load against the snapshot's invalid-load total
    pub fn report_invalid(&mut self) {
        self.snapshot.increment_invalid_loads();
    }

    /// True once the status is terminal
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Current status
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Target snapshot
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// RAM reader, once validation passed
    pub fn ram_loader(&self) -> Option<&RamLoader> {
        self.ram.as_ref()
    }

    /// Mutable RAM reader
    pub fn ram_loader_mut(&mut self) -> Option<&mut RamLoader> {
        self.ram.as_mut()
    }

    /// RAM counters
    pub fn stats(&self) -> RamLoadStats {
        self.ram.as_ref().map(RamLoader::stats).unwrap_or_default()
    }

    /// Time from creation to completion
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SnapshotMetadata;
    use crate::paths::SnapshotPaths;
    use std::fs;
    use tempfile::TempDir;

    fn config() -> VmConfiguration {
        VmConfiguration {
            cpu_core_count: 1,
            ram_size_bytes: 1 << 20,
            hypervisor: "tcg".into(),
        }
    }

    #[test]
    fn test_validation_failure_is_error_not_changed() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut loader = Loader::new(Snapshot::new(&paths, "none").unwrap(), dir.path());
        assert_eq!(loader.prepare(&config(), "host"), OperationStatus::ErrorNotChanged);
        assert!(loader.ram_loader().is_none());
        assert_eq!(loader.complete(true), OperationStatus::ErrorNotChanged);
        assert_eq!(
            loader.snapshot().failure_reason(),
            Some(FailureReason::NoSnapshotPb)
        );
    }

    #[test]
    fn test_failed_from_errno() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let loader = Loader::failed(Snapshot::new(&paths, "s").unwrap(), dir.path(), 2);
        assert!(loader.is_complete());
        assert_eq!(loader.status(), OperationStatus::Error);
        assert_eq!(
            loader.snapshot().failure_reason(),
            Some(FailureReason::NoSnapshotInImage)
        );
    }

    #[test]
    fn test_ram_never_started_is_ram_failed() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut snapshot = Snapshot::new(&paths, "s").unwrap();
        fs::create_dir_all(snapshot.data_dir()).unwrap();
        fs::write(snapshot.ram_file_path(), b"").unwrap();
        snapshot.save(&config(), "host", None).unwrap();

        let mut loader = Loader::new(Snapshot::new(&paths, "s").unwrap(), dir.path());
        assert_eq!(loader.start(&config(), "host"), OperationStatus::NotStarted);
        assert_eq!(loader.complete(true), OperationStatus::Error);
        assert_eq!(loader.snapshot().failure_reason(), Some(FailureReason::RamFailed));
        assert_eq!(loader.snapshot().metadata().unwrap().invalid_loads, 0);

        loader.report_invalid();
        assert_eq!(loader.snapshot().metadata().unwrap().invalid_loads, 1);
        let persisted = SnapshotMetadata::read_from(&paths.metadata_file("s").unwrap()).unwrap();
        assert_eq!(persisted.invalid_loads, 1);
    }

    #[test]
    fn test_vm_failure_is_emulation_engine_failed() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut snapshot = Snapshot::new(&paths, "s").unwrap();
        fs::create_dir_all(snapshot.data_dir()).unwrap();
        fs::write(snapshot.ram_file_path(), b"").unwrap();
        snapshot.save(&config(), "host", None).unwrap();

        let mut loader = Loader::new(Snapshot::new(&paths, "s").unwrap(), dir.path());
        loader.prepare(&config(), "host");
        assert_eq!(loader.complete(false), OperationStatus::Error);
        assert_eq!(
            loader.snapshot().failure_reason(),
            Some(FailureReason::EmulationEngineFailed)
        );
    }
}

//! One save operation
//!
//! A [`Saver`] owns the target [`Snapshot`], the [`RamSaver`] writing its RAM
//! file and the operation status. Metadata is removed when the save starts
//! and written again only after the RAM file is in place, so a crash in the
//! middle never leaves a snapshot that looks loadable.

use std::fs;
use std::io;
use std::time::{Duration, Instant};

use quicksnap_core::{FailureReason, OperationStatus};
use quicksnap_ram::{IndexFlags, RamSaveStats, RamSaver};
use tracing::{debug, warn};

use crate::metadata::{Snapshot, VmConfiguration};

/// Saves VM state into one snapshot
pub struct Saver {
    snapshot: Snapshot,
    flags: IndexFlags,
    status: OperationStatus,
    ram: Option<RamSaver>,
    ram_result: Option<bool>,
    canceled: bool,
    stats: RamSaveStats,
    started: Instant,
    duration: Option<Duration>,
}

impl Saver {
    /// Create a saver; nothing touches disk until [`Saver::prepare`]
    pub fn new(snapshot: Snapshot, flags: IndexFlags) -> Self {
        Saver {
            snapshot,
            flags,
            status: OperationStatus::NotStarted,
            ram: None,
            ram_result: None,
            canceled: false,
            stats: RamSaveStats::default(),
            started: Instant::now(),
            duration: None,
        }
    }

    /// Create the snapshot directory and open the RAM file
    ///
    /// Safe to call more than once.
    pub fn prepare(&mut self) -> OperationStatus {
        if self.status != OperationStatus::NotStarted || self.ram.is_some() {
            return self.status;
        }
        match self.open() {
            Ok(ram) => {
                debug!(target: "quicksnap::snapshotter", name = %self.snapshot.name(),
                    "snapshot save prepared");
                self.ram = Some(ram);
            }
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name = %self.snapshot.name(), error = %e,
                    "cannot prepare snapshot save");
                self.fail(FailureReason::from_io_error(&e));
            }
        }
        self.status
    }

    fn open(&self) -> io::Result<RamSaver> {
        fs::create_dir_all(self.snapshot.data_dir())?;
        match fs::remove_file(self.snapshot.metadata_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        RamSaver::new(&self.snapshot.ram_file_path(), self.flags)
    }

    fn fail(&mut self, reason: FailureReason) {
        self.status = OperationStatus::Error;
        self.snapshot.save_failure(reason);
    }

    /// Flush and join the RAM writer
    ///
    /// The result of the first call is remembered.
    pub fn finish_ram(&mut self) -> bool {
        if let Some(done) = self.ram_result {
            return done;
        }
        let done = match self.ram.as_mut() {
            Some(ram) => match ram.join() {
                Ok(stats) => {
                    self.stats = stats;
                    true
                }
                Err(e) => {
                    warn!(target: "quicksnap::snapshotter", name = %self.snapshot.name(),
                        error = %e, "RAM save failed");
                    false
                }
            },
            None => false,
        };
        self.ram_result = Some(done);
        done
    }

    /// Finish the operation
    ///
    /// On success the metadata is written with `parent` as the snapshot this
    /// state was derived from. Completing twice keeps the first outcome.
    pub fn complete(
        &mut self,
        succeeded: bool,
        config: &VmConfiguration,
        renderer: &str,
        parent: Option<&str>,
    ) -> OperationStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.duration = Some(self.started.elapsed());

        if self.canceled {
            self.fail(FailureReason::Canceled);
            return self.status;
        }
        if !succeeded {
            if let Some(ram) = self.ram.as_mut() {
                ram.cancel();
            }
            if self.ram_result == Some(true) {
                let _ = fs::remove_file(self.snapshot.ram_file_path());
            }
            self.fail(FailureReason::EmulationEngineFailed);
            return self.status;
        }
        if !self.finish_ram() {
            let _ = fs::remove_file(self.snapshot.ram_file_path());
            self.fail(FailureReason::RamFailed);
            return self.status;
        }
        match self.snapshot.save(config, renderer, parent) {
            Ok(()) => self.status = OperationStatus::Ok,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name = %self.snapshot.name(), error = %e,
                    "cannot write snapshot metadata");
                self.fail(FailureReason::InternalError);
            }
        }
        self.status
    }

    /// Stop writing and mark the save canceled
    pub fn cancel(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.canceled = true;
        if let Some(ram) = self.ram.as_mut() {
            ram.cancel();
        }
    }

    /// True once `cancel` was called
    pub fn is_canceled(&self) -> bool {
        self.canceled
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

    /// RAM writer, once prepared
    pub fn ram_saver_mut(&mut self) -> Option<&mut RamSaver> {
        self.ram.as_mut()
    }

    /// RAM counters; final after the writer joined
    pub fn stats(&self) -> RamSaveStats {
        self.stats
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
    use quicksnap_core::{AlignedMemory, RamBlock, PAGE_SIZE};
    use tempfile::TempDir;

    fn config() -> VmConfiguration {
        VmConfiguration {
            cpu_core_count: 2,
            ram_size_bytes: 4 * PAGE_SIZE as u64,
            hypervisor: "kvm".into(),
        }
    }

    #[test]
    fn test_successful_save_writes_metadata_and_ram() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut mem = AlignedMemory::new(4 * PAGE_SIZE);
        mem.as_mut_slice()[PAGE_SIZE] = 7;

        let mut saver = Saver::new(Snapshot::new(&paths, "s").unwrap(), IndexFlags::empty());
        assert_eq!(saver.prepare(), OperationStatus::NotStarted);
        let ram = saver.ram_saver_mut().unwrap();
        ram.register_block(RamBlock::new("pc.ram", 0, unsafe { mem.region() }, PAGE_SIZE as u32));
        ram.save_page(0, 0, PAGE_SIZE);

        assert_eq!(saver.complete(true, &config(), "host", Some("base")), OperationStatus::Ok);
        assert!(saver.is_complete());
        assert_eq!(saver.stats().written_pages, 1);

        let meta = SnapshotMetadata::read_from(&paths.metadata_file("s").unwrap()).unwrap();
        assert_eq!(meta.config, Some(config()));
        assert_eq!(meta.parent.as_deref(), Some("base"));
        assert!(paths.ram_file("s").unwrap().exists());
    }

    #[test]
    fn test_failed_save_records_reason() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut saver = Saver::new(Snapshot::new(&paths, "s").unwrap(), IndexFlags::empty());
        saver.prepare();
        assert_eq!(saver.complete(false, &config(), "host", None), OperationStatus::Error);
        assert_eq!(
            saver.snapshot().failure_reason(),
            Some(FailureReason::EmulationEngineFailed)
        );
        assert!(!paths.ram_file("s").unwrap().exists());
    }

    #[test]
    fn test_cancel_then_complete_is_canceled() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut saver = Saver::new(Snapshot::new(&paths, "s").unwrap(), IndexFlags::empty());
        saver.prepare();
        saver.cancel();
        assert!(saver.is_canceled());
        assert_eq!(saver.complete(true, &config(), "host", None), OperationStatus::Error);
        assert_eq!(saver.snapshot().failure_reason(), Some(FailureReason::Canceled));
    }

    #[test]
    fn test_prepare_removes_stale_metadata() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let mut first = Saver::new(Snapshot::new(&paths, "s").unwrap(), IndexFlags::empty());
        first.prepare();
        first.complete(true, &config(), "host", None);
        assert!(paths.metadata_file("s").unwrap().exists());

        let mut second = Saver::new(Snapshot::new(&paths, "s").unwrap(), IndexFlags::empty());
        second.prepare();
        assert!(!paths.metadata_file("s").unwrap().exists());
        second.cancel();
    }
}

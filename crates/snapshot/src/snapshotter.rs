//! Snapshot orchestration
//!
//! [`Snapshotter`] owns at most one [`Saver`] and one [`Loader`], never both
//! in progress: starting either operation first discards the other. It
//! drives the VM through [`VmOperations`] and implements the callback table
//! the VM calls back into while serializing its own state.
//!
//! # Locking
//!
//! All mutable state sits behind one mutex that is never held while calling
//! into the VM, since the VM calls the callbacks synchronously from inside
//! `snapshot_save` / `snapshot_load` / `snapshot_delete`.
//!
//! # Hang detection
//!
//! Hang detection is paused from the start callback to the matching
//! completion callback. Completions resume it through [`HangResumeGuard`],
//! so the resume also happens when completion panics on a protocol
//! violation.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quicksnap_core::{
    is_valid_snapshot_name, portable_path, FailureClass, FailureReason, OperationStage,
    OperationStatus, RamBlock, SnapshotOperation, EINVAL, MIN_FREE_DISK_BYTES,
    SNAPSHOT_CRASH_THRESHOLD_MS,
};
use quicksnap_ram::{IndexFlags, RamLoadStats, RamSaveStats};
use tracing::{debug, info, warn};

use crate::host::{Collaborators, HangResumeGuard, MessageSeverity, DEFAULT_MESSAGE_TIMEOUT};
use crate::loader::Loader;
use crate::metadata::Snapshot;
use crate::paths::SnapshotPaths;
use crate::saver::Saver;
use crate::vm::{OperationCallbacks, RamOperations};

/// Observer notified at the start and end of every save and load
pub type OperationObserver = Arc<dyn Fn(SnapshotOperation, OperationStage) + Send + Sync>;

/// Where the state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SnapshotterState {
    /// No operation in flight
    #[default]
    Idle,
    /// `prepare_for_saving` ran; waiting for the VM to start the save
    SavingPrepared,
    /// The VM is saving
    SavingActive,
    /// `prepare_for_loading` ran; waiting for the VM to start the load
    LoadingPrepared,
    /// The VM is loading
    LoadingActive,
    /// The VM is deleting
    Deleting,
}

impl fmt::Display for SnapshotterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotterState::Idle => "idle",
            SnapshotterState::SavingPrepared => "saving-prepared",
            SnapshotterState::SavingActive => "saving",
            SnapshotterState::LoadingPrepared => "loading-prepared",
            SnapshotterState::LoadingActive => "loading",
            SnapshotterState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct SnapshotterInner {
    state: SnapshotterState,
    saver: Option<Saver>,
    loader: Option<Loader>,
    loaded_snapshot: Option<String>,
    is_quickboot: bool,
    is_on_exit: bool,
    is_invalidating: bool,
    ram_file: Option<PathBuf>,
    ram_file_shared: bool,
    last_load_duration: Option<Duration>,
    last_save_duration: Option<Duration>,
    last_load_at: Option<Instant>,
}

impl SnapshotterInner {
    /// Keep a save of the loaded snapshot from racing its background load
    ///
    /// The loader is joined if it loaded `name` successfully and is dropped
    /// in every case.
    fn release_loader_for_saving(&mut self, name: &str) {
        if let Some(mut loader) = self.loader.take() {
            if loader.snapshot().name() == name && loader.status() == OperationStatus::Ok {
                loader.synchronize();
            } else {
                loader.interrupt();
            }
        }
    }

    fn ram_index_flags(&self) -> IndexFlags {
        if self.ram_file.is_some() && self.ram_file_shared {
            IndexFlags::SEPARATE_BACKING_STORE
        } else {
            IndexFlags::empty()
        }
    }
}

/// Snapshot save/load/delete orchestrator
pub struct Snapshotter {
    paths: SnapshotPaths,
    collaborators: Collaborators,
    inner: Mutex<SnapshotterInner>,
    observers: Mutex<Vec<OperationObserver>>,
}

impl fmt::Debug for Snapshotter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshotter")
            .field("base", &self.paths.base())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Snapshotter {
    /// Create an idle snapshotter over `paths`
    pub fn new(paths: SnapshotPaths, collaborators: Collaborators) -> Self {
        Snapshotter {
            paths,
            collaborators,
            inner: Mutex::new(SnapshotterInner::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Directory layout
    pub fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    /// External services
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Validate `name` for loading without touching guest state
    ///
    /// Any saver is discarded and a fresh loader replaces the current one.
    pub fn prepare_for_loading(&self, name: &str) -> OperationStatus {
        let snapshot = match Snapshot::new(&self.paths, name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name, error = %e, "cannot load snapshot");
                return OperationStatus::Error;
            }
        };
        let config = self.collaborators.vm.vm_configuration();
        let renderer = self.collaborators.environment.renderer_name();

        let mut inner = self.inner.lock();
        inner.saver = None;
        if let Some(mut old) = inner.loader.take() {
            old.interrupt();
        }
        let mut loader = Loader::new(snapshot, self.paths.base());
        let status = loader.prepare(&config, &renderer);
        inner.loader = Some(loader);
        inner.state = if status.is_error() {
            SnapshotterState::Idle
        } else {
            SnapshotterState::LoadingPrepared
        };
        status
    }

    /// Load `name` through the VM
    ///
    /// Returns the final loader status.
    pub fn load(&self, is_quickboot: bool, name: &str) -> OperationStatus {
        {
            let mut inner = self.inner.lock();
            inner.last_load_duration = None;
            inner.is_quickboot = is_quickboot;
        }
        let started = Instant::now();
        self.collaborators.vm.snapshot_load(name, self);
        let elapsed = started.elapsed();

        let loader_missing = {
            let mut inner = self.inner.lock();
            inner.is_quickboot = false;
            inner.last_load_duration = Some(elapsed);
            inner.loader.is_none()
        };
        if loader_missing {
            self.on_loading_failed(name, -EINVAL);
        }

        let mut inner = self.inner.lock();
        let Some(loader) = inner.loader.as_ref() else {
            warn!(target: "quicksnap::snapshotter", name, "snapshot load left no loader");
            return OperationStatus::Error;
        };
        let status = loader.status();
        let stats = loader.stats();
        let reason = loader.snapshot().failure_reason();
        inner.loaded_snapshot = status.is_ok().then(|| name.to_string());

        if status.is_ok() {
            info!(target: "quicksnap::snapshotter", name, quickboot = is_quickboot,
                duration_ms = elapsed.as_millis() as u64, ram_bytes = stats.bytes_read,
                pages = stats.total_pages, zero_pages = stats.zero_pages,
                on_demand_pages = stats.on_demand_pages, "snapshot loaded");
        } else {
            warn!(target: "quicksnap::snapshotter", name, quickboot = is_quickboot,
                state = %status, failure_reason = reason.map(FailureReason::code),
                duration_ms = elapsed.as_millis() as u64, "snapshot load failed");
        }
        status
    }

    /// Wait until the current loader has every page resident
    pub fn finish_loading(&self) {
        let mut inner = self.inner.lock();
        if let Some(loader) = inner.loader.as_mut() {
            loader.synchronize();
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Set up a save of `name`
    ///
    /// The loader is joined if it loaded `name`, otherwise discarded.
    pub fn prepare_for_saving(&self, name: &str) -> OperationStatus {
        let snapshot = match Snapshot::new(&self.paths, name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name, error = %e, "cannot save snapshot");
                return OperationStatus::Error;
            }
        };
        let flags = {
            let mut inner = self.inner.lock();
            inner.release_loader_for_saving(name);
            inner.ram_index_flags()
        };

        self.collaborators.vm.vm_stop();
        let mut saver = Saver::new(snapshot, flags);
        self.collaborators.vm.vm_start();
        let status = saver.prepare();

        let mut inner = self.inner.lock();
        inner.saver = Some(saver);
        inner.state = if status.is_error() {
            SnapshotterState::Idle
        } else {
            SnapshotterState::SavingPrepared
        };
        status
    }

    /// Save `name` through the VM
    ///
    /// Returns the final saver status, or `Ok` if the VM never created one.
    pub fn save(&self, is_on_exit: bool, name: &str) -> OperationStatus {
        {
            let mut inner = self.inner.lock();
            inner.last_save_duration = None;
            inner.is_on_exit = is_on_exit;
        }
        if is_on_exit {
            self.collaborators.vm.set_exiting();
        }
        let started = Instant::now();
        self.collaborators.vm.snapshot_save(name, self);
        let elapsed = started.elapsed();

        let mut inner = self.inner.lock();
        inner.last_save_duration = Some(elapsed);
        let Some(saver) = inner.saver.as_ref() else {
            return OperationStatus::Ok;
        };
        let status = saver.status();
        let stats = saver.stats();
        if status.is_ok() {
            info!(target: "quicksnap::snapshotter", name, on_exit = is_on_exit,
                duration_ms = elapsed.as_millis() as u64, ram_bytes = stats.bytes_written,
                pages = stats.total_pages, zero_pages = stats.zero_pages,
                written_pages = stats.written_pages, "snapshot saved");
        } else {
            warn!(target: "quicksnap::snapshotter", name, on_exit = is_on_exit,
                state = %status,
                failure_reason = saver.snapshot().failure_reason().map(FailureReason::code),
                duration_ms = elapsed.as_millis() as u64, "snapshot save failed");
        }
        status
    }

    /// Stop the in-flight save and discard its output
    pub fn cancel_save(&self) {
        if let Some(saver) = self.inner.lock().saver.as_mut() {
            saver.cancel();
        }
    }

    /// Whether the save of `name` was canceled
    pub fn is_saving_canceled(&self, name: &str) -> bool {
        self.inner
            .lock()
            .saver
            .as_ref()
            .map_or(false, |s| s.snapshot().name() == name && s.is_canceled())
    }

    // ========================================================================
    // Generic save/load with pre-flight checks
    // ========================================================================

    fn show_error(&self, message: &str) {
        warn!(target: "quicksnap::snapshotter", "{message}");
        self.collaborators
            .window
            .show_message(message, MessageSeverity::Error, DEFAULT_MESSAGE_TIMEOUT);
    }

    /// Check that saving `name` now makes sense
    ///
    /// The user is told why when it does not.
    pub fn check_safe_to_save(&self, name: &str) -> Result<(), FailureReason> {
        if !self.is_snapshot_alive() {
            self.show_error("Skipping snapshot save: Emulator not booted (or ADB not online)");
            return Err(FailureReason::AdbOffline);
        }
        if !is_valid_snapshot_name(name) {
            self.show_error(&format!("Skipping snapshot save: Invalid snapshot name '{name}'"));
            return Err(FailureReason::NoSnapshotPb);
        }
        let env = &self.collaborators.environment;
        if !env.renderer_supports_snapshots() {
            self.show_error(&format!(
                "Skipping snapshot save: Renderer type '{}' doesn't support snapshotting",
                env.renderer_name()
            ));
            return Err(FailureReason::SnapshotsNotSupported);
        }
        if env
            .free_disk_bytes(self.paths.base())
            .map_or(false, |free| free < MIN_FREE_DISK_BYTES)
        {
            self.show_error("Not saving snapshot: Disk space < 2 GB");
            return Err(FailureReason::OutOfDiskSpace);
        }
        if self.collaborators.vm.is_snapshot_save_skipped() {
            self.show_error(
                "Skipping snapshot save: current state doesn't support snapshotting",
            );
            return Err(FailureReason::SnapshotsNotSupported);
        }
        Ok(())
    }

    /// Check that loading `name` now makes sense
    pub fn check_safe_to_load(&self, name: &str) -> Result<(), FailureReason> {
        if !is_valid_snapshot_name(name) {
            self.show_error(&format!("Skipping snapshot load: Invalid snapshot name '{name}'"));
            return Err(FailureReason::NoSnapshotPb);
        }
        let env = &self.collaborators.environment;
        if !env.renderer_supports_snapshots() {
            self.show_error(&format!(
                "Skipping snapshot load of '{name}': Renderer type '{}' doesn't support snapshotting",
                env.renderer_name()
            ));
            return Err(FailureReason::SnapshotsNotSupported);
        }
        Ok(())
    }

    /// Save `name` on user request
    pub fn save_generic(&self, name: &str) -> OperationStatus {
        if self.check_safe_to_save(name).is_err() {
            return OperationStatus::Error;
        }
        let status = self.save(false, name);
        self.handle_generic_save(name, status);
        status
    }

    /// Load `name` on user request
    pub fn load_generic(&self, name: &str) -> OperationStatus {
        if self.check_safe_to_load(name).is_err() {
            return OperationStatus::Error;
        }
        let status = self.load(false, name);
        self.handle_generic_load(name, status);
        status
    }

    /// Clean up after a user-requested save
    pub fn handle_generic_save(&self, name: &str, status: OperationStatus) {
        if status.is_ok() {
            return;
        }
        self.show_error(&format!(
            "Snapshot save for snapshot '{name}' failed. Cleaning it out"
        ));
        self.delete_snapshot(name);
    }

    /// Clean up after a user-requested load
    ///
    /// A validation failure leaves the session running. Anything else means
    /// guest state may be half loaded: the snapshot is deleted and the VM
    /// reset.
    pub fn handle_generic_load(&self, name: &str, status: OperationStatus) {
        if status.is_ok() || !self.has_loader() {
            return;
        }
        match self.loader_failure_reason() {
            Some(reason) => match reason.class() {
                FailureClass::Validation(_) => self.show_error(&format!(
                    "Snapshot '{name}' can not be loaded ({}). Continuing current session",
                    reason.code()
                )),
                FailureClass::Unrecoverable(_) | FailureClass::Unknown => {
                    self.show_error(&format!(
                        "Snapshot '{name}' can not be loaded ({}). Fatal error, resetting current session",
                        reason.code()
                    ));
                    self.delete_snapshot(name);
                    self.collaborators.vm.vm_reset();
                }
            },
            None => {
                self.show_error(&format!(
                    "Snapshot '{name}' can not be loaded (reason not set). Fatal error, resetting current session"
                ));
                self.delete_snapshot(name);
                self.collaborators.vm.vm_reset();
            }
        }
    }

    // ========================================================================
    // Delete / invalidate
    // ========================================================================

    /// Record the current load of `name` as invalid
    ///
    /// Returns false when no loader for `name` exists.
    pub fn report_invalid_load(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.loader.as_mut() {
            Some(loader) if loader.snapshot().name() == name => {
                loader.report_invalid();
                debug!(target: "quicksnap::snapshotter", name, "load reported invalid");
                true
            }
            _ => false,
        }
    }

    /// Invalidate `name` and remove its directory
    pub fn delete_snapshot(&self, name: &str) {
        self.invalidate_snapshot(name);
        let Ok(dir) = self.paths.snapshot_dir(name) else {
            return;
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(target: "quicksnap::snapshotter", name, "snapshot directory removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "quicksnap::snapshotter", name, error = %e,
                "cannot remove snapshot directory"),
        }
    }

    /// Make `name` unloadable: delete its VM state and RAM and leave a tombstone
    ///
    /// If `name` is the loaded snapshot, its background load is finished first.
    pub fn invalidate_snapshot(&self, name: &str) {
        let mut tombstone = match Snapshot::new(&self.paths, name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name, error = %e,
                    "cannot invalidate snapshot");
                return;
            }
        };

        let is_loaded = self.inner.lock().loaded_snapshot.as_deref() == Some(name);
        if is_loaded {
            let detector = &*self.collaborators.hang_detector;
            detector.pause(true);
            let _resume = HangResumeGuard::new(detector);
            let mut inner = self.inner.lock();
            if let Some(loader) = inner.loader.as_mut() {
                if loader.status() == OperationStatus::Ok {
                    loader.synchronize();
                }
            }
            inner.loaded_snapshot = None;
        }

        self.inner.lock().is_invalidating = true;
        self.collaborators.vm.snapshot_delete(name, self);
        self.inner.lock().is_invalidating = false;

        let ram_file = tombstone.ram_file_path();
        if let Err(e) = fs::remove_file(&ram_file) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(target: "quicksnap::snapshotter", name, path = %ram_file.display(),
                    error = %e, "cannot remove RAM file");
            }
        }
        tombstone.save_failure(FailureReason::Tombstone);
        info!(target: "quicksnap::snapshotter", name, "snapshot invalidated");
    }

    /// The process crashed while running `name`
    ///
    /// A crash shortly after loading is blamed on the snapshot.
    pub fn on_crashed_snapshot(&self, name: &str) {
        let recent = self
            .inner
            .lock()
            .last_load_at
            .map_or(false, |at| {
                at.elapsed() < Duration::from_millis(SNAPSHOT_CRASH_THRESHOLD_MS)
            });
        if recent {
            self.on_loading_failed(name, -EINVAL);
        }
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Register an operation observer
    pub fn add_operation_callback<F>(&self, callback: F)
    where
        F: Fn(SnapshotOperation, OperationStage) + Send + Sync + 'static,
    {
        self.observers.lock().push(Arc::new(callback));
    }

    fn notify(&self, op: SnapshotOperation, stage: OperationStage) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(op, stage);
        }
    }

    /// The VM starts saving `name`
    pub fn on_start_saving(&self, name: &str) -> bool {
        self.collaborators.hang_detector.pause(true);
        self.notify(SnapshotOperation::Save, OperationStage::Start);

        let snapshot = match Snapshot::new(&self.paths, name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name, error = %e, "cannot save snapshot");
                self.collaborators.hang_detector.pause(false);
                self.notify(SnapshotOperation::Save, OperationStage::End);
                return false;
            }
        };

        let failed = {
            let mut inner = self.inner.lock();
            inner.release_loader_for_saving(name);
            let flags = inner.ram_index_flags();
            let stale = inner
                .saver
                .as_ref()
                .map_or(true, |s| s.is_complete() || s.snapshot().name() != name);
            if stale {
                inner.saver = None;
            }
            let saver = inner.saver.get_or_insert_with(|| Saver::new(snapshot, flags));
            let status = saver.prepare();
            inner.state = SnapshotterState::SavingActive;
            status == OperationStatus::Error
        };
        if failed {
            self.on_saving_complete(name, -1);
            return false;
        }
        true
    }

    /// The VM finished saving `name` with `result` (0 = success)
    ///
    /// # Panics
    ///
    /// Panics if no save of `name` is active.
    pub fn on_saving_complete(&self, name: &str, result: i32) -> bool {
        let resume = HangResumeGuard::new(&*self.collaborators.hang_detector);
        let config = self.collaborators.vm.vm_configuration();
        let renderer = self.collaborators.environment.renderer_name();

        let status = {
            let mut inner = self.inner.lock();
            let parent = inner.loaded_snapshot.clone();
            let Some(saver) = inner
                .saver
                .as_mut()
                .filter(|s| s.snapshot().name() == name)
            else {
                panic!("snapshot save of '{name}' completed but no such save is active");
            };
            let status = saver.complete(result == 0, &config, &renderer, parent.as_deref());
            inner.state = SnapshotterState::Idle;
            status
        };
        drop(resume);
        self.notify(SnapshotOperation::Save, OperationStage::End);
        status.is_ok()
    }

    /// The VM could not even start saving `name`
    pub fn on_saving_failed(&self, name: &str, result: i32) {
        debug!(target: "quicksnap::snapshotter", name, result, "snapshot save failed to start");
    }

    /// The VM starts loading `name`
    pub fn on_start_loading(&self, name: &str) -> bool {
        self.collaborators.hang_detector.pause(true);
        self.notify(SnapshotOperation::Load, OperationStage::Start);

        let snapshot = match Snapshot::new(&self.paths, name) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name, error = %e, "cannot load snapshot");
                self.collaborators.hang_detector.pause(false);
                self.notify(SnapshotOperation::Load, OperationStage::End);
                return false;
            }
        };
        let config = self.collaborators.vm.vm_configuration();
        let renderer = self.collaborators.environment.renderer_name();

        let failed = {
            let mut inner = self.inner.lock();
            inner.loaded_snapshot = None;
            inner.saver = None;
            let stale = inner
                .loader
                .as_ref()
                .map_or(true, |l| l.is_complete() || l.snapshot().name() != name);
            if stale {
                if let Some(mut old) = inner.loader.take() {
                    old.interrupt();
                }
            }
            let base = self.paths.base();
            let loader = inner
                .loader
                .get_or_insert_with(|| Loader::new(snapshot, base));
            let status = loader.start(&config, &renderer);
            inner.state = SnapshotterState::LoadingActive;
            status.is_error()
        };
        if failed {
            self.on_loading_complete(name, -1);
            return false;
        }
        true
    }

    /// The VM finished loading `name` with `result` (0 = success)
    ///
    /// # Panics
    ///
    /// Panics if no load of `name` is active.
    pub fn on_loading_complete(&self, name: &str, result: i32) -> bool {
        let resume = HangResumeGuard::new(&*self.collaborators.hang_detector);
        let (status, reason) = {
            let mut inner = self.inner.lock();
            let Some(loader) = inner
                .loader
                .as_mut()
                .filter(|l| l.snapshot().name() == name)
            else {
                panic!("snapshot load of '{name}' completed but no such load is active");
            };
            let status = loader.complete(result == 0);
            let reason = loader.snapshot().failure_reason();
            inner.state = SnapshotterState::Idle;
            inner.last_load_at = Some(Instant::now());
            if status.is_ok() {
                inner.loaded_snapshot = Some(name.to_string());
            }
            (status, reason)
        };
        drop(resume);
        self.notify(SnapshotOperation::Load, OperationStage::End);

        if status.is_error() {
            self.collaborators
                .vm
                .set_failure_reason(name, reason.unwrap_or(FailureReason::InternalError));
            return false;
        }
        true
    }

    /// The VM failed to load `name` with negative errno `err`
    ///
    /// `-EINVAL` marks the current load invalid and does nothing else, since
    /// this may run from a crash handler.
    ///
    /// # Panics
    ///
    /// Panics if `err` is not negative.
    pub fn on_loading_failed(&self, name: &str, err: i32) {
        assert!(err < 0, "load failure for '{name}' reported with non-negative code {err}");
        let reason = {
            let mut inner = self.inner.lock();
            inner.saver = None;
            if err == -EINVAL {
                if let Some(loader) = inner.loader.as_mut() {
                    loader.on_invalid_snapshot_load();
                }
                return;
            }
            let Ok(snapshot) = Snapshot::new(&self.paths, name) else {
                return;
            };
            if let Some(mut old) = inner.loader.take() {
                old.interrupt();
            }
            let loader = Loader::failed(snapshot, self.paths.base(), -err);
            let reason = loader
                .snapshot()
                .failure_reason()
                .unwrap_or_else(|| FailureReason::from_errno(-err));
            inner.loader = Some(loader);
            inner.loaded_snapshot = None;
            inner.state = SnapshotterState::Idle;
            reason
        };
        debug!(target: "quicksnap::snapshotter", name, err, reason = reason.code(),
            "snapshot load failed to start");
        self.collaborators.vm.set_failure_reason(name, reason);
    }

    /// The VM starts deleting `name`
    pub fn on_start_delete(&self, _name: &str) -> bool {
        self.collaborators.hang_detector.pause(true);
        self.inner.lock().state = SnapshotterState::Deleting;
        true
    }

    /// The VM finished deleting `name` with `result` (0 = success)
    pub fn on_deleting_complete(&self, name: &str, result: i32) -> bool {
        let _resume = HangResumeGuard::new(&*self.collaborators.hang_detector);
        let remove_dir = {
            let mut inner = self.inner.lock();
            if result == 0 {
                if inner.saver.as_ref().map_or(false, |s| s.snapshot().name() == name) {
                    inner.saver = None;
                }
                if inner.loader.as_ref().map_or(false, |l| l.snapshot().name() == name) {
                    inner.loader = None;
                }
            }
            let remove_dir = result == 0 && !inner.is_invalidating;
            inner.is_invalidating = false;
            inner.state = SnapshotterState::Idle;
            remove_dir
        };
        if remove_dir {
            if let Ok(dir) = self.paths.snapshot_dir(name) {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(target: "quicksnap::snapshotter", name, error = %e,
                            "cannot remove snapshot directory");
                    }
                }
            }
        }
        true
    }

    // ========================================================================
    // RAM file backing
    // ========================================================================

    /// Guest RAM is mapped from `path`; `shared` if writes reach the file
    pub fn set_ram_file(&self, path: impl AsRef<Path>, shared: bool) {
        let mut inner = self.inner.lock();
        inner.ram_file = Some(path.as_ref().to_path_buf());
        inner.ram_file_shared = shared;
    }

    /// Update whether the RAM file mapping is shared
    pub fn set_ram_file_shared(&self, shared: bool) {
        self.inner.lock().ram_file_shared = shared;
    }

    /// Whether guest RAM is file-backed
    pub fn has_ram_file(&self) -> bool {
        self.inner.lock().ram_file.is_some()
    }

    /// Whether the RAM file mapping is shared
    pub fn is_ram_file_shared(&self) -> bool {
        self.inner.lock().ram_file_shared
    }

    /// RAM file path, if any
    pub fn ram_file(&self) -> Option<PathBuf> {
        self.inner.lock().ram_file.clone()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state
    pub fn state(&self) -> SnapshotterState {
        self.inner.lock().state
    }

    /// Guest booted and reachable
    pub fn is_snapshot_alive(&self) -> bool {
        self.collaborators.is_guest_alive()
    }

    /// Name of the snapshot the running state came from
    pub fn loaded_snapshot(&self) -> Option<String> {
        self.inner.lock().loaded_snapshot.clone()
    }

    /// Whether a saver exists
    pub fn has_saver(&self) -> bool {
        self.inner.lock().saver.is_some()
    }

    /// Whether a loader exists
    pub fn has_loader(&self) -> bool {
        self.inner.lock().loader.is_some()
    }

    /// Status of the current saver
    pub fn saver_status(&self) -> Option<OperationStatus> {
        self.inner.lock().saver.as_ref().map(Saver::status)
    }

    /// Status of the current loader
    pub fn loader_status(&self) -> Option<OperationStatus> {
        self.inner.lock().loader.as_ref().map(Loader::status)
    }

    /// Failure recorded for the current saver's snapshot
    pub fn saver_failure_reason(&self) -> Option<FailureReason> {
        self.inner
            .lock()
            .saver
            .as_ref()
            .and_then(|s| s.snapshot().failure_reason())
    }

    /// Failure recorded for the current loader's snapshot
    pub fn loader_failure_reason(&self) -> Option<FailureReason> {
        self.inner
            .lock()
            .loader
            .as_ref()
            .and_then(|l| l.snapshot().failure_reason())
    }

    /// A save was prepared or started and has not completed
    pub fn is_saving_in_progress(&self) -> bool {
        self.inner.lock().saver.as_ref().map_or(false, |s| !s.is_complete())
    }

    /// A load was prepared or started and has not completed
    pub fn is_loading_in_progress(&self) -> bool {
        self.inner.lock().loader.as_ref().map_or(false, |l| !l.is_complete())
    }

    /// Duration of the last `load`
    pub fn last_load_duration(&self) -> Option<Duration> {
        self.inner.lock().last_load_duration
    }

    /// Duration of the last `save`
    pub fn last_save_duration(&self) -> Option<Duration> {
        self.inner.lock().last_save_duration
    }

    /// RAM counters of the current saver
    pub fn save_stats(&self) -> Option<RamSaveStats> {
        self.inner.lock().saver.as_ref().map(Saver::stats)
    }

    /// RAM counters of the current loader
    pub fn load_stats(&self) -> Option<RamLoadStats> {
        self.inner.lock().loader.as_ref().map(Loader::stats)
    }

    /// Whether the last save was requested on exit
    pub fn is_on_exit(&self) -> bool {
        self.inner.lock().is_on_exit
    }
}

impl OperationCallbacks for Snapshotter {
    fn on_start(&self, op: SnapshotOperation, name: &str) -> bool {
        match op {
            SnapshotOperation::Save => self.on_start_saving(name),
            SnapshotOperation::Load => self.on_start_loading(name),
            SnapshotOperation::Delete => self.on_start_delete(name),
        }
    }

    fn on_end(&self, op: SnapshotOperation, name: &str, result: i32) -> bool {
        match op {
            SnapshotOperation::Save => self.on_saving_complete(name, result),
            SnapshotOperation::Load => self.on_loading_complete(name, result),
            SnapshotOperation::Delete => self.on_deleting_complete(name, result),
        }
    }

    fn on_quick_fail(&self, op: SnapshotOperation, name: &str, result: i32) {
        match op {
            SnapshotOperation::Save => self.on_saving_failed(name, result),
            SnapshotOperation::Load => self.on_loading_failed(name, result),
            SnapshotOperation::Delete => {}
        }
    }

    fn is_canceled(&self, op: SnapshotOperation, name: &str) -> bool {
        match op {
            SnapshotOperation::Save => self.is_saving_canceled(name),
            SnapshotOperation::Load | SnapshotOperation::Delete => false,
        }
    }
}

impl RamOperations for Snapshotter {
    fn register_block(&self, op: SnapshotOperation, mut block: RamBlock) {
        if !block.path.is_empty() {
            block.path = portable_path(self.paths.base(), Path::new(&block.path));
        }
        let mut inner = self.inner.lock();
        match op {
            SnapshotOperation::Save => {
                if let Some(ram) = inner.saver.as_mut().and_then(Saver::ram_saver_mut) {
                    ram.register_block(block);
                }
            }
            SnapshotOperation::Load => {
                if let Some(ram) = inner.loader.as_mut().and_then(Loader::ram_loader_mut) {
                    ram.register_block(block);
                }
            }
            SnapshotOperation::Delete => {
                warn!(target: "quicksnap::snapshotter", block = %block.id,
                    "RAM block registered for a delete");
            }
        }
    }

    fn start_loading(&self) -> bool {
        let mut inner = self.inner.lock();
        let is_quickboot = inner.is_quickboot;
        inner
            .loader
            .as_mut()
            .and_then(Loader::ram_loader_mut)
            .map_or(false, |ram| ram.start(is_quickboot))
    }

    fn save_page(&self, block_offset: u64, page_offset: u64, size: usize) -> usize {
        self.inner
            .lock()
            .saver
            .as_mut()
            .and_then(Saver::ram_saver_mut)
            .map_or(0, |ram| ram.save_page(block_offset, page_offset, size))
    }

    fn saving_complete(&self) -> bool {
        self.inner
            .lock()
            .saver
            .as_mut()
            .map_or(false, Saver::finish_ram)
    }

    fn load_ram(&self, ptr: *const u8, size: usize) {
        let inner = self.inner.lock();
        if let Some(ram) = inner.loader.as_ref().and_then(Loader::ram_loader) {
            ram.load_ram(ptr, size);
        }
    }
}

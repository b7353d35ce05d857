//! Quickboot policy
//!
//! Decides on start whether to cold boot or load the quickboot snapshot,
//! classifies load failures, watches the loaded guest through the
//! [`LivenessMonitor`], and decides on exit whether the session is worth
//! saving.
//!
//! Load failures are classified by [`FailureReason::class`]:
//! - validation band: nothing was touched; cold boot and keep the snapshot
//! - unrecoverable band or unknown: guest state may be half loaded; delete
//!   the snapshot and reset the VM

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quicksnap_core::{FailureClass, FailureReason, OperationStatus, DEFAULT_BOOT_SNAPSHOT};
use quicksnap_snapshot::{MessageSeverity, Snapshotter, DEFAULT_MESSAGE_TIMEOUT};
use tracing::{debug, info, warn};

use crate::choice::QuickbootChoice;
use crate::config::QuickbootConfig;
use crate::liveness::{LivenessMonitor, LivenessSettings, BOOT_COMPLETED_MARKER};
use crate::looper::Scheduler;

/// Where the quickboot session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickbootState {
    /// `load` has not run
    NotStarted,
    /// Cold boot requested by the command line or the device configuration
    ColdBootRequested,
    /// The quickboot feature is off
    FeatureDisabled,
    /// The renderer cannot snapshot
    RendererUnsupported,
    /// A load is running
    Loading,
    /// The snapshot loaded
    Loaded,
    /// The load failed; the VM cold boots
    LoadFailed,
}

/// Who asked for a cold boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdBootSource {
    /// Command-line flag
    CommandLine,
    /// Device configuration
    DeviceConfig,
}

impl fmt::Display for ColdBootSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColdBootSource::CommandLine => write!(f, "command line"),
            ColdBootSource::DeviceConfig => write!(f, "device configuration"),
        }
    }
}

/// How a failed load was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureReport {
    /// Unknown or unrecoverable: snapshot deleted, VM reset
    Reset(FailureReason),
    /// No snapshot, and the user never saves: plain cold boot
    ColdBootByUser,
    /// Validation failure: cold boot, snapshot kept
    ColdBoot(FailureReason),
}

impl LoadFailureReport {
    /// Whether this report forced a VM reset
    pub fn resets_vm(self) -> bool {
        matches!(self, LoadFailureReport::Reset(_))
    }
}

/// Why a save on exit did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveSkipReason {
    /// RAM is file-backed but not shared
    RamNotShared,
    /// Not quickboot-loaded and the guest never came alive
    NotBooted,
    /// The quickboot feature is off
    FeatureDisabled,
    /// Command-line flag
    CommandLine,
    /// User preference is to never save
    UserPreference,
    /// The renderer cannot snapshot
    UnsupportedRenderer,
    /// Session too short to have changed anything
    LowUptime,
    /// The VM flagged its current state as unsaveable
    SkippedByVm,
}

impl fmt::Display for SaveSkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SaveSkipReason::RamNotShared => "RAM not mapped as shared",
            SaveSkipReason::NotBooted => "emulator hasn't finished booting",
            SaveSkipReason::FeatureDisabled => "quickboot disabled",
            SaveSkipReason::CommandLine => "command-line flag",
            SaveSkipReason::UserPreference => "user preference",
            SaveSkipReason::UnsupportedRenderer => "renderer doesn't support snapshotting",
            SaveSkipReason::LowUptime => "session too short",
            SaveSkipReason::SkippedByVm => "current state does not support snapshotting",
        };
        f.write_str(text)
    }
}

/// Result of a save on exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Saved after `uptime` of session
    Saved {
        /// Session length at save time
        uptime: Duration,
    },
    /// Not attempted
    Skipped(SaveSkipReason),
    /// Attempted and failed; the snapshot was deleted
    Failed(FailureReason),
}

impl SaveOutcome {
    /// Whether the state was saved
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

struct SessionState {
    state: QuickbootState,
    loaded: bool,
    loaded_snapshot: Option<String>,
    load_status: Option<OperationStatus>,
    load_attempted: Option<String>,
    started_at: Duration,
    loaded_at: Option<Duration>,
    short_run_check: bool,
    last_failure_report: Option<LoadFailureReport>,
    last_save: Option<SaveOutcome>,
}

/// Quickboot policy over one [`Snapshotter`]
pub struct Quickboot {
    snapshotter: Arc<Snapshotter>,
    scheduler: Arc<dyn Scheduler>,
    config: QuickbootConfig,
    liveness: LivenessMonitor,
    session: Mutex<SessionState>,
}

impl Quickboot {
    /// Policy for a session starting now
    pub fn new(
        snapshotter: Arc<Snapshotter>,
        scheduler: Arc<dyn Scheduler>,
        config: QuickbootConfig,
    ) -> Self {
        let marker = snapshotter.paths().base().join(BOOT_COMPLETED_MARKER);
        let liveness = LivenessMonitor::new(
            Arc::clone(&scheduler),
            Arc::clone(&snapshotter),
            LivenessSettings::from_config(&config, Some(marker)),
        );
        let session = SessionState {
            state: QuickbootState::NotStarted,
            loaded: false,
            loaded_snapshot: None,
            load_status: None,
            load_attempted: None,
            started_at: scheduler.now(),
            loaded_at: None,
            short_run_check: config.short_run_check,
            last_failure_report: None,
            last_save: None,
        };
        Quickboot {
            snapshotter,
            scheduler,
            config,
            liveness,
            session: Mutex::new(session),
        }
    }

    fn show(&self, text: &str, severity: MessageSeverity) {
        self.snapshotter
            .collaborators()
            .window
            .show_message(text, severity, DEFAULT_MESSAGE_TIMEOUT);
    }

    fn set_state(&self, state: QuickbootState) -> QuickbootState {
        self.session.lock().state = state;
        state
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load the quickboot snapshot `name` (default snapshot if empty)
    ///
    /// Returns the resulting state. Every state but `Loaded` means the VM
    /// cold boots.
    pub fn load(&self, name: &str) -> QuickbootState {
        if !self.config.enabled {
            info!(target: "quicksnap::quickboot", "cold boot: quickboot disabled");
            return self.set_state(QuickbootState::FeatureDisabled);
        }
        let name = if name.is_empty() { DEFAULT_BOOT_SNAPSHOT } else { name };

        if self.config.cold_boot_requested() {
            let source = if self.config.force_cold_boot {
                ColdBootSource::DeviceConfig
            } else {
                ColdBootSource::CommandLine
            };
            // Only one-off requests are worth a message.
            if source == ColdBootSource::CommandLine {
                self.show("Cold boot: requested by the user", MessageSeverity::Info);
            }
            info!(target: "quicksnap::quickboot", source = %source, "cold boot requested");
            return self.set_state(QuickbootState::ColdBootRequested);
        }

        let environment = &self.snapshotter.collaborators().environment;
        if !environment.renderer_supports_snapshots() {
            let renderer = environment.renderer_name();
            self.show(
                &format!("Cold boot: selected renderer '{renderer}' doesn't support snapshots"),
                MessageSeverity::Info,
            );
            info!(target: "quicksnap::quickboot", renderer = %renderer,
                "cold boot: renderer doesn't support snapshots");
            return self.set_state(QuickbootState::RendererUnsupported);
        }

        {
            let mut session = self.session.lock();
            session.state = QuickbootState::Loading;
            session.loaded = false;
            session.loaded_snapshot = None;
            session.load_attempted = Some(name.to_string());
            session.last_failure_report = None;
        }

        let status = self.snapshotter.load(true, name);
        let loaded_at = self.scheduler.now();
        {
            let mut session = self.session.lock();
            session.load_status = Some(status);
            session.loaded_at = Some(loaded_at);
        }

        if status.is_ok() {
            {
                let mut session = self.session.lock();
                session.loaded = true;
                session.loaded_snapshot = Some(name.to_string());
                session.state = QuickbootState::Loaded;
            }
            self.liveness.start(name, loaded_at);
            return QuickbootState::Loaded;
        }

        if let Some(reason) = self.snapshotter.loader_failure_reason() {
            // Failed before or while loading with a known cause
            self.decide_failure_report(name, reason);
        } else {
            self.show("Cold boot: snapshot failed to load", MessageSeverity::Warning);
            warn!(target: "quicksnap::quickboot", name, "snapshot failed to load, resetting");
            self.snapshotter.collaborators().vm.vm_reset();
        }
        self.set_state(QuickbootState::LoadFailed)
    }

    /// Handle a load of `name` that failed with `reason`
    pub fn decide_failure_report(&self, name: &str, reason: FailureReason) -> LoadFailureReport {
        let report = match reason.class() {
            FailureClass::Unknown | FailureClass::Unrecoverable(_) => {
                self.show(
                    &format!("Resetting for cold boot: {}", reason.message()),
                    MessageSeverity::Warning,
                );
                self.snapshotter.report_invalid_load(name);
                self.snapshotter.delete_snapshot(name);
                self.snapshotter.collaborators().vm.vm_reset();
                LoadFailureReport::Reset(reason)
            }
            FailureClass::Validation(FailureReason::NoSnapshotInImage)
                if !self.config.save_on_exit =>
            {
                self.show("Cold boot based on user configuration", MessageSeverity::Info);
                LoadFailureReport::ColdBootByUser
            }
            FailureClass::Validation(reason) => {
                if reason != FailureReason::NoSnapshotInImage {
                    self.show(&format!("Cold boot: {}", reason.message()), MessageSeverity::Info);
                }
                LoadFailureReport::ColdBoot(reason)
            }
        };
        warn!(target: "quicksnap::quickboot", name, failure_reason = reason.code(),
            report = ?report, "quickboot load failed");
        self.session.lock().last_failure_report = Some(report);
        report
    }

    /// The process is crashing; blame a recent load
    pub fn on_crash(&self) {
        let attempted = self.session.lock().load_attempted.clone();
        if let Some(name) = attempted {
            self.snapshotter.on_crashed_snapshot(&name);
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Save the session into `name` (default snapshot if empty)
    ///
    /// Checks run in a fixed order and the first that applies decides the
    /// skip reason. A failed save deletes the snapshot.
    pub fn save(&self, name: &str) -> SaveOutcome {
        let outcome = self.try_save(name);
        match outcome {
            SaveOutcome::Saved { uptime } => {
                info!(target: "quicksnap::quickboot", name,
                    uptime_ms = uptime.as_millis() as u64,
                    duration_ms = self.snapshotter.last_save_duration()
                        .map_or(0, |d| d.as_millis() as u64),
                    "quickboot save succeeded");
            }
            SaveOutcome::Skipped(reason) => {
                warn!(target: "quicksnap::quickboot", name, reason = %reason, "not saving state");
            }
            SaveOutcome::Failed(reason) => {
                warn!(target: "quicksnap::quickboot", name, failure_reason = reason.code(),
                    "quickboot save failed");
            }
        }
        self.session.lock().last_save = Some(outcome);
        outcome
    }

    fn try_save(&self, name: &str) -> SaveOutcome {
        let snapshotter = &self.snapshotter;
        let collaborators = snapshotter.collaborators();
        let (loaded, started_at, loaded_at, short_run_check) = {
            let session = self.session.lock();
            (
                session.loaded,
                session.started_at,
                session.loaded_at,
                session.short_run_check,
            )
        };
        let should_try = loaded || snapshotter.is_snapshot_alive();
        let has_ram_file = snapshotter.has_ram_file();
        let ram_shared = snapshotter.is_ram_file_shared();

        if has_ram_file && !ram_shared {
            return SaveOutcome::Skipped(SaveSkipReason::RamNotShared);
        }
        if !should_try {
            return SaveOutcome::Skipped(SaveSkipReason::NotBooted);
        }
        self.liveness.stop();

        if !self.config.enabled {
            return SaveOutcome::Skipped(SaveSkipReason::FeatureDisabled);
        }
        if self.config.no_snapshot_save {
            self.show(
                "Discarding the changed state: command-line flag",
                MessageSeverity::Info,
            );
            return SaveOutcome::Skipped(SaveSkipReason::CommandLine);
        }
        if !ram_shared && !self.config.save_on_exit {
            return SaveOutcome::Skipped(SaveSkipReason::UserPreference);
        }

        let name = if name.is_empty() { DEFAULT_BOOT_SNAPSHOT } else { name };
        let uptime = self
            .scheduler
            .now()
            .saturating_sub(loaded_at.unwrap_or(started_at));
        let ran_long_enough = (has_ram_file && ram_shared) || uptime > self.config.min_uptime();

        if !collaborators.environment.renderer_supports_snapshots() {
            let renderer = collaborators.environment.renderer_name();
            if ran_long_enough {
                // The default snapshot no longer matches this session.
                warn!(target: "quicksnap::quickboot", name, renderer = %renderer,
                    "cleaning out the default snapshot to preserve the current session");
                snapshotter.delete_snapshot(name);
            }
            return SaveOutcome::Skipped(SaveSkipReason::UnsupportedRenderer);
        }
        if short_run_check && !ran_long_enough {
            debug!(target: "quicksnap::quickboot", uptime_ms = uptime.as_millis() as u64,
                min_ms = self.config.min_uptime_ms, "session too short to save");
            return SaveOutcome::Skipped(SaveSkipReason::LowUptime);
        }
        if collaborators.vm.is_snapshot_save_skipped() {
            return SaveOutcome::Skipped(SaveSkipReason::SkippedByVm);
        }

        info!(target: "quicksnap::quickboot", name, uptime_ms = uptime.as_millis() as u64,
            "saving state on exit");
        let status = snapshotter.save(true, name);
        if status.is_ok() {
            return SaveOutcome::Saved { uptime };
        }
        let reason = snapshotter
            .saver_failure_reason()
            .unwrap_or(FailureReason::InternalError);
        self.show(
            "State saving failed, cleaning out the snapshot",
            MessageSeverity::Warning,
        );
        snapshotter.delete_snapshot(name);
        SaveOutcome::Failed(reason)
    }

    /// Save on exit, then clean up and remember the user's choice
    ///
    /// A failed or skipped save invalidates the snapshot when RAM is shared
    /// (the file no longer matches it) or the configuration asks for it.
    pub fn save_on_exit(&self, name: &str) -> SaveOutcome {
        let name = if name.is_empty() { DEFAULT_BOOT_SNAPSHOT } else { name };
        let outcome = self.save(name);

        let needs_invalidation = !outcome.is_saved()
            && (self.snapshotter.is_ram_file_shared() || self.config.invalidate_on_failed_save);
        if needs_invalidation {
            self.invalidate(name);
        }

        if self.snapshotter.has_ram_file() {
            let choice = QuickbootChoice {
                save_on_exit: self.config.save_on_exit,
            };
            let path = self.snapshotter.paths().quickboot_choice_file();
            if let Err(e) = choice.write(&path) {
                warn!(target: "quicksnap::quickboot", error = %e, "cannot persist quickboot choice");
            }
        }
        outcome
    }

    /// Delete the quickboot snapshot `name` (default snapshot if empty)
    pub fn invalidate(&self, name: &str) {
        let name = if name.is_empty() { DEFAULT_BOOT_SNAPSHOT } else { name };
        self.snapshotter.delete_snapshot(name);
    }

    /// Toggle the minimum-uptime rule for saving
    pub fn set_short_run_check(&self, enabled: bool) {
        self.session.lock().short_run_check = enabled;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Current state
    pub fn state(&self) -> QuickbootState {
        self.session.lock().state
    }

    /// Whether this session came from a quickboot load
    pub fn is_loaded(&self) -> bool {
        self.session.lock().loaded
    }

    /// Name of the loaded snapshot
    pub fn loaded_snapshot(&self) -> Option<String> {
        self.session.lock().loaded_snapshot.clone()
    }

    /// Status of the last load
    pub fn load_status(&self) -> Option<OperationStatus> {
        self.session.lock().load_status
    }

    /// How the last failed load was handled
    pub fn last_failure_report(&self) -> Option<LoadFailureReport> {
        self.session.lock().last_failure_report
    }

    /// Outcome of the last save
    pub fn last_save(&self) -> Option<SaveOutcome> {
        self.session.lock().last_save
    }

    /// Liveness monitor of the loaded guest
    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Configuration in use
    pub fn config(&self) -> &QuickbootConfig {
        &self.config
    }

    /// Snapshotter driven by this policy
    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looper::ManualLooper;
    use quicksnap_snapshot::testing::FakeHost;
    use quicksnap_snapshot::SnapshotPaths;
    use tempfile::TempDir;

    fn quickboot(dir: &TempDir, config: QuickbootConfig) -> (FakeHost, Arc<ManualLooper>, Quickboot) {
        let paths = SnapshotPaths::from_base(dir.path());
        let host = FakeHost::new(&paths);
        let snapshotter = Arc::new(Snapshotter::new(paths, host.collaborators()));
        let looper = Arc::new(ManualLooper::new());
        let qb = Quickboot::new(snapshotter, looper.clone(), config);
        (host, looper, qb)
    }

    #[test]
    fn test_feature_disabled() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            enabled: false,
            ..QuickbootConfig::default()
        };
        let (host, _looper, qb) = quickboot(&dir, config);
        assert_eq!(qb.load(""), QuickbootState::FeatureDisabled);
        assert!(host.window.messages().is_empty());
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::FeatureDisabled));
    }

    #[test]
    fn test_cold_boot_from_command_line_shows_message() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            no_snapshot_load: true,
            ..QuickbootConfig::default()
        };
        let (host, _looper, qb) = quickboot(&dir, config);
        assert_eq!(qb.load(""), QuickbootState::ColdBootRequested);
        assert!(host.window.contains("requested by the user"));
    }

    #[test]
    fn test_cold_boot_from_device_config_is_silent() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            no_snapshot_load: true,
            force_cold_boot: true,
            ..QuickbootConfig::default()
        };
        let (host, _looper, qb) = quickboot(&dir, config);
        assert_eq!(qb.load(""), QuickbootState::ColdBootRequested);
        assert!(host.window.messages().is_empty());
    }

    #[test]
    fn test_unsupported_renderer() {
        let dir = TempDir::new().unwrap();
        let (host, _looper, qb) = quickboot(&dir, QuickbootConfig::default());
        host.environment.set_supports_snapshots(false);
        host.environment.set_renderer("software");
        assert_eq!(qb.load(""), QuickbootState::RendererUnsupported);
        assert!(host.window.contains("'software'"));
    }

    #[test]
    fn test_missing_snapshot_is_silent_cold_boot() {
        let dir = TempDir::new().unwrap();
        let (host, _looper, qb) = quickboot(&dir, QuickbootConfig::default());
        assert_eq!(qb.load(""), QuickbootState::LoadFailed);
        assert_eq!(
            qb.last_failure_report(),
            Some(LoadFailureReport::ColdBoot(FailureReason::NoSnapshotInImage))
        );
        assert!(host.window.messages().is_empty());
        assert_eq!(host.vm.reset_count(), 0);
    }

    #[test]
    fn test_missing_snapshot_with_never_save() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            save_on_exit: false,
            ..QuickbootConfig::default()
        };
        let (host, _looper, qb) = quickboot(&dir, config);
        qb.load("");
        assert_eq!(qb.last_failure_report(), Some(LoadFailureReport::ColdBootByUser));
        assert!(host.window.contains("user configuration"));
    }

    #[test]
    fn test_failure_bands() {
        let dir = TempDir::new().unwrap();
        let (host, _looper, qb) = quickboot(&dir, QuickbootConfig::default());
        for reason in FailureReason::ALL {
            let resets_before = host.vm.reset_count();
            let report = qb.decide_failure_report("band", reason);
            let reset = host.vm.reset_count() > resets_before;
            match reason.class() {
                FailureClass::Validation(_) => {
                    assert!(!reset, "{reason:?} must not reset");
                    assert!(!report.resets_vm());
                }
                FailureClass::Unrecoverable(_) | FailureClass::Unknown => {
                    assert!(reset, "{reason:?} must reset");
                    assert_eq!(report, LoadFailureReport::Reset(reason));
                }
            }
        }
    }

    #[test]
    fn test_low_uptime_skips_without_disk_writes() {
        let dir = TempDir::new().unwrap();
        let (_host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_millis(500));
        assert_eq!(qb.save("quick"), SaveOutcome::Skipped(SaveSkipReason::LowUptime));
        assert!(!dir.path().join("snapshots").exists());
    }

    #[test]
    fn test_short_run_check_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let (_host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        qb.set_short_run_check(false);
        looper.advance(Duration::from_millis(500));
        assert!(qb.save("quick").is_saved());
    }

    #[test]
    fn test_not_booted_skips() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        host.guest.set_boot_completed(false);
        looper.advance(Duration::from_secs(5));
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::NotBooted));
    }

    #[test]
    fn test_ram_file_not_shared_skips_first() {
        let dir = TempDir::new().unwrap();
        let (_host, _looper, qb) = quickboot(&dir, QuickbootConfig::default());
        qb.snapshotter().set_ram_file(dir.path().join("ram.img"), false);
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::RamNotShared));
    }

    #[test]
    fn test_command_line_no_save() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            no_snapshot_save: true,
            ..QuickbootConfig::default()
        };
        let (host, looper, qb) = quickboot(&dir, config);
        looper.advance(Duration::from_secs(5));
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::CommandLine));
        assert!(host.window.contains("Discarding the changed state"));
    }

    #[test]
    fn test_user_preference_never_save() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            save_on_exit: false,
            ..QuickbootConfig::default()
        };
        let (_host, looper, qb) = quickboot(&dir, config);
        looper.advance(Duration::from_secs(5));
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::UserPreference));
    }

    #[test]
    fn test_unsupported_renderer_cleans_out_long_session() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_secs(5));
        assert!(qb.save("").is_saved());

        host.environment.set_supports_snapshots(false);
        looper.advance(Duration::from_secs(5));
        assert_eq!(
            qb.save(""),
            SaveOutcome::Skipped(SaveSkipReason::UnsupportedRenderer)
        );
        assert!(!dir.path().join("snapshots").join(DEFAULT_BOOT_SNAPSHOT).exists());
    }

    #[test]
    fn test_vm_skip_flag() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        host.vm.set_save_skipped(true);
        looper.advance(Duration::from_secs(5));
        assert_eq!(qb.save(""), SaveOutcome::Skipped(SaveSkipReason::SkippedByVm));
    }

    #[test]
    fn test_failed_save_deletes_snapshot() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_secs(5));
        host.vm.fail_next_save();
        assert_eq!(
            qb.save(""),
            SaveOutcome::Failed(FailureReason::EmulationEngineFailed)
        );
        assert!(host.window.contains("State saving failed"));
        assert!(!dir.path().join("snapshots").join(DEFAULT_BOOT_SNAPSHOT).exists());
    }

    #[test]
    fn test_save_then_load_starts_liveness() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_secs(5));
        assert!(qb.save_on_exit("").is_saved());

        let paths = SnapshotPaths::from_base(dir.path());
        let snapshotter = Arc::new(Snapshotter::new(paths, host.collaborators()));
        let next = Quickboot::new(snapshotter, looper.clone(), QuickbootConfig::default());
        assert_eq!(next.load(""), QuickbootState::Loaded);
        assert!(next.is_loaded());
        assert_eq!(next.loaded_snapshot().as_deref(), Some(DEFAULT_BOOT_SNAPSHOT));
        assert!(next.liveness().is_monitoring());

        looper.advance(Duration::from_millis(100));
        assert!(!next.liveness().is_monitoring());
        assert!(host.window.messages().is_empty());
    }

    #[test]
    fn test_loaded_session_uptime_counts_from_load() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_secs(5));
        assert!(qb.save("").is_saved());

        let paths = SnapshotPaths::from_base(dir.path());
        let snapshotter = Arc::new(Snapshotter::new(paths, host.collaborators()));
        let next = Quickboot::new(snapshotter, looper.clone(), QuickbootConfig::default());
        next.load("");
        host.guest.set_online(false);
        looper.advance(Duration::from_millis(200));
        assert_eq!(next.save(""), SaveOutcome::Skipped(SaveSkipReason::LowUptime));
        assert!(!next.liveness().is_monitoring());
    }

    #[test]
    fn test_save_on_exit_invalidates_when_requested() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            invalidate_on_failed_save: true,
            ..QuickbootConfig::default()
        };
        let (host, looper, qb) = quickboot(&dir, config);
        looper.advance(Duration::from_secs(5));
        assert!(qb.save("").is_saved());
        let deletes = host.vm.delete_count();

        host.vm.set_save_skipped(true);
        assert!(!qb.save_on_exit("").is_saved());
        assert!(host.vm.delete_count() > deletes);
    }

    #[test]
    fn test_save_on_exit_persists_choice_with_ram_file() {
        let dir = TempDir::new().unwrap();
        let config = QuickbootConfig {
            save_on_exit: false,
            ..QuickbootConfig::default()
        };
        let (_host, _looper, qb) = quickboot(&dir, config);
        qb.snapshotter().set_ram_file(dir.path().join("ram.img"), true);
        qb.save_on_exit("");
        let choice =
            QuickbootChoice::load(&qb.snapshotter().paths().quickboot_choice_file()).unwrap();
        assert!(!choice.save_on_exit);
    }

    #[test]
    fn test_invalidate_default() {
        let dir = TempDir::new().unwrap();
        let (host, looper, qb) = quickboot(&dir, QuickbootConfig::default());
        looper.advance(Duration::from_secs(5));
        assert!(qb.save("").is_saved());
        qb.invalidate("");
        assert!(!dir.path().join("snapshots").join(DEFAULT_BOOT_SNAPSHOT).exists());
        assert_eq!(host.vm.delete_count(), 1);
    }
}

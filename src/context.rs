//! Process-wide snapshot context
//!
//! [`SnapshotContext`] wires one [`Snapshotter`] and one [`Quickboot`] over a
//! snapshot base directory. Components take it by reference; the global slot
//! below exists only for hosts whose outermost boundary cannot carry it.

use std::io;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use quicksnap_quickboot::{
    ConfigError, Quickboot, QuickbootChoice, QuickbootConfig, Scheduler, CONFIG_FILE_NAME,
};
use quicksnap_snapshot::{Collaborators, SnapshotPaths, Snapshotter};
use thiserror::Error;
use tracing::{debug, info};

/// Errors setting up a context
#[derive(Debug, Error)]
pub enum ContextError {
    /// Snapshot directories could not be created
    #[error("cannot create snapshot directories: {0}")]
    Io(#[from] io::Error),

    /// Quickboot configuration is unreadable or invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `initialize` ran twice without `finalize`
    #[error("snapshot context is already initialized")]
    AlreadyInitialized,
}

/// Everything snapshot-related for one VM process
pub struct SnapshotContext {
    snapshotter: Arc<Snapshotter>,
    quickboot: Quickboot,
}

impl SnapshotContext {
    /// Wire a context from explicit parts
    pub fn new(
        paths: SnapshotPaths,
        collaborators: Collaborators,
        scheduler: Arc<dyn Scheduler>,
        config: QuickbootConfig,
    ) -> Self {
        let snapshotter = Arc::new(Snapshotter::new(paths, collaborators));
        let quickboot = Quickboot::new(Arc::clone(&snapshotter), scheduler, config);
        SnapshotContext {
            snapshotter,
            quickboot,
        }
    }

    /// Open the snapshot base directory `base`
    ///
    /// Creates the directory layout and a default `quickboot.toml` when
    /// missing. A persisted quickboot choice overrides the configured
    /// save-on-exit preference.
    pub fn open(
        base: &Path,
        collaborators: Collaborators,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, ContextError> {
        let paths = SnapshotPaths::from_base(base);
        paths.create_directories()?;

        let config_path = base.join(CONFIG_FILE_NAME);
        QuickbootConfig::write_default_if_missing(&config_path)?;
        let mut config = QuickbootConfig::from_file(&config_path)?;

        let choice_path = paths.quickboot_choice_file();
        if choice_path.exists() {
            let choice = QuickbootChoice::load(&choice_path)?;
            debug!(target: "quicksnap::quickboot", save_on_exit = choice.save_on_exit,
                "using persisted quickboot choice");
            config.save_on_exit = choice.save_on_exit;
        }

        info!(target: "quicksnap::quickboot", base = %base.display(),
            enabled = config.enabled, "snapshot context opened");
        Ok(Self::new(paths, collaborators, scheduler, config))
    }

    /// The snapshot state machine
    pub fn snapshotter(&self) -> &Arc<Snapshotter> {
        &self.snapshotter
    }

    /// The quickboot policy
    pub fn quickboot(&self) -> &Quickboot {
        &self.quickboot
    }

    /// Directory layout
    pub fn paths(&self) -> &SnapshotPaths {
        self.snapshotter.paths()
    }
}

// =============================================================================
// Process-wide slot
// =============================================================================

static CONTEXT: Lazy<Mutex<Option<Arc<SnapshotContext>>>> = Lazy::new(|| Mutex::new(None));

/// Install `context` as the process-wide context
pub fn initialize(context: SnapshotContext) -> Result<Arc<SnapshotContext>, ContextError> {
    let mut slot = CONTEXT.lock();
    if slot.is_some() {
        return Err(ContextError::AlreadyInitialized);
    }
    let context = Arc::new(context);
    *slot = Some(Arc::clone(&context));
    Ok(context)
}

/// The process-wide context, if initialized
pub fn get() -> Option<Arc<SnapshotContext>> {
    CONTEXT.lock().clone()
}

/// Remove the process-wide context
///
/// Returns it so the caller decides when it is dropped.
pub fn finalize() -> Option<Arc<SnapshotContext>> {
    CONTEXT.lock().take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicksnap_quickboot::ManualLooper;
    use quicksnap_snapshot::testing::FakeHost;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout_and_config() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let host = FakeHost::new(&paths);
        let context =
            SnapshotContext::open(dir.path(), host.collaborators(), Arc::new(ManualLooper::new()))
                .unwrap();
        assert!(paths.snapshots_dir().is_dir());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        assert_eq!(context.quickboot().config(), &QuickbootConfig::default());
    }

    #[test]
    fn test_persisted_choice_overrides_config() {
        let dir = TempDir::new().unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        QuickbootChoice { save_on_exit: false }
            .write(&paths.quickboot_choice_file())
            .unwrap();
        let host = FakeHost::new(&paths);
        let context =
            SnapshotContext::open(dir.path(), host.collaborators(), Arc::new(ManualLooper::new()))
                .unwrap();
        assert!(!context.quickboot().config().save_on_exit);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "liveness_interval_ms = 0\n").unwrap();
        let paths = SnapshotPaths::from_base(dir.path());
        let host = FakeHost::new(&paths);
        let result =
            SnapshotContext::open(dir.path(), host.collaborators(), Arc::new(ManualLooper::new()));
        assert!(matches!(result, Err(ContextError::Config(ConfigError::Invalid(_)))));
    }
}

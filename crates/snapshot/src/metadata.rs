//! Per-snapshot metadata
//!
//! Each snapshot directory carries a `snapshot.json` record describing the
//! VM configuration it was saved with and its load history. [`Snapshot`]
//! wraps the record and implements pre-flight validation: every check runs
//! before any guest state is touched, and a failed check is persisted so the
//! next attempt sees it without re-running the VM.
//!
//! Writes use write-fsync-rename through a dot-prefixed temp file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use quicksnap_core::{FailureClass, FailureReason, Result, DEFAULT_BOOT_SNAPSHOT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::paths::{SnapshotPaths, METADATA_FILE_NAME, RAM_FILE_NAME};

/// Current metadata format version
pub const METADATA_VERSION: u32 = 1;

/// Errors reading or writing metadata
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("Metadata parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetadataError {
    /// Validation failure corresponding to a read error
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            MetadataError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                FailureReason::NoSnapshotPb
            }
            _ => FailureReason::BadSnapshotPb,
        }
    }
}

/// VM configuration a snapshot is tied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VmConfiguration {
    /// Number of virtual CPUs
    pub cpu_core_count: u32,
    /// Guest RAM size in bytes
    pub ram_size_bytes: u64,
    /// Hypervisor name (e.g. "kvm", "hvf", "tcg")
    pub hypervisor: String,
}

/// Contents of `snapshot.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Format version
    pub version: u32,
    /// Snapshot name
    pub name: String,
    /// When the snapshot was saved
    pub created_at: DateTime<Utc>,
    /// Persisted failure reason code, if the last attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<i32>,
    /// RAM files live outside the snapshot directory
    #[serde(default)]
    pub imported: bool,
    /// Base-relative directory holding the RAM file of an imported snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_ram_dir: Option<String>,
    /// Snapshot this one was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// VM configuration at save time; absent on failure-only records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<VmConfiguration>,
    /// Rendering backend at save time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
    /// Loads that completed successfully
    #[serde(default)]
    pub successful_loads: u32,
    /// Loads that failed after passing validation
    #[serde(default)]
    pub invalid_loads: u32,
}

impl SnapshotMetadata {
    fn failure_only(name: &str) -> Self {
        SnapshotMetadata {
            version: METADATA_VERSION,
            name: name.to_string(),
            created_at: Utc::now(),
            failure_reason: None,
            imported: false,
            imported_ram_dir: None,
            parent: None,
            config: None,
            renderer: None,
            successful_loads: 0,
            invalid_loads: 0,
        }
    }

    /// Read and parse a metadata file
    pub fn read_from(path: &Path) -> std::result::Result<Self, MetadataError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write a metadata file using write-fsync-rename
    pub fn write_to(&self, path: &Path) -> std::result::Result<(), MetadataError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let temp_path = path.with_file_name(format!(".{METADATA_FILE_NAME}.tmp"));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }
}

/// One snapshot on disk
#[derive(Debug, Clone)]
pub struct Snapshot {
    name: String,
    base: PathBuf,
    data_dir: PathBuf,
    metadata: Option<SnapshotMetadata>,
    metadata_read: bool,
    latest_failure: FailureReason,
}

impl Snapshot {
    /// Refer to the snapshot `name` under `paths`
    ///
    /// Fails only for names that cannot be directory names.
    pub fn new(paths: &SnapshotPaths, name: &str) -> Result<Self> {
        Ok(Snapshot {
            name: name.to_string(),
            base: paths.base().to_path_buf(),
            data_dir: paths.snapshot_dir(name)?,
            metadata: None,
            metadata_read: false,
            latest_failure: FailureReason::Empty,
        })
    }

    /// All snapshots whose metadata is readable, current and not failed
    pub fn existing_snapshots(paths: &SnapshotPaths) -> Vec<Snapshot> {
        let names = match paths.list_snapshot_names() {
            Ok(names) => names,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", error = %e, "cannot list snapshots");
                return Vec::new();
            }
        };
        names
            .iter()
            .filter_map(|name| Snapshot::new(paths, name).ok())
            .filter_map(|mut snapshot| snapshot.preload().then_some(snapshot))
            .collect()
    }

    /// Snapshot name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Metadata file path
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE_NAME)
    }

    /// RAM file path, honoring an imported RAM directory
    pub fn ram_file_path(&self) -> PathBuf {
        match self.metadata.as_ref().and_then(|m| m.imported_ram_dir.as_ref()) {
            Some(dir) => self.base.join(dir).join(RAM_FILE_NAME),
            None => self.data_dir.join(RAM_FILE_NAME),
        }
    }

    /// Metadata, if it has been read or written
    pub fn metadata(&self) -> Option<&SnapshotMetadata> {
        self.metadata.as_ref()
    }

    /// Whether the RAM files live outside the snapshot directory
    pub fn is_imported(&self) -> bool {
        self.metadata.as_ref().map_or(false, |m| m.imported)
    }

    /// Parent snapshot name
    pub fn parent(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.parent.as_deref())
    }

    fn read_metadata_once(&mut self) -> std::result::Result<(), FailureReason> {
        if self.metadata_read {
            return match self.metadata {
                Some(_) => Ok(()),
                None => Err(self.latest_failure),
            };
        }
        self.metadata_read = true;
        match SnapshotMetadata::read_from(&self.metadata_path()) {
            Ok(metadata) => {
                self.metadata = Some(metadata);
                Ok(())
            }
            Err(e) => {
                let reason = e.failure_reason();
                debug!(target: "quicksnap::snapshotter", name = %self.name, error = %e,
                    "cannot read snapshot metadata");
                self.save_failure(reason);
                Err(reason)
            }
        }
    }

    /// Read metadata and check it is current and carries no recorded failure
    pub fn preload(&mut self) -> bool {
        if self.read_metadata_once().is_err() {
            return false;
        }
        self.metadata.as_ref().map_or(false, |m| {
            m.version == METADATA_VERSION && self.recorded_failure().is_none()
        })
    }

    fn recorded_failure(&self) -> Option<FailureReason> {
        let code = self.metadata.as_ref()?.failure_reason?;
        match FailureReason::classify_code(code) {
            FailureClass::Validation(r) | FailureClass::Unrecoverable(r) => Some(r),
            FailureClass::Unknown => None,
        }
    }

    /// Run every pre-flight check for loading into a VM with `config`
    ///
    /// A failure is recorded on disk and returned.
    pub fn validate_for_loading(
        &mut self,
        config: &VmConfiguration,
        renderer: &str,
    ) -> std::result::Result<(), FailureReason> {
        self.read_metadata_once()?;
        if let Some(reason) = self.recorded_failure() {
            self.latest_failure = reason;
            return Err(reason);
        }
        let reason = self.check_against(config, renderer);
        if let Some(reason) = reason {
            self.save_failure(reason);
            return Err(reason);
        }
        Ok(())
    }

    fn check_against(&self, config: &VmConfiguration, renderer: &str) -> Option<FailureReason> {
        let metadata = self.metadata.as_ref()?;
        if metadata.version != METADATA_VERSION {
            return Some(FailureReason::IncompatibleVersion);
        }
        if let Some(saved) = &metadata.config {
            if saved.hypervisor != config.hypervisor {
                return Some(FailureReason::ConfigMismatchHostHypervisor);
            }
            if saved.cpu_core_count != config.cpu_core_count
                || saved.ram_size_bytes != config.ram_size_bytes
            {
                return Some(FailureReason::ConfigMismatchAvd);
            }
        }
        if let Some(saved) = &metadata.renderer {
            if saved != renderer {
                return Some(FailureReason::ConfigMismatchRenderer);
            }
        }
        if !self.ram_file_path().exists() {
            return Some(FailureReason::NoRamFile);
        }
        None
    }

    /// Write fresh metadata after a successful save
    ///
    /// Load counters start over since the state is new. The parent is never
    /// recorded for the default boot snapshot, nor pointing at it.
    pub fn save(
        &mut self,
        config: &VmConfiguration,
        renderer: &str,
        parent: Option<&str>,
    ) -> std::result::Result<(), MetadataError> {
        let parent = parent.filter(|p| {
            self.name != DEFAULT_BOOT_SNAPSHOT
                && !p.is_empty()
                && *p != DEFAULT_BOOT_SNAPSHOT
                && *p != self.name
        });
        let metadata = SnapshotMetadata {
            config: Some(config.clone()),
            renderer: Some(renderer.to_string()),
            parent: parent.map(str::to_string),
            ..SnapshotMetadata::failure_only(&self.name)
        };
        metadata.write_to(&self.metadata_path())?;
        self.metadata = Some(metadata);
        self.metadata_read = true;
        self.latest_failure = FailureReason::Empty;
        Ok(())
    }

    /// Record a failure reason
    ///
    /// `Empty` only clears the in-memory reason. Repeating the latest reason
    /// is a no-op. Nothing is written if the snapshot directory is gone.
    pub fn save_failure(&mut self, reason: FailureReason) -> bool {
        if reason == FailureReason::Empty {
            self.latest_failure = reason;
            return true;
        }
        if reason == self.latest_failure {
            return true;
        }
        self.latest_failure = reason;
        let name = self.name.clone();
        let metadata = self
            .metadata
            .get_or_insert_with(|| SnapshotMetadata::failure_only(&name));
        metadata.failure_reason = Some(reason.code());
        self.write_if_present()
    }

    fn write_if_present(&self) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        if !self.data_dir.is_dir() {
            return false;
        }
        match metadata.write_to(&self.metadata_path()) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "quicksnap::snapshotter", name = %self.name, error = %e,
                    "cannot write snapshot metadata");
                false
            }
        }
    }

    /// Count a successful load
    pub fn increment_successful_loads(&mut self) {
        if let Some(m) = self.metadata.as_mut() {
            m.successful_loads += 1;
        }
        self.write_if_present();
    }

    /// Count a load that failed after validation
    pub fn increment_invalid_loads(&mut self) {
        if let Some(m) = self.metadata.as_mut() {
            m.invalid_loads += 1;
        }
        self.write_if_present();
    }

    /// Never loaded successfully, or failed to load more than once
    pub fn should_invalidate(&self) -> bool {
        match &self.metadata {
            Some(m) => m.successful_loads == 0 || m.invalid_loads > 1,
            None => true,
        }
    }

    /// Latest failure: recorded this session, else persisted
    pub fn failure_reason(&self) -> Option<FailureReason> {
        if self.latest_failure.is_failure() {
            return Some(self.latest_failure);
        }
        self.metadata
            .as_ref()
            .and_then(|m| m.failure_reason)
            .and_then(FailureReason::from_code)
    }
}

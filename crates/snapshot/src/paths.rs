//! Snapshot directory structure
//!
//! All snapshot state lives under one base directory:
//!
//! ```text
//! <base>/
//! ├── quickboot-choice.toml     # save-on-exit preference
//! └── snapshots/
//!     └── <name>/               # one directory per snapshot
//!         ├── snapshot.json     # metadata record
//!         ├── ram.bin           # RAM pages + index
//!         └── ...               # device/CPU state owned by the VM
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use quicksnap_core::{is_valid_snapshot_name, Error, Result};

/// Directory holding one subdirectory per snapshot
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Metadata file inside a snapshot directory
pub const METADATA_FILE_NAME: &str = "snapshot.json";

/// RAM file inside a snapshot directory
pub const RAM_FILE_NAME: &str = "ram.bin";

/// Quickboot preference file in the base directory
pub const QUICKBOOT_CHOICE_FILE_NAME: &str = "quickboot-choice.toml";

/// Snapshot directory paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    base: PathBuf,
}

impl SnapshotPaths {
    /// Create paths rooted at `base`
    pub fn from_base(base: impl AsRef<Path>) -> Self {
        SnapshotPaths {
            base: base.as_ref().to_path_buf(),
        }
    }

    /// Base directory; stored block paths are relative to it
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory containing all snapshots
    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join(SNAPSHOTS_DIR)
    }

    /// Data directory of one snapshot
    pub fn snapshot_dir(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_snapshot_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(self.snapshots_dir().join(name))
    }

    /// Metadata file of one snapshot
    pub fn metadata_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.snapshot_dir(name)?.join(METADATA_FILE_NAME))
    }

    /// RAM file of one snapshot
    pub fn ram_file(&self, name: &str) -> Result<PathBuf> {
        Ok(self.snapshot_dir(name)?.join(RAM_FILE_NAME))
    }

    /// Quickboot preference file
    pub fn quickboot_choice_file(&self) -> PathBuf {
        self.base.join(QUICKBOOT_CHOICE_FILE_NAME)
    }

    /// Create the base and snapshots directories
    pub fn create_directories(&self) -> io::Result<()> {
        fs::create_dir_all(self.snapshots_dir())
    }

    /// Names of all snapshot directories, sorted
    ///
    /// A missing snapshots directory yields an empty list.
    pub fn list_snapshot_names(&self) -> io::Result<Vec<String>> {
        let dir = self.snapshots_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_snapshot_name(name) && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

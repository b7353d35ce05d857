//! Persisted quickboot choice
//!
//! A single `save_on_exit` flag in `quickboot-choice.toml`, remembered across
//! sessions so the next start knows the user's last decision. A missing file
//! or key reads as `true`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// The remembered save-on-exit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickbootChoice {
    /// Save state when the VM exits
    pub save_on_exit: bool,
}

impl Default for QuickbootChoice {
    fn default() -> Self {
        QuickbootChoice { save_on_exit: true }
    }
}

impl QuickbootChoice {
    /// Read the choice file; a missing file yields the default
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the choice file (temp file, fsync, rename)
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string(self)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("quickboot-choice.toml");
        let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&temp_path, path).map_err(io_err)?;
        if let Some(parent) = path.parent() {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(io_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_means_save() {
        let dir = TempDir::new().unwrap();
        let choice = QuickbootChoice::load(&dir.path().join("quickboot-choice.toml")).unwrap();
        assert!(choice.save_on_exit);
    }

    #[test]
    fn test_missing_key_means_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quickboot-choice.toml");
        fs::write(&path, "# nothing here\n").unwrap();
        assert!(QuickbootChoice::load(&path).unwrap().save_on_exit);
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quickboot-choice.toml");
        QuickbootChoice { save_on_exit: false }.write(&path).unwrap();
        assert!(!QuickbootChoice::load(&path).unwrap().save_on_exit);
        assert!(!dir.path().join(".quickboot-choice.toml.tmp").exists());

        QuickbootChoice { save_on_exit: true }.write(&path).unwrap();
        assert!(QuickbootChoice::load(&path).unwrap().save_on_exit);
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quickboot-choice.toml");
        fs::write(&path, "save_on_exit = 3\n").unwrap();
        assert!(matches!(
            QuickbootChoice::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}

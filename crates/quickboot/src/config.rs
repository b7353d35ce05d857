//! Quickboot configuration via `quickboot.toml`
//!
//! One flat file in the snapshot base directory. Missing keys take their
//! defaults, so an empty file is a valid configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config file name placed in the snapshot base directory
pub const CONFIG_FILE_NAME: &str = "quickboot.toml";

/// Read-only mode stretches both the poll interval and the boot timeout
const READ_ONLY_SCALE: u32 = 10;

/// Translated guests boot this much slower
const ARM_TRANSLATION_SCALE: u32 = 5;

/// Errors reading or writing quickboot configuration files
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// File is not valid TOML for this type
    #[error("cannot parse '{path}': {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// Value could not be serialized
    #[error("cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Parsed, but the values do not make sense together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Quickboot configuration loaded from `quickboot.toml`
///
/// # Example
///
/// ```toml
/// enabled = true
/// no_snapshot_load = false
/// boot_timeout_ms = 7000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickbootConfig {
    /// Feature flag; when off quickboot never loads or saves
    pub enabled: bool,
    /// Cold boot requested on the command line
    pub no_snapshot_load: bool,
    /// Cold boot requested by the device configuration
    pub force_cold_boot: bool,
    /// Never save, requested on the command line
    pub no_snapshot_save: bool,
    /// User preference to save state on exit
    pub save_on_exit: bool,
    /// Read-only (replay) session
    pub read_only: bool,
    /// Guest instructions are translated rather than run natively
    pub arm_translation: bool,
    /// Skip saving sessions shorter than `min_uptime_ms`
    pub short_run_check: bool,
    /// Delete the quickboot snapshot when saving on exit fails
    pub invalidate_on_failed_save: bool,
    /// Touch a marker file once a loaded guest comes online
    pub write_boot_marker: bool,
    /// Liveness poll interval
    pub liveness_interval_ms: u64,
    /// Time a loaded guest gets to come online
    pub boot_timeout_ms: u64,
    /// Minimum session length worth saving
    pub min_uptime_ms: u64,
    /// Guest bridge reconnects before giving up on a loaded snapshot
    pub max_adb_retries: u32,
}

impl Default for QuickbootConfig {
    fn default() -> Self {
        QuickbootConfig {
            enabled: true,
            no_snapshot_load: false,
            force_cold_boot: false,
            no_snapshot_save: false,
            save_on_exit: true,
            read_only: false,
            arm_translation: false,
            short_run_check: true,
            invalidate_on_failed_save: false,
            write_boot_marker: false,
            liveness_interval_ms: 100,
            boot_timeout_ms: 7_000,
            min_uptime_ms: 1_500,
            max_adb_retries: 3,
        }
    }
}

impl QuickbootConfig {
    /// Returns the default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# Quickboot configuration
#
# Feature flag: when false the VM always cold boots and never saves.
enabled = true

# Cold boot requests. The first comes from the command line, the second
# from the device configuration; both skip loading the quickboot snapshot.
no_snapshot_load = false
force_cold_boot = false

# Never save state on exit (command line).
no_snapshot_save = false

# User preference: save state on exit.
save_on_exit = true

# Read-only (replay) session: liveness polling and boot timeout are 10x longer.
read_only = false

# Guest runs under instruction translation: boot timeout is 5x longer.
arm_translation = false

# Skip saving sessions shorter than min_uptime_ms.
short_run_check = true

# Delete the quickboot snapshot when saving on exit fails.
invalidate_on_failed_save = false

# Touch <base>/boot-completed once a loaded guest comes online.
write_boot_marker = false

# Timing (milliseconds)
liveness_interval_ms = 100
boot_timeout_ms = 7000
min_uptime_ms = 1500

# Guest bridge reconnect attempts before the snapshot is deleted.
max_adb_retries = 3
"#
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: QuickbootConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to `path`
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the timing values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness_interval_ms must be positive".to_string(),
            ));
        }
        if self.boot_timeout_ms < self.liveness_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "boot_timeout_ms ({}) is shorter than liveness_interval_ms ({})",
                self.boot_timeout_ms, self.liveness_interval_ms
            )));
        }
        Ok(())
    }

    /// Whether loading was turned off by the command line or device config
    pub fn cold_boot_requested(&self) -> bool {
        self.no_snapshot_load || self.force_cold_boot
    }

    /// Poll interval after read-only scaling
    pub fn liveness_interval(&self) -> Duration {
        let base = Duration::from_millis(self.liveness_interval_ms);
        if self.read_only {
            base * READ_ONLY_SCALE
        } else {
            base
        }
    }

    /// Boot timeout after read-only or translation scaling
    pub fn boot_timeout(&self) -> Duration {
        let base = Duration::from_millis(self.boot_timeout_ms);
        if self.read_only {
            base * READ_ONLY_SCALE
        } else if self.arm_translation {
            base * ARM_TRANSLATION_SCALE
        } else {
            base
        }
    }

    /// Minimum session length worth saving
    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_matches_default() {
        let parsed: QuickbootConfig = toml::from_str(QuickbootConfig::default_toml()).unwrap();
        assert_eq!(parsed, QuickbootConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        let parsed: QuickbootConfig = toml::from_str("").unwrap();
        assert_eq!(parsed, QuickbootConfig::default());
    }

    #[test]
    fn test_scaled_timings() {
        let mut config = QuickbootConfig::default();
        assert_eq!(config.liveness_interval(), Duration::from_millis(100));
        assert_eq!(config.boot_timeout(), Duration::from_secs(7));

        config.arm_translation = true;
        assert_eq!(config.boot_timeout(), Duration::from_secs(35));

        config.read_only = true;
        assert_eq!(config.liveness_interval(), Duration::from_secs(1));
        assert_eq!(config.boot_timeout(), Duration::from_secs(70));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = QuickbootConfig {
            liveness_interval_ms: 0,
            ..QuickbootConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_timeout_below_interval() {
        let config = QuickbootConfig {
            liveness_interval_ms: 500,
            boot_timeout_ms: 100,
            ..QuickbootConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cold_boot_requested() {
        let mut config = QuickbootConfig::default();
        assert!(!config.cold_boot_requested());
        config.force_cold_boot = true;
        assert!(config.cold_boot_requested());
    }

    #[test]
    fn test_write_default_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        QuickbootConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(QuickbootConfig::from_file(&path).unwrap(), QuickbootConfig::default());
    }

    #[test]
    fn test_write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "enabled = false\n").unwrap();
        QuickbootConfig::write_default_if_missing(&path).unwrap();
        assert!(!QuickbootConfig::from_file(&path).unwrap().enabled);
    }

    #[test]
    fn test_write_to_file_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = QuickbootConfig {
            read_only: true,
            max_adb_retries: 5,
            ..QuickbootConfig::default()
        };
        config.write_to_file(&path).unwrap();
        assert_eq!(QuickbootConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "enabled = \"maybe\"\n").unwrap();
        let err = QuickbootConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = QuickbootConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

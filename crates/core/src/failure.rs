//! Failure taxonomy for snapshot operations
//!
//! Every failed save or load records a [`FailureReason`]. Reasons are grouped
//! into two bands:
//!
//! - **Validation** (`1..VALIDATION_ERROR_LIMIT`): a pre-flight check failed
//!   before any guest state was touched. The VM can cold-boot and carry on.
//! - **Unrecoverable** (`VALIDATION_ERROR_LIMIT+1..UNRECOVERABLE_ERROR_LIMIT`):
//!   the failure happened after guest state was partially overwritten. The VM
//!   must be reset.
//!
//! Anything else (`Empty`, or a persisted code beyond both bands) is
//! [`FailureClass::Unknown`] and handled conservatively.
//!
//! Downstream code matches on [`FailureClass`] instead of comparing integer
//! codes against the limits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

/// Upper bound (exclusive) of the validation band
pub const VALIDATION_ERROR_LIMIT: i32 = 10_000;

/// Upper bound (exclusive) of the unrecoverable band
pub const UNRECOVERABLE_ERROR_LIMIT: i32 = 20_000;

/// errno: snapshot not found in the image
pub const ENOENT: i32 = 2;
/// errno: snapshot state rejected as invalid
pub const EINVAL: i32 = 22;
/// errno: out of disk space
pub const ENOSPC: i32 = 28;

/// Why a snapshot operation failed
///
/// The integer codes are persisted in snapshot metadata, so existing values
/// must never be renumbered. New variants go at the end of their band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum FailureReason {
    /// No failure recorded
    Empty = 0,

    // Validation band
    /// Snapshot metadata file is missing
    NoSnapshotPb = 1,
    /// Snapshot metadata file exists but could not be parsed
    BadSnapshotPb = 2,
    /// Snapshot was written by an incompatible format version
    IncompatibleVersion = 3,
    /// RAM file is missing
    NoRamFile = 4,
    /// Snapshots are not supported in the current configuration
    SnapshotsNotSupported = 5,
    /// Operation was canceled by the user
    Canceled = 6,
    /// Snapshot was invalidated and only a tombstone remains
    Tombstone = 7,
    /// The requested snapshot does not exist in the image
    NoSnapshotInImage = 8,
    /// Saved with a different hypervisor
    ConfigMismatchHostHypervisor = 9,
    /// Saved with a different host GPU
    ConfigMismatchHostGpu = 10,
    /// Saved with a different rendering backend
    ConfigMismatchRenderer = 11,
    /// Saved with a different set of enabled features
    ConfigMismatchFeatures = 12,
    /// Saved with a different virtual device configuration
    ConfigMismatchAvd = 13,
    /// System image changed since the snapshot was saved
    SystemImageChanged = 14,
    /// Not enough free disk space
    OutOfDiskSpace = 15,

    // Unrecoverable band
    /// Snapshot data is corrupted
    CorruptedData = 10_001,
    /// Internal error in the snapshot subsystem
    InternalError = 10_002,
    /// The emulation engine failed to restore device state
    EmulationEngineFailed = 10_003,
    /// RAM could not be restored
    RamFailed = 10_004,
    /// The guest bridge never came back online after loading
    AdbOffline = 10_005,
}

/// Three-way classification of a failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Pre-flight failure: no guest state was mutated
    Validation(FailureReason),
    /// Failure after partial mutation: the VM must be reset
    Unrecoverable(FailureReason),
    /// No reason, or a code outside both bands
    Unknown,
}

impl FailureReason {
    /// Every defined reason, in code order
    pub const ALL: [FailureReason; 21] = [
        FailureReason::Empty,
        FailureReason::NoSnapshotPb,
        FailureReason::BadSnapshotPb,
        FailureReason::IncompatibleVersion,
        FailureReason::NoRamFile,
        FailureReason::SnapshotsNotSupported,
        FailureReason::Canceled,
        FailureReason::Tombstone,
        FailureReason::NoSnapshotInImage,
        FailureReason::ConfigMismatchHostHypervisor,
        FailureReason::ConfigMismatchHostGpu,
        FailureReason::ConfigMismatchRenderer,
        FailureReason::ConfigMismatchFeatures,
        FailureReason::ConfigMismatchAvd,
        FailureReason::SystemImageChanged,
        FailureReason::OutOfDiskSpace,
        FailureReason::CorruptedData,
        FailureReason::InternalError,
        FailureReason::EmulationEngineFailed,
        FailureReason::RamFailed,
        FailureReason::AdbOffline,
    ];

    /// Persisted integer code
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a reason by its persisted code
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.code() == code)
    }

    /// Classify this reason into its band
    ///
    /// Exhaustive on purpose: a new variant does not compile until it is
    /// assigned a band.
    pub fn class(self) -> FailureClass {
        use FailureReason::*;
        match self {
            Empty => FailureClass::Unknown,
            NoSnapshotPb
            | BadSnapshotPb
            | IncompatibleVersion
            | NoRamFile
            | SnapshotsNotSupported
            | Canceled
            | Tombstone
            | NoSnapshotInImage
            | ConfigMismatchHostHypervisor
            | ConfigMismatchHostGpu
            | ConfigMismatchRenderer
            | ConfigMismatchFeatures
            | ConfigMismatchAvd
            | SystemImageChanged
            | OutOfDiskSpace => FailureClass::Validation(self),
            CorruptedData | InternalError | EmulationEngineFailed | RamFailed | AdbOffline => {
                FailureClass::Unrecoverable(self)
            }
        }
    }

    /// Classify a raw persisted code; unknown codes are `Unknown`
    pub fn classify_code(code: i32) -> FailureClass {
        Self::from_code(code)
            .map(Self::class)
            .unwrap_or(FailureClass::Unknown)
    }

    /// True for reasons in the validation band
    pub fn is_validation(self) -> bool {
        matches!(self.class(), FailureClass::Validation(_))
    }

    /// True for reasons in the unrecoverable band
    pub fn is_unrecoverable(self) -> bool {
        matches!(self.class(), FailureClass::Unrecoverable(_))
    }

    /// True if this is an actual failure (anything but `Empty`)
    pub fn is_failure(self) -> bool {
        self != FailureReason::Empty
    }

    /// Map a positive errno reported by the VM collaborator
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            ENOENT => FailureReason::NoSnapshotInImage,
            EINVAL => FailureReason::CorruptedData,
            ENOSPC => FailureReason::OutOfDiskSpace,
            _ => FailureReason::EmulationEngineFailed,
        }
    }

    /// Map an I/O error hit while reading or writing snapshot files
    pub fn from_io_error(err: &io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return match errno {
                ENOSPC => FailureReason::OutOfDiskSpace,
                ENOENT => FailureReason::NoRamFile,
                _ => FailureReason::InternalError,
            };
        }
        match err.kind() {
            io::ErrorKind::NotFound => FailureReason::NoRamFile,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                FailureReason::CorruptedData
            }
            _ => FailureReason::InternalError,
        }
    }

    /// Short human-readable description
    pub fn message(self) -> &'static str {
        use FailureReason::*;
        match self {
            Empty => "no failure",
            NoSnapshotPb => "snapshot metadata missing",
            BadSnapshotPb => "snapshot metadata unreadable",
            IncompatibleVersion => "incompatible snapshot version",
            NoRamFile => "RAM file missing",
            SnapshotsNotSupported => "snapshots not supported",
            Canceled => "canceled by the user",
            Tombstone => "snapshot was invalidated",
            NoSnapshotInImage => "snapshot doesn't exist",
            ConfigMismatchHostHypervisor => "host hypervisor changed",
            ConfigMismatchHostGpu => "host GPU changed",
            ConfigMismatchRenderer => "renderer changed",
            ConfigMismatchFeatures => "enabled features changed",
            ConfigMismatchAvd => "device configuration changed",
            SystemImageChanged => "system image changed",
            OutOfDiskSpace => "not enough disk space",
            CorruptedData => "snapshot data corrupted",
            InternalError => "internal error",
            EmulationEngineFailed => "emulation engine failed",
            RamFailed => "RAM restore failed",
            AdbOffline => "guest bridge offline",
        }
    }
}

impl Default for FailureReason {
    fn default() -> Self {
        FailureReason::Empty
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<FailureReason> for i32 {
    fn from(r: FailureReason) -> i32 {
        r.code()
    }
}

impl TryFrom<i32> for FailureReason {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        FailureReason::from_code(code).ok_or_else(|| format!("unknown failure reason code {code}"))
    }
}

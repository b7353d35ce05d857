//! Fixed constants
//!
//! Values baked into the on-disk layout or shared between layers.

/// Smallest page size the RAM protocol accepts, and the usual one
pub const PAGE_SIZE: usize = 4096;

/// Name of the snapshot quickboot saves on exit and loads on start
pub const DEFAULT_BOOT_SNAPSHOT: &str = "default_boot";

/// Free disk space below which a generic save is refused (2 GiB)
pub const MIN_FREE_DISK_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Window after a load in which a crash is blamed on the snapshot (ms)
pub const SNAPSHOT_CRASH_THRESHOLD_MS: u64 = 2 * 60 * 1000;

/// Validate a snapshot name for use as a directory component
///
/// Names must be non-empty, must not be `.` or `..`, and must not contain
/// path separators or NUL.
pub fn is_valid_snapshot_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_snapshot_name(DEFAULT_BOOT_SNAPSHOT));
        assert!(is_valid_snapshot_name("snap-1.2"));
        assert!(is_valid_snapshot_name("..hidden"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_snapshot_name(""));
        assert!(!is_valid_snapshot_name("."));
        assert!(!is_valid_snapshot_name(".."));
        assert!(!is_valid_snapshot_name("a/b"));
        assert!(!is_valid_snapshot_name("a\\b"));
        assert!(!is_valid_snapshot_name("a\0b"));
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
    }
}

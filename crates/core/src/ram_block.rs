//! RAM block descriptors
//!
//! A [`RamBlock`] describes one contiguous region of guest RAM as reported by
//! the memory subsystem when a save or load starts. Blocks are registered
//! once per operation and not mutated afterwards except by that operation.

use bitflags::bitflags;
use std::path::{Path, PathBuf};

use crate::memory::HostRegion;

bitflags! {
    /// Backing-store flags of a RAM block
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RamBlockFlags: u32 {
        /// Block is mapped from a file
        const MAPPED = 1 << 0;
        /// Block is mapped shared, so the file itself holds the contents
        const MAPPED_SHARED = 1 << 1;
        /// Block memory is supplied by the user and is never saved
        const USER_BACKED = 1 << 2;
    }
}

/// One registered region of guest RAM
#[derive(Debug, Clone)]
pub struct RamBlock {
    /// Block name, used to match blocks between save and load
    pub id: String,
    /// Offset of the block in the guest RAM address space
    pub start_offset: u64,
    /// Host memory backing the block (not owned)
    pub host: HostRegion,
    /// Size in bytes
    pub total_size: u64,
    /// Page size in bytes
    pub page_size: u32,
    /// Backing-store flags
    pub flags: RamBlockFlags,
    /// Backing-file path, relative to the snapshot base directory when possible
    pub path: String,
    /// Read-only blocks are skipped by both save and load
    pub readonly: bool,
    /// Set on load when the block must be refilled from the RAM file
    pub need_restore_from_ram_file: bool,
}

impl RamBlock {
    /// Build a block covering all of `host`
    pub fn new(id: impl Into<String>, start_offset: u64, host: HostRegion, page_size: u32) -> Self {
        RamBlock {
            id: id.into(),
            start_offset,
            host,
            total_size: host.len() as u64,
            page_size,
            flags: RamBlockFlags::empty(),
            path: String::new(),
            readonly: false,
            need_restore_from_ram_file: false,
        }
    }

    /// Set flags (builder style)
    pub fn with_flags(mut self, flags: RamBlockFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set backing path (builder style)
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Mark read-only (builder style)
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Number of pages in the block
    pub fn page_count(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total_size / u64::from(self.page_size)
    }

    /// Whether the save path persists this block's pages at all
    ///
    /// Read-only and user-backed blocks are never saved.
    pub fn is_saveable(&self) -> bool {
        !self.readonly && !self.flags.contains(RamBlockFlags::USER_BACKED)
    }

    /// Whether the block is mapped shared from a backing file
    pub fn is_mapped_shared(&self) -> bool {
        self.flags.contains(RamBlockFlags::MAPPED_SHARED)
    }

    /// Resolve the stored path against `base`
    pub fn resolve_path(&self, base: &Path) -> PathBuf {
        let p = Path::new(&self.path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base.join(p)
        }
    }
}

/// Compute the host-portable form of a backing-file path
///
/// Paths under `base` lose the `base` prefix; anything else is kept verbatim.
pub fn portable_path(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AlignedMemory;
    use crate::PAGE_SIZE;

    #[test]
    fn test_page_count() {
        let mem = AlignedMemory::new(4 * PAGE_SIZE);
        let block = RamBlock::new("ram", 0, unsafe { mem.region() }, PAGE_SIZE as u32);
        assert_eq!(block.page_count(), 4);
        assert_eq!(block.total_size, 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_saveable() {
        let mem = AlignedMemory::new(PAGE_SIZE);
        let block = RamBlock::new("ram", 0, unsafe { mem.region() }, PAGE_SIZE as u32);
        assert!(block.is_saveable());
        assert!(!block.clone().read_only().is_saveable());
        assert!(!block
            .with_flags(RamBlockFlags::USER_BACKED)
            .is_saveable());
    }

    #[test]
    fn test_portable_path_strips_base() {
        let base = Path::new("/data/avd");
        assert_eq!(
            portable_path(base, Path::new("/data/avd/snapshots/x/ram.img")),
            "snapshots/x/ram.img"
        );
        assert_eq!(portable_path(base, Path::new("/tmp/ram.img")), "/tmp/ram.img");
    }

    #[test]
    fn test_resolve_path() {
        let mem = AlignedMemory::new(PAGE_SIZE);
        let base = Path::new("/data/avd");
        let rel = RamBlock::new("a", 0, unsafe { mem.region() }, 4096).with_path("ram.img");
        assert_eq!(rel.resolve_path(base), PathBuf::from("/data/avd/ram.img"));
        let abs = RamBlock::new("b", 0, unsafe { mem.region() }, 4096).with_path("/tmp/r.img");
        assert_eq!(abs.resolve_path(base), PathBuf::from("/tmp/r.img"));
    }
}

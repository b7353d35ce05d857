//! RAM loader
//!
//! The VM thread registers every RAM block, then [`RamLoader::start`] reads
//! the index, matches saved blocks to registered ones by name and spawns the
//! `quicksnap-ram-reader` thread, which streams every stored page into host
//! memory. The VM thread may ask for specific pages earlier through
//! [`RamLoader::load_ram`]; each page carries an atomic state so exactly one
//! thread fills it.
//!
//! Blocks that were mapped shared at save time are not stored in the file.
//! If the same file is mapped again they are left alone; otherwise their
//! contents are bulk-read from the referenced file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quicksnap_core::{FailureReason, HostRegion, RamBlock, RamBlockFlags};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::{get_codec, PageCodec};
use crate::format::{FileIndex, PageEntry, RamFileHeader, RamFormatError, RAM_FILE_HEADER_SIZE};
use crate::zero_page::is_buffer_zeroed;

/// Chunk size for bulk restores from a block's backing file
const RESTORE_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const PAGE_EMPTY: u8 = 0;
const PAGE_READING: u8 = 1;
const PAGE_FILLED: u8 = 2;
const PAGE_ERROR: u8 = 3;

/// Counters for one load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RamLoadStats {
    /// Stored pages covered by the index
    pub total_pages: u64,
    /// Pages restored as zero
    pub zero_pages: u64,
    /// Pages read from the file
    pub read_pages: u64,
    /// Pages filled through `load_ram` before the reader got to them
    pub on_demand_pages: u64,
    /// Bytes read from the file (pages and bulk restores)
    pub bytes_read: u64,
    /// Time from `start` to `join`
    pub duration: Duration,
}

struct LoadBlock {
    id: String,
    host: HostRegion,
    page_size: usize,
    first_page: usize,
    page_count: usize,
}

struct LoaderShared {
    file: Mutex<File>,
    codec: Box<dyn PageCodec>,
    blocks: Vec<LoadBlock>,
    pages: Vec<PageEntry>,
    states: Vec<AtomicU8>,
    has_error: Arc<AtomicBool>,
    interrupted: AtomicBool,
    zero_pages: AtomicU64,
    read_pages: AtomicU64,
    on_demand_pages: AtomicU64,
    bytes_read: AtomicU64,
}

impl LoaderShared {
    /// Fill one page unless another thread already did
    fn fill_page(&self, block_idx: usize, page: usize, on_demand: bool) -> bool {
        let block = &self.blocks[block_idx];
        let global = block.first_page + page;
        let state = &self.states[global];
        if state
            .compare_exchange(PAGE_EMPTY, PAGE_READING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            loop {
                match state.load(Ordering::Acquire) {
                    PAGE_FILLED => return true,
                    PAGE_ERROR => return false,
                    _ => thread::yield_now(),
                }
            }
        }
        match self.read_page(block, page, &self.pages[global]) {
            Ok(()) => {
                if on_demand {
                    self.on_demand_pages.fetch_add(1, Ordering::Relaxed);
                }
                state.store(PAGE_FILLED, Ordering::Release);
                true
            }
            Err(e) => {
                warn!(target: "quicksnap::ram", block = %block.id, page, error = %e,
                    "failed to load RAM page");
                self.has_error.store(true, Ordering::Release);
                state.store(PAGE_ERROR, Ordering::Release);
                false
            }
        }
    }

    fn read_page(&self, block: &LoadBlock, page: usize, entry: &PageEntry) -> Result<(), RamFormatError> {
        let offset = page * block.page_size;
        if entry.is_zero() {
            if !is_buffer_zeroed(block.host.slice(offset, block.page_size)) {
                block.host.zero(offset, block.page_size);
            }
            self.zero_pages.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut stored = vec![0u8; entry.size_on_disk as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.file_pos))?;
            file.read_exact(&mut stored)?;
        }
        self.bytes_read.fetch_add(stored.len() as u64, Ordering::Relaxed);

        let data = if stored.len() < block.page_size {
            self.codec.decode(&stored, block.page_size)?
        } else {
            stored
        };
        if data.len() != block.page_size || xxh3_64(&data) != entry.hash {
            return Err(RamFormatError::HashMismatch {
                block: block.id.clone(),
                page: page as u64,
            });
        }
        block.host.write(offset, &data);
        self.read_pages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reader_loop(&self) {
        for (block_idx, block) in self.blocks.iter().enumerate() {
            for page in 0..block.page_count {
                if self.interrupted.load(Ordering::Acquire) {
                    debug!(target: "quicksnap::ram", "RAM reader interrupted");
                    return;
                }
                if !self.fill_page(block_idx, page, false) {
                    return;
                }
            }
        }
    }
}

/// Reads guest RAM back from a RAM file
pub struct RamLoader {
    path: PathBuf,
    base_dir: PathBuf,
    registered: Vec<RamBlock>,
    shared: Option<Arc<LoaderShared>>,
    reader: Option<JoinHandle<()>>,
    has_error: Arc<AtomicBool>,
    failure: Option<FailureReason>,
    started: bool,
    joined: bool,
    is_quickboot: bool,
    lazy_from_file_backing: bool,
    restored_bytes: u64,
    started_at: Option<Instant>,
    stats: RamLoadStats,
}

impl RamLoader {
    /// Create a loader for the RAM file at `path`
    ///
    /// Backing-file paths stored in the index are resolved against `base_dir`.
    pub fn new(path: &Path, base_dir: &Path) -> Self {
        RamLoader {
            path: path.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            registered: Vec::new(),
            shared: None,
            reader: None,
            has_error: Arc::new(AtomicBool::new(false)),
            failure: None,
            started: false,
            joined: false,
            is_quickboot: false,
            lazy_from_file_backing: false,
            restored_bytes: 0,
            started_at: None,
            stats: RamLoadStats::default(),
        }
    }

    /// Path of the RAM file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a block before `start`
    pub fn register_block(&mut self, block: RamBlock) {
        if self.started {
            warn!(target: "quicksnap::ram", block = %block.id, "RAM block registered after start");
            return;
        }
        self.registered.push(block);
    }

    /// Registered blocks, with `need_restore_from_ram_file` as decided by `start`
    pub fn blocks(&self) -> &[RamBlock] {
        &self.registered
    }

    /// Read the index and begin streaming pages
    ///
    /// Calling it again returns the outcome of the first call.
    pub fn start(&mut self, is_quickboot: bool) -> bool {
        if self.started {
            return !self.has_error();
        }
        self.started = true;
        self.is_quickboot = is_quickboot;
        self.started_at = Some(Instant::now());

        let shared = match self.prepare() {
            Ok(shared) => Arc::new(shared),
            Err(e) => {
                warn!(target: "quicksnap::ram", path = %self.path.display(), error = %e,
                    "cannot start RAM load");
                self.failure = Some(e.failure_reason());
                self.has_error.store(true, Ordering::Release);
                return false;
            }
        };
        self.stats.total_pages = shared.pages.len() as u64;

        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("quicksnap-ram-reader".to_string())
            .spawn(move || worker.reader_loop());
        self.shared = Some(shared);
        match spawned {
            Ok(handle) => {
                self.reader = Some(handle);
                true
            }
            Err(e) => {
                warn!(target: "quicksnap::ram", error = %e, "cannot spawn RAM reader");
                self.failure = Some(FailureReason::InternalError);
                self.has_error.store(true, Ordering::Release);
                false
            }
        }
    }

    fn prepare(&mut self) -> Result<LoaderShared, RamFormatError> {
        let mut file = File::open(&self.path)?;
        let mut header_bytes = [0u8; RAM_FILE_HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => RamFormatError::Truncated("header".to_string()),
            _ => RamFormatError::Io(e),
        })?;
        let header = RamFileHeader::from_bytes(&header_bytes)?;

        let file_len = file.metadata()?.len();
        if header.index_offset.saturating_add(header.index_len) > file_len {
            return Err(RamFormatError::Truncated(format!(
                "index {}+{} past end of file ({file_len})",
                header.index_offset, header.index_len
            )));
        }
        let mut index_bytes = vec![0u8; header.index_len as usize];
        file.seek(SeekFrom::Start(header.index_offset))?;
        file.read_exact(&mut index_bytes)?;
        let index = FileIndex::decode(&index_bytes, header.index_crc32)?;
        let codec = get_codec(&index.codec_id)?;

        let mut blocks = Vec::new();
        let mut pages = Vec::new();
        for saved in index.blocks {
            let Some(reg) = self.registered.iter_mut().find(|b| b.id == saved.id) else {
                return Err(RamFormatError::UnknownBlock(saved.id));
            };
            if reg.readonly || saved.flags.contains(RamBlockFlags::USER_BACKED) {
                continue;
            }
            if !saved.pages_stored {
                if !saved.flags.contains(RamBlockFlags::MAPPED_SHARED) {
                    continue;
                }
                if reg.flags.contains(RamBlockFlags::MAPPED) && reg.path == saved.path {
                    self.lazy_from_file_backing = true;
                    continue;
                }
                reg.need_restore_from_ram_file = true;
                let source = base_relative(&self.base_dir, &saved.path);
                self.restored_bytes += restore_from_file(&source, reg.host)?;
                debug!(target: "quicksnap::ram", block = %reg.id, source = %source.display(),
                    "restored RAM block from backing file");
                continue;
            }
            let geometry_ok = saved.page_size == reg.page_size
                && saved.page_count.checked_mul(u64::from(saved.page_size)) == Some(reg.total_size)
                && saved.pages.len() as u64 == saved.page_count;
            if !geometry_ok {
                return Err(RamFormatError::GeometryMismatch {
                    id: saved.id,
                    saved_pages: saved.page_count,
                    saved_page_size: saved.page_size,
                    registered_size: reg.total_size,
                    registered_page_size: reg.page_size,
                });
            }
            if reg.flags.contains(RamBlockFlags::MAPPED)
                && !saved.flags.contains(RamBlockFlags::MAPPED_SHARED)
            {
                // A mapped file may hold stale data where the saved page was zero.
                reg.host.zero(0, reg.host.len());
            }
            blocks.push(LoadBlock {
                id: reg.id.clone(),
                host: reg.host,
                page_size: reg.page_size as usize,
                first_page: pages.len(),
                page_count: saved.pages.len(),
            });
            pages.extend(saved.pages);
        }

        let states = (0..pages.len()).map(|_| AtomicU8::new(PAGE_EMPTY)).collect();
        Ok(LoaderShared {
            file: Mutex::new(file),
            codec,
            blocks,
            pages,
            states,
            has_error: Arc::clone(&self.has_error),
            interrupted: AtomicBool::new(false),
            zero_pages: AtomicU64::new(0),
            read_pages: AtomicU64::new(0),
            on_demand_pages: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        })
    }

    /// Make sure the pages covering `ptr..ptr+size` are resident
    ///
    /// Returns false if any of them failed to load. Addresses outside the
    /// loaded blocks are ignored.
    pub fn load_ram(&self, ptr: *const u8, size: usize) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };
        for (block_idx, block) in shared.blocks.iter().enumerate() {
            let Some(offset) = block.host.offset_of(ptr) else {
                continue;
            };
            let first = offset / block.page_size;
            let last = (offset + size.max(1) - 1).min(block.host.len() - 1) / block.page_size;
            for page in first..=last.min(block.page_count.saturating_sub(1)) {
                if !shared.fill_page(block_idx, page, true) {
                    return false;
                }
            }
            return true;
        }
        true
    }

    /// Wait for the reader thread to finish
    ///
    /// Returns true if every page loaded.
    pub fn join(&mut self) -> bool {
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                self.has_error.store(true, Ordering::Release);
            }
        }
        if !self.joined {
            self.joined = true;
            self.collect_stats();
            if self.started && !self.has_error() {
                info!(target: "quicksnap::ram", path = %self.path.display(),
                    quickboot = self.is_quickboot, pages = self.stats.total_pages,
                    zero_pages = self.stats.zero_pages, read_pages = self.stats.read_pages,
                    on_demand_pages = self.stats.on_demand_pages, bytes = self.stats.bytes_read,
                    duration_ms = self.stats.duration.as_millis() as u64, "RAM loaded");
            }
        }
        if self.has_error() && self.failure.is_none() {
            self.failure = Some(FailureReason::RamFailed);
        }
        !self.has_error()
    }

    /// Stop streaming and wait for the reader to exit
    pub fn interrupt(&mut self) {
        if let Some(shared) = &self.shared {
            shared.interrupted.store(true, Ordering::Release);
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.joined = true;
        self.collect_stats();
    }

    fn collect_stats(&mut self) {
        if let Some(shared) = &self.shared {
            self.stats.zero_pages = shared.zero_pages.load(Ordering::Relaxed);
            self.stats.read_pages = shared.read_pages.load(Ordering::Relaxed);
            self.stats.on_demand_pages = shared.on_demand_pages.load(Ordering::Relaxed);
            self.stats.bytes_read = shared.bytes_read.load(Ordering::Relaxed) + self.restored_bytes;
        }
        if let Some(started) = self.started_at {
            self.stats.duration = started.elapsed();
        }
    }

    /// Mark the load as failed from outside (e.g. the VM rejected the state)
    pub fn invalidate(&mut self) {
        self.has_error.store(true, Ordering::Release);
        self.failure.get_or_insert(FailureReason::CorruptedData);
        self.interrupt();
    }

    /// True once `start` ran
    pub fn was_started(&self) -> bool {
        self.started
    }

    /// True once the reader finished or was interrupted
    pub fn is_completed(&self) -> bool {
        self.joined
    }

    /// True if anything went wrong
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// Reason to record for a failed load
    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure
    }

    /// True if some block is served lazily by its still-mapped backing file
    pub fn is_lazy_from_file_backing(&self) -> bool {
        self.lazy_from_file_backing
    }

    /// Counters; final after `join`
    pub fn stats(&self) -> RamLoadStats {
        self.stats
    }
}

impl Drop for RamLoader {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.interrupt();
        }
    }
}

fn base_relative(base: &Path, stored: &str) -> PathBuf {
    let p = Path::new(stored);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn restore_from_file(source: &Path, host: HostRegion) -> Result<u64, RamFormatError> {
    let mut file = File::open(source)?;
    let mut chunk = vec![0u8; RESTORE_CHUNK_SIZE.min(host.len().max(1))];
    let mut offset = 0;
    while offset < host.len() {
        let len = chunk.len().min(host.len() - offset);
        file.read_exact(&mut chunk[..len])?;
        host.write(offset, &chunk[..len]);
        offset += len;
    }
    Ok(offset as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::IndexFlags;
    use crate::saver::RamSaver;
    use quicksnap_core::{AlignedMemory, PAGE_SIZE};
    use tempfile::TempDir;

    fn fill_pattern(mem: &mut AlignedMemory, pages: &[usize]) {
        for &p in pages {
            for (i, b) in mem.as_mut_slice()[p * PAGE_SIZE..(p + 1) * PAGE_SIZE]
                .iter_mut()
                .enumerate()
            {
                *b = (i as u8).wrapping_mul(31).wrapping_add(p as u8 + 1);
            }
        }
    }

    fn save(dir: &Path, mem: &AlignedMemory) -> PathBuf {
        let path = dir.join("ram.bin");
        let mut saver = RamSaver::new(&path, IndexFlags::empty()).unwrap();
        saver.register_block(RamBlock::new("pc.ram", 0, unsafe { mem.region() }, PAGE_SIZE as u32));
        saver.save_page(0, 0, PAGE_SIZE);
        saver.join().unwrap();
        path
    }

    #[test]
    fn test_roundtrip_restores_content_and_zeroes() {
        let dir = TempDir::new().unwrap();
        let mut src = AlignedMemory::new(8 * PAGE_SIZE);
        fill_pattern(&mut src, &[1, 2, 6]);
        let path = save(dir.path(), &src);

        let mut dst = AlignedMemory::new(8 * PAGE_SIZE);
        dst.as_mut_slice().fill(0xEE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(loader.start(true));
        assert!(loader.join());
        assert_eq!(dst.as_slice(), src.as_slice());

        let stats = loader.stats();
        assert_eq!(stats.total_pages, 8);
        assert_eq!(stats.read_pages, 3);
        assert_eq!(stats.zero_pages, 5);
    }

    #[test]
    fn test_load_ram_before_join() {
        let dir = TempDir::new().unwrap();
        let mut src = AlignedMemory::new(4 * PAGE_SIZE);
        fill_pattern(&mut src, &[3]);
        let path = save(dir.path(), &src);

        let dst = AlignedMemory::new(4 * PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(loader.start(false));
        let ptr = unsafe { dst.region().as_ptr().add(3 * PAGE_SIZE + 100) };
        assert!(loader.load_ram(ptr, 16));
        assert_eq!(
            &dst.as_slice()[3 * PAGE_SIZE..],
            &src.as_slice()[3 * PAGE_SIZE..]
        );
        assert!(loader.join());
    }

    #[test]
    fn test_unknown_block_fails_start() {
        let dir = TempDir::new().unwrap();
        let src = AlignedMemory::new(PAGE_SIZE);
        let path = save(dir.path(), &src);

        let dst = AlignedMemory::new(PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("other", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(!loader.start(true));
        assert!(loader.has_error());
        assert_eq!(loader.failure_reason(), Some(FailureReason::ConfigMismatchAvd));
        assert!(!loader.start(true));
    }

    #[test]
    fn test_geometry_mismatch() {
        let dir = TempDir::new().unwrap();
        let src = AlignedMemory::new(2 * PAGE_SIZE);
        let path = save(dir.path(), &src);

        let dst = AlignedMemory::new(4 * PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(!loader.start(true));
        assert_eq!(loader.failure_reason(), Some(FailureReason::ConfigMismatchAvd));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut loader = RamLoader::new(&dir.path().join("ram.bin"), dir.path());
        assert!(!loader.start(true));
        assert_eq!(loader.failure_reason(), Some(FailureReason::NoRamFile));
    }

    #[test]
    fn test_corrupted_page_is_detected() {
        let dir = TempDir::new().unwrap();
        let mut src = AlignedMemory::new(2 * PAGE_SIZE);
        fill_pattern(&mut src, &[0]);
        let path = save(dir.path(), &src);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[RAM_FILE_HEADER_SIZE + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let dst = AlignedMemory::new(2 * PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(loader.start(true));
        assert!(!loader.join());
        assert_eq!(loader.failure_reason(), Some(FailureReason::RamFailed));
    }

    #[test]
    fn test_shared_block_restored_from_backing_file() {
        let dir = TempDir::new().unwrap();
        let backing = vec![0x5Au8; 2 * PAGE_SIZE];
        std::fs::write(dir.path().join("ram.img"), &backing).unwrap();

        let src = AlignedMemory::new(2 * PAGE_SIZE);
        let path = dir.path().join("ram.bin");
        let mut saver = RamSaver::new(&path, IndexFlags::SEPARATE_BACKING_STORE).unwrap();
        saver.register_block(
            RamBlock::new("pc.ram", 0, unsafe { src.region() }, PAGE_SIZE as u32)
                .with_flags(RamBlockFlags::MAPPED | RamBlockFlags::MAPPED_SHARED)
                .with_path("ram.img"),
        );
        saver.join().unwrap();

        let dst = AlignedMemory::new(2 * PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32));
        assert!(loader.start(true));
        assert!(loader.join());
        assert!(loader.blocks()[0].need_restore_from_ram_file);
        assert_eq!(dst.as_slice(), backing.as_slice());
    }

    #[test]
    fn test_shared_block_same_mapping_is_skipped() {
        let dir = TempDir::new().unwrap();
        let src = AlignedMemory::new(PAGE_SIZE);
        let path = dir.path().join("ram.bin");
        let mut saver = RamSaver::new(&path, IndexFlags::SEPARATE_BACKING_STORE).unwrap();
        let flags = RamBlockFlags::MAPPED | RamBlockFlags::MAPPED_SHARED;
        saver.register_block(
            RamBlock::new("pc.ram", 0, unsafe { src.region() }, PAGE_SIZE as u32)
                .with_flags(flags)
                .with_path("ram.img"),
        );
        saver.join().unwrap();

        let dst = AlignedMemory::new(PAGE_SIZE);
        let mut loader = RamLoader::new(&path, dir.path());
        loader.register_block(
            RamBlock::new("pc.ram", 0, unsafe { dst.region() }, PAGE_SIZE as u32)
                .with_flags(flags)
                .with_path("ram.img"),
        );
        assert!(loader.start(true));
        assert!(loader.join());
        assert!(loader.is_lazy_from_file_backing());
        assert!(!loader.blocks()[0].need_restore_from_ram_file);
    }
}

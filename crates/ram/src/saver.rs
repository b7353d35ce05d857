//! RAM saver
//!
//! The VM thread registers every RAM block, then calls [`RamSaver::save_page`]
//! for dirty pages. The first call for a block scans the whole block for zero
//! pages in the foreground and queues runs of non-zero pages for the
//! `quicksnap-ram-writer` thread, which encodes, hashes and appends them to a
//! temporary file. [`RamSaver::join`] waits for the writer, appends the index,
//! writes the header and atomically renames the file into place.
//!
//! # Crash Safety
//!
//! 1. Pages and index go to `.ram.bin.tmp` (dot-prefixed temp name)
//! 2. The header is written last, then the file is fsynced
//! 3. Atomic rename to the final name
//! 4. fsync of the parent directory

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use quicksnap_core::{HostRegion, RamBlock};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::{IdentityCodec, PageCodec};
use crate::format::{
    FileIndex, IndexBlock, IndexFlags, PageEntry, RamFileHeader, RAM_FILE_HEADER_SIZE,
    RAM_FILE_VERSION,
};
use crate::queue::WorkQueue;
use crate::zero_page::is_buffer_zeroed;

/// Largest run of pages handed to the writer in one job
const MAX_PAGES_PER_JOB: u64 = 256;

/// Pending jobs before the VM thread blocks
const QUEUE_CAPACITY: usize = 64;

/// Counters for one save
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RamSaveStats {
    /// Pages in stored blocks
    pub total_pages: u64,
    /// Pages elided as zero
    pub zero_pages: u64,
    /// Pages written to the file
    pub written_pages: u64,
    /// Page bytes written to the file
    pub bytes_written: u64,
    /// Time from construction to join
    pub duration: Duration,
}

struct WriteJob {
    block: usize,
    first_page: u64,
    count: u64,
    host: HostRegion,
    page_size: usize,
}

struct WrittenPage {
    block: usize,
    page: u64,
    entry: PageEntry,
}

struct WriterOutput {
    file: File,
    pages: Vec<WrittenPage>,
    end_pos: u64,
}

struct SaverBlock {
    block: RamBlock,
    pages: Vec<PageEntry>,
    pages_stored: bool,
    scanned: bool,
}

/// Writes guest RAM to a RAM file on a background thread
pub struct RamSaver {
    final_path: PathBuf,
    temp_path: PathBuf,
    flags: IndexFlags,
    codec_id: String,
    blocks: Vec<SaverBlock>,
    queue: Arc<WorkQueue<WriteJob>>,
    writer: Option<JoinHandle<io::Result<WriterOutput>>>,
    canceled: Arc<AtomicBool>,
    has_error: Arc<AtomicBool>,
    stats: RamSaveStats,
    started: Instant,
    finished: bool,
}

impl RamSaver {
    /// Start a saver writing to `path` with the identity codec
    pub fn new(path: &Path, flags: IndexFlags) -> io::Result<Self> {
        Self::with_codec(path, flags, Box::new(IdentityCodec))
    }

    /// Start a saver with an explicit codec
    ///
    /// Creates the temporary file and spawns the writer thread.
    pub fn with_codec(path: &Path, flags: IndexFlags, codec: Box<dyn PageCodec>) -> io::Result<Self> {
        let temp_path = temp_path_for(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&[0u8; RAM_FILE_HEADER_SIZE])?;

        let codec_id = codec.codec_id().to_string();
        let queue = Arc::new(WorkQueue::new(QUEUE_CAPACITY));
        let canceled = Arc::new(AtomicBool::new(false));
        let has_error = Arc::new(AtomicBool::new(false));

        let writer = {
            let queue = Arc::clone(&queue);
            let canceled = Arc::clone(&canceled);
            let has_error = Arc::clone(&has_error);
            thread::Builder::new()
                .name("quicksnap-ram-writer".to_string())
                .spawn(move || writer_loop(file, &queue, codec.as_ref(), &canceled, &has_error))?
        };

        debug!(target: "quicksnap::ram", path = %path.display(), "RAM saver started");

        Ok(RamSaver {
            final_path: path.to_path_buf(),
            temp_path,
            flags,
            codec_id,
            blocks: Vec::new(),
            queue,
            writer: Some(writer),
            canceled,
            has_error,
            stats: RamSaveStats::default(),
            started: Instant::now(),
            finished: false,
        })
    }

    /// Final path of the RAM file
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Register a block before any of its pages are saved
    pub fn register_block(&mut self, block: RamBlock) {
        if block.page_size == 0 || block.total_size % u64::from(block.page_size) != 0 {
            warn!(target: "quicksnap::ram", block = %block.id, size = block.total_size,
                page_size = block.page_size, "RAM block is not a whole number of pages");
            self.has_error.store(true, Ordering::Release);
            return;
        }
        if self.blocks.iter().any(|b| b.block.id == block.id) {
            warn!(target: "quicksnap::ram", block = %block.id, "RAM block registered twice");
            return;
        }
        let by_reference = self.flags.contains(IndexFlags::SEPARATE_BACKING_STORE)
            && block.is_mapped_shared();
        let pages_stored = block.is_saveable() && !by_reference;
        let pages = if pages_stored {
            vec![PageEntry::ZERO; block.page_count() as usize]
        } else {
            Vec::new()
        };
        self.blocks.push(SaverBlock {
            block,
            pages,
            pages_stored,
            scanned: false,
        });
    }

    /// Hand one dirty page to the saver
    ///
    /// Returns the number of bytes taken over, meaning the caller must not
    /// save this page itself. Returns 0 if the page does not belong to a
    /// registered block.
    pub fn save_page(&mut self, block_offset: u64, page_offset: u64, size: usize) -> usize {
        if self.finished {
            return 0;
        }
        let Some(idx) = self
            .blocks
            .iter()
            .position(|b| b.block.start_offset == block_offset)
        else {
            warn!(target: "quicksnap::ram", block_offset, "page for unregistered RAM block");
            self.has_error.store(true, Ordering::Release);
            return 0;
        };
        if page_offset.saturating_add(size as u64) > self.blocks[idx].block.total_size {
            warn!(target: "quicksnap::ram", block = %self.blocks[idx].block.id, page_offset,
                size, "page outside its RAM block");
            self.has_error.store(true, Ordering::Release);
            return 0;
        }
        if !self.blocks[idx].scanned {
            self.scan_block(idx);
        }
        size
    }

    fn scan_block(&mut self, idx: usize) {
        let sb = &mut self.blocks[idx];
        sb.scanned = true;
        if !sb.pages_stored {
            return;
        }
        let host = sb.block.host;
        let page_size = sb.block.page_size as usize;
        let page_count = sb.block.page_count();

        let mut zero_pages = 0;
        let mut run: Option<(u64, u64)> = None;
        for page in 0..page_count {
            let data = host.slice(page as usize * page_size, page_size);
            if is_buffer_zeroed(data) {
                zero_pages += 1;
                if let Some((first, count)) = run.take() {
                    self.enqueue(idx, first, count, host, page_size);
                }
                continue;
            }
            run = match run {
                Some((first, count)) if count < MAX_PAGES_PER_JOB => Some((first, count + 1)),
                Some((first, count)) => {
                    self.enqueue(idx, first, count, host, page_size);
                    Some((page, 1))
                }
                None => Some((page, 1)),
            };
        }
        if let Some((first, count)) = run {
            self.enqueue(idx, first, count, host, page_size);
        }
        self.stats.total_pages += page_count;
        self.stats.zero_pages += zero_pages;
    }

    fn enqueue(&self, block: usize, first_page: u64, count: u64, host: HostRegion, page_size: usize) {
        let job = WriteJob {
            block,
            first_page,
            count,
            host,
            page_size,
        };
        // The queue only rejects jobs after cancel; dropping them is correct then.
        let _ = self.queue.push(job);
    }

    /// Flush everything, write the index and move the file into place
    ///
    /// Blocks that never received a `save_page` call are scanned here so the
    /// file always covers every registered block.
    pub fn join(&mut self) -> io::Result<RamSaveStats> {
        if self.finished {
            return if self.has_error() {
                Err(io::Error::new(io::ErrorKind::Other, "RAM save failed"))
            } else {
                Ok(self.stats)
            };
        }
        for idx in 0..self.blocks.len() {
            if !self.blocks[idx].scanned {
                self.scan_block(idx);
            }
        }
        self.queue.close();
        self.finished = true;

        let result = self.wait_for_writer().and_then(|output| self.finish_file(output));
        self.stats.duration = self.started.elapsed();
        match result {
            Ok(()) => {
                info!(target: "quicksnap::ram", path = %self.final_path.display(),
                    pages = self.stats.total_pages, zero_pages = self.stats.zero_pages,
                    written_pages = self.stats.written_pages, bytes = self.stats.bytes_written,
                    duration_ms = self.stats.duration.as_millis() as u64, "RAM saved");
                Ok(self.stats)
            }
            Err(e) => {
                warn!(target: "quicksnap::ram", path = %self.final_path.display(), error = %e,
                    "RAM save failed");
                self.has_error.store(true, Ordering::Release);
                let _ = fs::remove_file(&self.temp_path);
                Err(e)
            }
        }
    }

    fn wait_for_writer(&mut self) -> io::Result<WriterOutput> {
        let handle = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "RAM writer already joined"))?;
        let output = handle
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "RAM writer thread panicked"))??;
        if self.has_error() {
            return Err(io::Error::new(io::ErrorKind::Other, "RAM save reported an error"));
        }
        if self.is_canceled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "RAM save canceled"));
        }
        Ok(output)
    }

    fn finish_file(&mut self, output: WriterOutput) -> io::Result<()> {
        let WriterOutput {
            mut file,
            pages,
            end_pos,
        } = output;

        for written in pages {
            let sb = &mut self.blocks[written.block];
            sb.pages[written.page as usize] = written.entry;
            self.stats.written_pages += 1;
            self.stats.bytes_written += u64::from(written.entry.size_on_disk);
        }

        let index = FileIndex {
            flags: self.flags,
            codec_id: self.codec_id.clone(),
            total_pages: self.blocks.iter().map(|b| b.block.page_count()).sum(),
            blocks: self
                .blocks
                .iter()
                .map(|b| IndexBlock {
                    id: b.block.id.clone(),
                    page_count: b.block.page_count(),
                    page_size: b.block.page_size,
                    flags: b.block.flags,
                    path: b.block.path.clone(),
                    pages: b.pages.clone(),
                    pages_stored: b.pages_stored,
                })
                .collect(),
        };
        let index_bytes = index.encode();
        let header = RamFileHeader {
            version: RAM_FILE_VERSION,
            index_offset: end_pos,
            index_len: index_bytes.len() as u64,
            index_crc32: crc32fast::hash(&index_bytes),
        };

        file.seek(SeekFrom::Start(end_pos))?;
        file.write_all(&index_bytes)?;
        file.set_len(end_pos + index_bytes.len() as u64)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Stop the writer and discard partial output
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.canceled.store(true, Ordering::Release);
        self.queue.clear();
        self.queue.close();
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        self.finished = true;
        let _ = fs::remove_file(&self.temp_path);
        debug!(target: "quicksnap::ram", path = %self.final_path.display(), "RAM save canceled");
    }

    /// True once `cancel` was called
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// True if registration, writing or finalizing failed
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// True once `join` or `cancel` ran
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Counters so far
    pub fn stats(&self) -> RamSaveStats {
        self.stats
    }
}

impl Drop for RamSaver {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ram.bin".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn writer_loop(
    file: File,
    queue: &WorkQueue<WriteJob>,
    codec: &dyn PageCodec,
    canceled: &AtomicBool,
    has_error: &AtomicBool,
) -> io::Result<WriterOutput> {
    let mut out = BufWriter::with_capacity(1 << 20, file);
    let mut pos = RAM_FILE_HEADER_SIZE as u64;
    let mut pages = Vec::new();
    let mut failure: Option<io::Error> = None;

    // Keep popping after a failure so producers never block on a full queue.
    while let Some(job) = queue.pop() {
        if failure.is_some() || canceled.load(Ordering::Acquire) {
            continue;
        }
        for i in 0..job.count {
            let page = job.first_page + i;
            let data = job.host.slice(page as usize * job.page_size, job.page_size);
            let hash = xxh3_64(data);
            let encoded = codec.encode(data);
            let stored: &[u8] = if !encoded.is_empty() && encoded.len() < job.page_size {
                &encoded
            } else {
                data
            };
            if let Err(e) = out.write_all(stored) {
                has_error.store(true, Ordering::Release);
                failure = Some(e);
                break;
            }
            pages.push(WrittenPage {
                block: job.block,
                page,
                entry: PageEntry {
                    size_on_disk: stored.len() as u32,
                    file_pos: pos,
                    hash,
                },
            });
            pos += stored.len() as u64;
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    let file = out.into_inner().map_err(|e| e.into_error())?;
    Ok(WriterOutput {
        file,
        pages,
        end_pos: pos,
    })
}

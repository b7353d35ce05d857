//! In-process VM fake
//!
//! [`FakeVm`] owns its guest RAM and drives the callback table in the same
//! order a VM does. Device state is a small file in the snapshot directory;
//! loading a snapshot without it quick-fails with `-ENOENT`, as a VM does
//! for a snapshot missing from its image.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use quicksnap_core::{
    AlignedMemory, FailureReason, RamBlock, RamBlockFlags, SnapshotOperation, ENOENT, PAGE_SIZE,
};

use crate::metadata::{SnapshotMetadata, VmConfiguration};
use crate::paths::SnapshotPaths;
use crate::vm::{SnapshotCallbacks, VmOperations};

/// File the fake writes as its device state
pub const DEVICE_STATE_FILE_NAME: &str = "device.state";

/// Pages in the block created by [`FakeVm::with_default_blocks`]
const DEFAULT_BLOCK_PAGES: usize = 16;

struct FakeBlock {
    id: String,
    start_offset: u64,
    memory: AlignedMemory,
    flags: RamBlockFlags,
    path: String,
    readonly: bool,
}

impl FakeBlock {
    fn ram_block(&self) -> RamBlock {
        // SAFETY: blocks are never removed from a FakeVm, and the RAM
        // protocol only touches the region inside a save or load the VM
        // drives, while no `read_ram`/`write_ram` borrow is alive.
        let mut block = RamBlock::new(
            self.id.clone(),
            self.start_offset,
            unsafe { self.memory.region() },
            PAGE_SIZE as u32,
        )
        .with_flags(self.flags)
        .with_path(self.path.clone());
        block.readonly = self.readonly;
        block
    }
}

/// A VM with real RAM and fake device state
pub struct FakeVm {
    paths: SnapshotPaths,
    blocks: Mutex<Vec<FakeBlock>>,
    config: Mutex<VmConfiguration>,
    stops: AtomicUsize,
    starts: AtomicUsize,
    resets: AtomicUsize,
    exits: AtomicUsize,
    deletes: AtomicUsize,
    save_skipped: AtomicBool,
    fail_next_save: AtomicBool,
    fail_next_load: AtomicBool,
    failure_reasons: Mutex<Vec<(String, FailureReason)>>,
    deleted: Mutex<Vec<(String, Option<u32>)>>,
}

impl FakeVm {
    /// A VM with no RAM blocks
    pub fn new(paths: SnapshotPaths, config: VmConfiguration) -> Self {
        FakeVm {
            paths,
            blocks: Mutex::new(Vec::new()),
            config: Mutex::new(config),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            exits: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            save_skipped: AtomicBool::new(false),
            fail_next_save: AtomicBool::new(false),
            fail_next_load: AtomicBool::new(false),
            failure_reasons: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// A VM with a single zeroed `pc.ram` block
    pub fn with_default_blocks(paths: SnapshotPaths) -> Self {
        let size = DEFAULT_BLOCK_PAGES * PAGE_SIZE;
        let vm = FakeVm::new(
            paths,
            VmConfiguration {
                cpu_core_count: 2,
                ram_size_bytes: size as u64,
                hypervisor: "fake".to_string(),
            },
        );
        vm.add_block("pc.ram", 0, size);
        vm
    }

    /// Add a zeroed RAM block
    pub fn add_block(&self, id: &str, start_offset: u64, size: usize) {
        self.add_block_with(id, start_offset, size, RamBlockFlags::empty(), "");
    }

    /// Add a zeroed RAM block with backing-store flags and path
    pub fn add_block_with(
        &self,
        id: &str,
        start_offset: u64,
        size: usize,
        flags: RamBlockFlags,
        path: &str,
    ) {
        self.blocks.lock().push(FakeBlock {
            id: id.to_string(),
            start_offset,
            memory: AlignedMemory::new(size),
            flags,
            path: path.to_string(),
            readonly: false,
        });
    }

    /// Mark a block read-only
    pub fn set_block_readonly(&self, id: &str, readonly: bool) {
        if let Some(block) = self.blocks.lock().iter_mut().find(|b| b.id == id) {
            block.readonly = readonly;
        }
    }

    /// Write guest RAM
    ///
    /// # Panics
    ///
    /// Panics on an unknown block or an out-of-range write.
    pub fn write_ram(&self, id: &str, offset: usize, data: &[u8]) {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .iter_mut()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("no RAM block '{id}'"));
        block.memory.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Read guest RAM
    ///
    /// # Panics
    ///
    /// Panics on an unknown block or an out-of-range read.
    pub fn read_ram(&self, id: &str, offset: usize, len: usize) -> Vec<u8> {
        let blocks = self.blocks.lock();
        let block = blocks
            .iter()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("no RAM block '{id}'"));
        block.memory.as_slice()[offset..offset + len].to_vec()
    }

    /// Fill every block with `byte`
    pub fn fill_ram(&self, byte: u8) {
        for block in self.blocks.lock().iter_mut() {
            block.memory.as_mut_slice().fill(byte);
        }
    }

    /// Replace the VM configuration
    pub fn set_config(&self, config: VmConfiguration) {
        *self.config.lock() = config;
    }

    /// Raise or clear the skip-save flag
    pub fn set_save_skipped(&self, skipped: bool) {
        self.save_skipped.store(skipped, Ordering::SeqCst);
    }

    /// Make the next save report failure
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Make the next load report failure after RAM streamed
    pub fn fail_next_load(&self) {
        self.fail_next_load.store(true, Ordering::SeqCst);
    }

    /// Number of `vm_stop` calls
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of `vm_start` calls
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `vm_reset` calls
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Number of `set_exiting` calls
    pub fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    /// Number of `snapshot_delete` calls
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Failure reasons reported through `set_failure_reason`
    pub fn failure_reasons(&self) -> Vec<(String, FailureReason)> {
        self.failure_reasons.lock().clone()
    }

    /// Invalid-load count persisted for `name` when it was last deleted
    ///
    /// `None` if `name` was never deleted or had no readable metadata.
    pub fn invalid_loads_at_delete(&self, name: &str) -> Option<u32> {
        self.deleted
            .lock()
            .iter()
            .rev()
            .find(|(deleted, _)| deleted == name)
            .and_then(|(_, count)| *count)
    }

    /// Device state file of snapshot `name`
    pub fn device_state_path(&self, name: &str) -> Option<PathBuf> {
        self.paths
            .snapshot_dir(name)
            .ok()
            .map(|dir| dir.join(DEVICE_STATE_FILE_NAME))
    }

    fn ram_blocks(&self) -> Vec<RamBlock> {
        self.blocks.lock().iter().map(FakeBlock::ram_block).collect()
    }

    fn write_device_state(&self, name: &str) -> io::Result<()> {
        let path = self
            .device_state_path(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad snapshot name"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.config.lock().hypervisor.as_bytes())
    }
}

impl VmOperations for FakeVm {
    fn snapshot_save(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool {
        if !callbacks.on_start(SnapshotOperation::Save, name) {
            return false;
        }
        let blocks = self.ram_blocks();
        for block in &blocks {
            callbacks.register_block(SnapshotOperation::Save, block.clone());
        }

        let mut pages_ok = true;
        'blocks: for block in blocks.iter().filter(|b| b.is_saveable()) {
            let size = block.page_size as usize;
            for page in 0..block.page_count() {
                if callbacks.is_canceled(SnapshotOperation::Save, name) {
                    pages_ok = false;
                    break 'blocks;
                }
                let handled = callbacks.save_page(block.start_offset, page * size as u64, size);
                pages_ok &= handled == size;
            }
        }

        let state_ok = pages_ok && self.write_device_state(name).is_ok();
        let ram_ok = callbacks.saving_complete();
        let injected = self.fail_next_save.swap(false, Ordering::SeqCst);
        let result = if state_ok && ram_ok && !injected { 0 } else { -1 };
        callbacks.on_end(SnapshotOperation::Save, name, result);
        result == 0
    }

    fn snapshot_load(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool {
        let has_state = self
            .device_state_path(name)
            .map_or(false, |path| path.exists());
        if !has_state {
            callbacks.on_quick_fail(SnapshotOperation::Load, name, -ENOENT);
            return false;
        }
        if !callbacks.on_start(SnapshotOperation::Load, name) {
            return false;
        }
        let blocks = self.ram_blocks();
        for block in &blocks {
            callbacks.register_block(SnapshotOperation::Load, block.clone());
        }
        let ram_ok = callbacks.start_loading();
        if ram_ok {
            // Touch the first page of every block, as vCPUs would on resume.
            for block in &blocks {
                callbacks.load_ram(block.host.as_ptr(), block.page_size as usize);
            }
        }
        let injected = self.fail_next_load.swap(false, Ordering::SeqCst);
        let result = if ram_ok && !injected { 0 } else { -1 };
        callbacks.on_end(SnapshotOperation::Load, name, result);
        result == 0
    }

    fn snapshot_delete(&self, name: &str, callbacks: &dyn SnapshotCallbacks) -> bool {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let invalid_loads = self
            .paths
            .metadata_file(name)
            .ok()
            .and_then(|path| SnapshotMetadata::read_from(&path).ok())
            .map(|metadata| metadata.invalid_loads);
        self.deleted.lock().push((name.to_string(), invalid_loads));
        if !callbacks.on_start(SnapshotOperation::Delete, name) {
            return false;
        }
        let result = match self.device_state_path(name).map(fs::remove_file) {
            Some(Ok(())) => 0,
            Some(Err(e)) if e.kind() == io::ErrorKind::NotFound => 0,
            _ => -1,
        };
        callbacks.on_end(SnapshotOperation::Delete, name, result);
        result == 0
    }

    fn vm_stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn vm_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn vm_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn set_exiting(&self) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }

    fn is_snapshot_save_skipped(&self) -> bool {
        self.save_skipped.load(Ordering::SeqCst)
    }

    fn set_failure_reason(&self, name: &str, reason: FailureReason) {
        self.failure_reasons.lock().push((name.to_string(), reason));
    }

    fn vm_configuration(&self) -> VmConfiguration {
        self.config.lock().clone()
    }
}

//! Host memory views
//!
//! Guest RAM belongs to the external memory subsystem. The snapshot layers
//! only ever see it through [`HostRegion`], a non-owning pointer + length
//! view: it never frees the memory and never extends its lifetime.
//!
//! [`AlignedMemory`] is an owned, page-aligned, zero-initialized buffer for
//! hosts that want this crate to allocate guest RAM (and for tests).

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::limits::PAGE_SIZE;

/// Non-owning view of a host memory region backing guest RAM
///
/// Copying a `HostRegion` copies the view, not the memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HostRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: HostRegion is a plain address range. The creator of the region
// guarantees (see `HostRegion::new`) that the memory outlives every use and
// that concurrent access is coordinated by the VM lock.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Create a view over `len` bytes starting at `ptr`
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must be valid for reads and writes for as long as this
    /// region (or any copy of it) is used, and must not be written by anyone
    /// else while a save or load reads or writes it.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| HostRegion { ptr, len })
    }

    /// Start address
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of `ptr` inside this region, if it points into it
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        if addr >= start && addr < start + self.len {
            Some(addr - start)
        } else {
            None
        }
    }

    /// Borrow `len` bytes at `offset`
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "host region read out of bounds: {offset}+{len} > {}",
            self.len
        );
        // SAFETY: bounds checked above; validity guaranteed by `new`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Copy `data` into the region at `offset`
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(
            offset
                .checked_add(data.len())
                .map_or(false, |end| end <= self.len),
            "host region write out of bounds: {offset}+{} > {}",
            data.len(),
            self.len
        );
        // SAFETY: bounds checked above; validity guaranteed by `new`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Zero `len` bytes at `offset`
    pub fn zero(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len),
            "host region zero out of bounds"
        );
        // SAFETY: bounds checked above; validity guaranteed by `new`.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len) }
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Owned, page-aligned, zero-initialized buffer
pub struct AlignedMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedMemory uniquely owns its allocation.
unsafe impl Send for AlignedMemory {}
unsafe impl Sync for AlignedMemory {}

impl AlignedMemory {
    /// Allocate `len` zeroed bytes aligned to [`PAGE_SIZE`]
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or the allocation fails.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "AlignedMemory must not be empty");
        let layout = match Layout::from_size_align(len, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid layout for {len} bytes: {e}"),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        AlignedMemory { ptr, layout }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; empty buffers cannot be created
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Non-owning view for registration with the RAM protocol
    ///
    /// # Safety
    ///
    /// The returned region (and every copy of it) must not be used after
    /// `self` is dropped, and must not be written through while a slice
    /// from [`as_slice`](Self::as_slice) or
    /// [`as_mut_slice`](Self::as_mut_slice) is alive.
    ///
    /// ```compile_fail
    /// use quicksnap_core::AlignedMemory;
    ///
    /// let mem = AlignedMemory::new(4096);
    /// let region = mem.region();
    /// ```
    pub unsafe fn region(&self) -> HostRegion {
        HostRegion {
            ptr: self.ptr,
            len: self.len(),
        }
    }

    /// Contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: we own `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// Mutable contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: we own `len` initialized bytes and hold `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for AlignedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for AlignedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedMemory")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_memory_is_zeroed_and_aligned() {
        let mem = AlignedMemory::new(3 * PAGE_SIZE);
        assert_eq!(mem.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        assert!(mem.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_region_write_then_read() {
        let mem = AlignedMemory::new(PAGE_SIZE);
        let region = unsafe { mem.region() };
        region.write(10, b"hello");
        assert_eq!(region.slice(10, 5), b"hello");
        assert_eq!(&mem.as_slice()[10..15], b"hello");
        region.zero(10, 5);
        assert_eq!(region.slice(10, 5), &[0u8; 5]);
    }

    #[test]
    fn test_offset_of() {
        let mem = AlignedMemory::new(2 * PAGE_SIZE);
        let region = unsafe { mem.region() };
        let inside = unsafe { region.as_ptr().add(PAGE_SIZE) };
        assert_eq!(region.offset_of(inside), Some(PAGE_SIZE));
        let past = unsafe { region.as_ptr().add(2 * PAGE_SIZE) };
        assert_eq!(region.offset_of(past), None);
    }

    #[test]
    fn test_null_region_rejected() {
        assert!(unsafe { HostRegion::new(std::ptr::null_mut(), 16) }.is_none());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_slice_out_of_bounds_panics() {
        let mem = AlignedMemory::new(PAGE_SIZE);
        let _ = unsafe { mem.region() }.slice(PAGE_SIZE - 1, 2);
    }
}

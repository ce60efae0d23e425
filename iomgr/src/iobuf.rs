//! Aligned I/O buffers.
//!
//! The allocation strategy is chosen when the manager starts: plain heap
//! memory for event-driven reactors, page-locked memory for the polling
//! backend, whose buffers must stay resident for the device to DMA into.
//! Buffers are owned values that return their memory to the allocator
//! they came from when dropped.

use crate::error::{IomgrError, Result};

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// An aligned allocation strategy.
///
/// Memory returned by [`alloc`](Self::alloc) and
/// [`realloc`](Self::realloc) must be zero-filled so that buffers never
/// expose uninitialized bytes.
pub trait AlignedAllocator: Send + Sync {
    fn name(&self) -> &str;

    /// Allocates zeroed memory for `layout`, which has a non-zero size.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Frees a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with exactly `layout` and must
    /// not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);

    /// Moves a block to a new layout, keeping the leading
    /// `min(old.size(), new.size())` bytes. On failure the old block is
    /// left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`dealloc`](Self::dealloc) for `ptr` and `old`.
    unsafe fn realloc(&self, ptr: NonNull<u8>, old: Layout, new: Layout) -> Option<NonNull<u8>> {
        let fresh = self.alloc(new)?;

        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old.size().min(new.size()));
            self.dealloc(ptr, old);
        }

        Some(fresh)
    }
}

/// Heap allocator backed by the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl AlignedAllocator for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Allocator whose blocks are locked into RAM with `mlock`.
///
/// Failing to lock (typically `RLIMIT_MEMLOCK`) is not fatal: the block is
/// still handed out, merely pageable.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedAllocator;

impl AlignedAllocator for PinnedAllocator {
    fn name(&self) -> &str {
        "pinned"
    }

    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;

        let rc = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, layout.size()) };
        if rc != 0 {
            tracing::debug!(
                size = layout.size(),
                error = %std::io::Error::last_os_error(),
                "mlock failed, buffer stays pageable"
            );
        }

        Some(ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe {
            libc::munlock(ptr.as_ptr() as *const libc::c_void, layout.size());
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// An aligned, zero-initialized byte buffer.
///
/// Dereferences to `[u8]`. Freed exactly once, on drop, by the allocator
/// that produced it.
pub struct IoBuffer {
    ptr: NonNull<u8>,
    len: usize,
    /// Layout of the underlying block; its size is `len` rounded up to one
    /// byte since empty blocks cannot be allocated.
    layout: Layout,
    allocator: Arc<dyn AlignedAllocator>,
}

// The buffer exclusively owns its block.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

fn block_layout(align: usize, size: usize) -> Result<Layout> {
    Layout::from_size_align(size.max(1), align).map_err(|_| IomgrError::Alloc { size, align })
}

impl IoBuffer {
    /// Allocates `size` zeroed bytes aligned to `align`, a power of two.
    pub fn alloc(allocator: Arc<dyn AlignedAllocator>, align: usize, size: usize) -> Result<Self> {
        let layout = block_layout(align, size)?;
        let ptr = allocator
            .alloc(layout)
            .ok_or(IomgrError::Alloc { size, align })?;

        Ok(Self {
            ptr,
            len: size,
            layout,
            allocator,
        })
    }

    /// Resizes the buffer, keeping its leading `min(len, new_size)` bytes.
    ///
    /// On failure the buffer is left untouched.
    pub fn realloc(&mut self, align: usize, new_size: usize) -> Result<()> {
        let layout = block_layout(align, new_size)?;
        let ptr = unsafe { self.allocator.realloc(self.ptr, self.layout, layout) }
            .ok_or(IomgrError::Alloc {
                size: new_size,
                align,
            })?;

        self.ptr = ptr;
        self.len = new_size;
        self.layout = layout;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Name of the allocator the buffer came from.
    pub fn allocator(&self) -> &str {
        self.allocator.name()
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        unsafe { self.allocator.dealloc(self.ptr, self.layout) }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.len)
            .field("align", &self.align())
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

//! # Shared Kernel Heap
//!
//! [`LockedHeap`] is the process-wide handle the rest of the kernel talks to.
//! Every call runs as one critical section of a [`HeapLock`], so tree splices
//! and free-list updates of concurrent callers never interleave.
//!
//! It also implements [`GlobalAlloc`], so a kernel can install it directly:
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap<KernelMapper> = LockedHeap::new();
//!
//! HEAP.init(KernelMapper::new(), KERNEL_HEAP_START, KERNEL_HEAP_MAX)?;
//! ```
//!
//! The heap is built at compile time inside the `static` and `init` lays it
//! out in place, so nothing of the heap's size ever lands on the stack.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::{DEFAULT_EXTENT_CAPACITY, DEFAULT_SMALL_PAGES, PAGE_SIZE};
use crate::error::{HeapError, InitError};
use crate::heap::KernelHeap;
use crate::mapper::{FrameMetadata, PageMapper};
use crate::sync::HeapLock;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

pub struct LockedHeap<M, const EXTENTS: usize = DEFAULT_EXTENT_CAPACITY, const SMALL_PAGES: usize = DEFAULT_SMALL_PAGES>
{
    heap: HeapLock<KernelHeap<M, EXTENTS, SMALL_PAGES>>,
}

impl<M, const EXTENTS: usize, const SMALL_PAGES: usize> Default for LockedHeap<M, EXTENTS, SMALL_PAGES>
where
    M: PageMapper + FrameMetadata,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M, const EXTENTS: usize, const SMALL_PAGES: usize> LockedHeap<M, EXTENTS, SMALL_PAGES>
where
    M: PageMapper + FrameMetadata,
{
    /// An uninitialized heap; every allocation fails until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: HeapLock::new(KernelHeap::empty()),
        }
    }

    /// Lay the heap out over `[region_start, region_end)`, tearing down any
    /// previous layout.
    ///
    /// # Errors
    /// See [`KernelHeap::init`].
    pub fn init(&self, mapper: M, region_start: VirtualAddress, region_end: VirtualAddress) -> Result<(), InitError> {
        self.heap
            .with_lock(|heap| heap.init(mapper, region_start, region_end))
    }

    /// [`KernelHeap::kmalloc`] under the lock.
    ///
    /// # Errors
    /// [`HeapError::NotInitialized`] before [`init`](Self::init), else see
    /// [`KernelHeap::kmalloc`].
    pub fn alloc(&self, size: u64) -> Result<VirtualAddress, HeapError> {
        self.heap.with_lock(|heap| heap.kmalloc(size))
    }

    /// [`KernelHeap::kfree`] under the lock.
    ///
    /// # Panics
    /// See [`KernelHeap::kfree`].
    pub fn free(&self, va: VirtualAddress) {
        self.heap.with_lock(|heap| heap.kfree(va));
    }

    /// [`KernelHeap::krealloc`] under the lock.
    ///
    /// # Errors
    /// [`HeapError::NotInitialized`] before [`init`](Self::init), else see
    /// [`KernelHeap::krealloc`].
    pub fn realloc(&self, va: VirtualAddress, new_size: u64) -> Result<VirtualAddress, HeapError> {
        self.heap.with_lock(|heap| heap.krealloc(va, new_size))
    }

    #[must_use]
    pub fn to_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.heap.with_lock(|heap| heap.physical_address(va))
    }

    #[must_use]
    pub fn to_virtual(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.heap.with_lock(|heap| heap.virtual_address(pa))
    }

    /// Run `f` on the heap under the lock, if it is initialized.
    pub fn with_heap<U>(&self, f: impl FnOnce(&mut KernelHeap<M, EXTENTS, SMALL_PAGES>) -> U) -> Option<U> {
        self.heap
            .with_lock(|heap| heap.is_initialized().then(|| f(heap)))
    }
}

/// Heap size serving `layout`; slots are aligned to their size class and
/// page ranges to a page.
fn request_size(layout: Layout) -> Option<u64> {
    (layout.align() as u64 <= PAGE_SIZE).then(|| layout.size().max(layout.align()) as u64)
}

unsafe impl<M, const EXTENTS: usize, const SMALL_PAGES: usize> GlobalAlloc for LockedHeap<M, EXTENTS, SMALL_PAGES>
where
    M: PageMapper + FrameMetadata + Send,
{
    /// Allocate at least `layout.size()` bytes aligned to at most one page.
    ///
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        request_size(layout)
            .and_then(|size| Self::alloc(self, size).ok())
            .map_or(null_mut(), VirtualAddress::as_mut_ptr)
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from this allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(VirtualAddress::from_ptr(ptr));
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return null_mut();
        };
        request_size(new_layout)
            .and_then(|size| Self::realloc(self, VirtualAddress::from_ptr(ptr), size).ok())
            .map_or(null_mut(), VirtualAddress::as_mut_ptr)
    }
}

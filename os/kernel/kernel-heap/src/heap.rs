//! # Kernel Heap
//!
//! [`KernelHeap`] owns both allocators and routes every request by size
//! (allocation) or by address (free, resize, lookups).
//!
//! ```text
//!  region_start                                                  region_end
//!    ┌────────────────────────┬───────┬─────────────────────────────┐
//!    │   small-block region   │ guard │        page region          │
//!    │  SMALL_PAGES × 4 KiB   │ 4 KiB │  break grows upwards ─►     │
//!    └────────────────────────┴───────┴─────────────────────────────┘
//!      size ≤ 2 KiB                      size > 2 KiB
//! ```
//!
//! The heap itself is not synchronized; see [`LockedHeap`](crate::LockedHeap)
//! for the shared, lock-protected handle.
//!
//! [`KernelHeap::empty`] is a `const fn` and [`KernelHeap::init`] works in
//! place, so a heap of the default capacities can live in a `static` and be
//! brought up from a small boot stack.

use crate::addresses::{PhysicalAddress, VirtualAddress, copy_bytes, pages_for};
use crate::config::{
    DEFAULT_EXTENT_CAPACITY, DEFAULT_SMALL_PAGES, GUARD_PAGES, MAX_BLOCK_SIZE, PAGE_SIZE, SIZE_CLASSES,
};
use crate::error::{HeapError, InitError};
use crate::extent_index::Extent;
use crate::mapper::{FrameMetadata, PageMapper};
use crate::page_range::{PageRangeAllocator, PlacementStrategy};
use crate::small_block::SmallBlockAllocator;
use log::info;

/// The kernel heap with the default capacities.
pub type DefaultKernelHeap<M> = KernelHeap<M, DEFAULT_EXTENT_CAPACITY, DEFAULT_SMALL_PAGES>;

/// Snapshot of the heap's bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Top of the allocated part of the page region.
    pub brk: VirtualAddress,
    /// Number of tracked free extents.
    pub free_extents: usize,
    /// Pages held by the free extents.
    pub free_extent_pages: u64,
    /// Small-block pages dedicated to a size class.
    pub assigned_small_pages: usize,
    /// Free slots per size class, smallest class first.
    pub free_slots: [usize; SIZE_CLASSES],
}

/// Which allocator owns an address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Owner {
    SmallBlock,
    PageRange,
}

/// The heap over one virtual address range.
///
/// - `EXTENTS`: free-extent records of the page-range allocator.
/// - `SMALL_PAGES`: pages in the small-block region.
pub struct KernelHeap<M, const EXTENTS: usize, const SMALL_PAGES: usize> {
    /// `None` until [`init`](Self::init).
    mapper: Option<M>,
    small: SmallBlockAllocator<SMALL_PAGES>,
    pages: PageRangeAllocator<EXTENTS>,
}

impl<M, const EXTENTS: usize, const SMALL_PAGES: usize> KernelHeap<M, EXTENTS, SMALL_PAGES>
where
    M: PageMapper + FrameMetadata,
{
    /// A heap without mapper or region. Allocations fail with
    /// [`HeapError::NotInitialized`] until [`init`](Self::init).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            mapper: None,
            small: SmallBlockAllocator::new(),
            pages: PageRangeAllocator::new(),
        }
    }

    /// Build a heap over `[region_start, region_end)`.
    ///
    /// # Errors
    /// See [`init`](Self::init).
    pub fn new(mapper: M, region_start: VirtualAddress, region_end: VirtualAddress) -> Result<Self, InitError> {
        let mut heap = Self::empty();
        heap.init(mapper, region_start, region_end)?;
        Ok(heap)
    }

    /// Lay the heap out over `[region_start, region_end)` with `mapper`, in place.
    ///
    /// A heap that was already initialized first unmaps every page it still
    /// holds and forgets the recorded extents, through its previous mapper.
    /// Every earlier allocation is invalid afterwards. On error nothing changes.
    ///
    /// # Errors
    /// - [`InitError::Unaligned`] if either bound is not page aligned.
    /// - [`InitError::RegionTooSmall`] if the region cannot hold the
    ///   small-block region, the guard page and one page of page region.
    /// - [`InitError::TooManyPages`] if the page region could fragment into
    ///   more extents than `EXTENTS`.
    pub fn init(&mut self, mapper: M, region_start: VirtualAddress, region_end: VirtualAddress) -> Result<(), InitError> {
        if !region_start.is_page_aligned() || !region_end.is_page_aligned() {
            return Err(InitError::Unaligned);
        }

        let small_end = region_start + SmallBlockAllocator::<SMALL_PAGES>::REGION_SIZE;
        let page_start = small_end.add_pages(GUARD_PAGES);
        let needed = (page_start - region_start) + PAGE_SIZE;
        let available = region_end.as_u64().saturating_sub(region_start.as_u64());
        if available < needed {
            return Err(InitError::RegionTooSmall { needed, available });
        }

        let page_region = (region_end - page_start) / PAGE_SIZE;
        if page_region / 2 + 1 > EXTENTS as u64 {
            return Err(InitError::TooManyPages {
                pages: page_region,
                capacity: EXTENTS,
            });
        }

        if let Some(previous) = self.mapper.as_mut() {
            self.small.unmap_all(previous);
            self.pages.unmap_all(previous);
            info!("kernel heap: previous layout torn down");
        }
        self.mapper = Some(mapper);
        self.small.init(region_start);
        self.pages.init(page_start, region_end);
        info!(
            "kernel heap: small blocks {region_start}..{small_end}, pages {page_start}..{region_end} ({page_region} pages)"
        );
        Ok(())
    }

    /// Allocate `size` bytes.
    ///
    /// `size == 0` returns the null address and changes nothing.
    ///
    /// # Errors
    /// [`HeapError::NotInitialized`] before [`init`](Self::init), else
    /// resource exhaustion, see [`HeapError`].
    pub fn kmalloc(&mut self, size: u64) -> Result<VirtualAddress, HeapError> {
        if size == 0 {
            return Ok(VirtualAddress::null());
        }
        let (mapper, small, pages) = self.parts().ok_or(HeapError::NotInitialized)?;
        if size <= MAX_BLOCK_SIZE {
            small.alloc(mapper, size)
        } else {
            pages.alloc(mapper, size)
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.mapper.is_some()
    }

    /// Release the allocation at `va`. The null address is ignored.
    ///
    /// # Panics
    /// If `va` lies outside the heap (every address does before
    /// [`init`](Self::init)), or the small-block allocator rejects it.
    pub fn kfree(&mut self, va: VirtualAddress) {
        if va.is_null() {
            return;
        }
        let owner = self.owner(va);
        if let Some((mapper, small, pages)) = self.parts() {
            match owner {
                Owner::SmallBlock => small.free(mapper, va),
                Owner::PageRange => pages.free(mapper, va),
            }
        }
    }

    /// Resize the allocation at `va` to `new_size` bytes, preserving the first
    /// `min(old, new_size)` bytes.
    ///
    /// A null `va` allocates; a zero `new_size` frees and returns null.
    ///
    /// # Errors
    /// Resource exhaustion; the original allocation is then left intact.
    ///
    /// # Panics
    /// If `va` lies outside the heap or names no page-range allocation.
    pub fn krealloc(&mut self, va: VirtualAddress, new_size: u64) -> Result<VirtualAddress, HeapError> {
        if va.is_null() {
            return self.kmalloc(new_size);
        }
        if new_size == 0 {
            self.kfree(va);
            return Ok(VirtualAddress::null());
        }

        let to_small = new_size <= MAX_BLOCK_SIZE;
        let owner = self.owner(va);
        let (mapper, small, pages) = self.parts().ok_or(HeapError::NotInitialized)?;
        match owner {
            Owner::SmallBlock if to_small => small.realloc(mapper, va, new_size),
            Owner::SmallBlock => {
                let old_size = small.block_size(va);
                self.move_allocation(va, old_size, new_size)
            }
            Owner::PageRange => {
                let old_pages = mapper.allocation_extent(va);
                assert!(old_pages > 0, "krealloc of {va}: no recorded allocation");
                let new_pages = pages_for(new_size);
                if to_small || new_pages > old_pages {
                    self.move_allocation(va, old_pages * PAGE_SIZE, new_size)
                } else {
                    if new_pages < old_pages {
                        pages.shrink(mapper, va, new_pages);
                    }
                    Ok(va)
                }
            }
        }
    }

    /// Physical address backing `va`, if the heap owns and maps it.
    #[must_use]
    pub fn physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.owns(va) {
            return None;
        }
        self.mapper.as_ref()?.translate(va)
    }

    /// Heap virtual address mapped to `pa`, if any.
    #[must_use]
    pub fn virtual_address(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.mapper
            .as_ref()?
            .reverse_mapping(pa)
            .filter(|&page| self.owns(page))
            .map(|page| page.page_base() + pa.frame_offset())
    }

    /// Usable size of the allocation at `va`: the slot size for small blocks,
    /// the whole pages for page ranges.
    #[must_use]
    pub fn block_size(&self, va: VirtualAddress) -> Option<u64> {
        if !self.owns(va) {
            return None;
        }
        let size = if self.small.contains(va) {
            self.small.block_size(va)
        } else {
            self.mapper.as_ref()?.allocation_extent(va) * PAGE_SIZE
        };
        (size > 0).then_some(size)
    }

    #[must_use]
    pub const fn strategy(&self) -> PlacementStrategy {
        self.pages.strategy()
    }

    pub const fn set_strategy(&mut self, strategy: PlacementStrategy) {
        self.pages.set_strategy(strategy);
    }

    /// Free extents of the page region in address order.
    pub fn free_extents(&self) -> impl Iterator<Item = Extent> + '_ {
        self.pages.extents().iter_by_address()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let extents = self.pages.extents();
        HeapStats {
            brk: self.pages.brk(),
            free_extents: extents.len(),
            free_extent_pages: extents.total_pages(),
            assigned_small_pages: self.small.assigned_pages(),
            free_slots: core::array::from_fn(|class| self.small.free_slots(class)),
        }
    }

    /// Verify the bookkeeping of both allocators.
    ///
    /// # Errors
    /// A static description of the first inconsistency.
    pub fn check_consistency(&self) -> Result<(), &'static str> {
        self.small.verify()?;
        self.pages.verify()
    }

    /// Start of the page region.
    #[must_use]
    pub const fn page_region_start(&self) -> VirtualAddress {
        self.pages.start()
    }

    /// The mapper handed to [`init`](Self::init).
    #[must_use]
    pub const fn mapper(&self) -> Option<&M> {
        self.mapper.as_ref()
    }

    pub const fn mapper_mut(&mut self) -> Option<&mut M> {
        self.mapper.as_mut()
    }

    fn parts(&mut self) -> Option<(&mut M, &mut SmallBlockAllocator<SMALL_PAGES>, &mut PageRangeAllocator<EXTENTS>)> {
        let mapper = self.mapper.as_mut()?;
        Some((mapper, &mut self.small, &mut self.pages))
    }

    fn owns(&self, va: VirtualAddress) -> bool {
        self.is_initialized() && (self.small.contains(va) || self.pages.contains(va))
    }

    fn owner(&self, va: VirtualAddress) -> Owner {
        assert!(self.owns(va), "{va} is not a kernel heap address");
        if self.small.contains(va) {
            Owner::SmallBlock
        } else {
            Owner::PageRange
        }
    }

    /// Allocate in the class of `new_size`, copy, release `va`.
    fn move_allocation(
        &mut self,
        va: VirtualAddress,
        old_size: u64,
        new_size: u64,
    ) -> Result<VirtualAddress, HeapError> {
        let moved = self.kmalloc(new_size)?;
        // SAFETY: both allocations are live and mapped for at least this many
        // bytes, and a fresh allocation never overlaps a live one.
        unsafe { copy_bytes(moved, va, old_size.min(new_size)) };
        self.kfree(va);
        Ok(moved)
    }
}

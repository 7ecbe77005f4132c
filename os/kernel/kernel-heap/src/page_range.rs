//! # Page-Range Allocator
//!
//! Serves requests larger than [`MAX_BLOCK_SIZE`](crate::config::MAX_BLOCK_SIZE)
//! in whole pages from the page region `[start, ceiling)`.
//!
//! ```text
//!  start                          break                      ceiling
//!    ┌──────┬░░░░░░┬──────┬░░░░░░░░┬──────────────────────────┐
//!    │ used │ free │ used │  free  │ used │     untouched      │
//!    └──────┴░░░░░░┴──────┴░░░░░░░░┴──────┴────────────────────┘
//!           └ extent ┘    └ extent ┘
//! ```
//!
//! Free runs below the break are tracked in the [`ExtentIndex`]. A request is
//! served from an extent (exact fit first, then worst fit) and only grows the
//! break when no extent is large enough. Freed runs are coalesced with their
//! address neighbours immediately; a run that ends up touching the break is
//! handed back by lowering the break instead of being tracked.
//!
//! Pages are always mapped *before* any bookkeeping changes, so a mapping
//! failure leaves the allocator exactly as it was.

use crate::addresses::{VirtualAddress, pages_for};
use crate::config::PAGE_SIZE;
use crate::error::HeapError;
use crate::extent_index::{Extent, ExtentHandle, ExtentIndex};
use crate::mapper::{FrameMetadata, PageMapper, back_pages, release_pages};
use core::iter::once;
use log::{debug, warn};

/// How a page-range request picks its free extent.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PlacementStrategy {
    /// Exact fit, then worst fit, through the size tree.
    #[default]
    IndexedFit,
    /// Exact fit, then worst fit, by walking the shadow list.
    ListScan,
}

/// The page-range allocator with room for `EXTENTS` free extents.
pub struct PageRangeAllocator<const EXTENTS: usize> {
    start: VirtualAddress,
    brk: VirtualAddress,
    ceiling: VirtualAddress,
    extents: ExtentIndex<EXTENTS>,
    strategy: PlacementStrategy,
}

impl<const EXTENTS: usize> Default for PageRangeAllocator<EXTENTS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const EXTENTS: usize> PageRangeAllocator<EXTENTS> {
    /// An allocator over an empty region; call [`init`](Self::init) before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start: VirtualAddress::null(),
            brk: VirtualAddress::null(),
            ceiling: VirtualAddress::null(),
            extents: ExtentIndex::new(),
            strategy: PlacementStrategy::IndexedFit,
        }
    }

    /// Take over `[start, ceiling)` with the break at `start` and no extents.
    pub fn init(&mut self, start: VirtualAddress, ceiling: VirtualAddress) {
        debug_assert!(start.is_page_aligned() && ceiling.is_page_aligned());
        debug_assert!(start <= ceiling);
        self.start = start;
        self.brk = start;
        self.ceiling = ceiling;
        self.extents.clear();
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Current top of the allocated part of the region.
    #[inline]
    #[must_use]
    pub const fn brk(&self) -> VirtualAddress {
        self.brk
    }

    #[inline]
    #[must_use]
    pub const fn ceiling(&self) -> VirtualAddress {
        self.ceiling
    }

    #[inline]
    #[must_use]
    pub const fn strategy(&self) -> PlacementStrategy {
        self.strategy
    }

    pub const fn set_strategy(&mut self, strategy: PlacementStrategy) {
        self.strategy = strategy;
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.start && va < self.ceiling
    }

    #[inline]
    #[must_use]
    pub const fn extents(&self) -> &ExtentIndex<EXTENTS> {
        &self.extents
    }

    /// Allocate `pages_for(size)` mapped pages.
    ///
    /// # Errors
    /// - [`HeapError::OutOfFrames`] if backing a page failed; nothing changed.
    /// - [`HeapError::AddressSpaceExhausted`] if no extent fits and the break
    ///   cannot grow far enough.
    pub fn alloc<M>(&mut self, mapper: &mut M, size: u64) -> Result<VirtualAddress, HeapError>
    where
        M: PageMapper + FrameMetadata,
    {
        let pages = pages_for(size);
        if pages == 0 {
            return Ok(VirtualAddress::null());
        }

        if let Some(h) = self.find_fit(pages) {
            return self.alloc_from_extent(mapper, h, pages);
        }

        let available = (self.ceiling - self.brk) / PAGE_SIZE;
        if pages > available {
            warn!("page region exhausted: {pages} pages requested, {available} left above the break");
            return Err(HeapError::AddressSpaceExhausted { pages });
        }

        let start = self.brk;
        back_pages(mapper, start, pages).inspect_err(|_| {
            warn!("out of frames extending the break by {pages} pages");
        })?;
        mapper.record_allocation_extent(start, pages);
        self.brk = start.add_pages(pages);
        debug!("break raised to {} for {pages} pages at {start}", self.brk);
        Ok(start)
    }

    /// Release the allocation starting at `va`.
    ///
    /// An address with no recorded extent is ignored. This includes
    /// addresses that are not page aligned or not below the break.
    pub fn free<M>(&mut self, mapper: &mut M, va: VirtualAddress)
    where
        M: PageMapper + FrameMetadata,
    {
        let pages = if va.is_page_aligned() && va >= self.start && va < self.brk {
            mapper.allocation_extent(va)
        } else {
            0
        };
        if pages == 0 {
            warn!("free of {va}: no recorded allocation, ignored");
            return;
        }

        release_pages(mapper, va, pages);
        mapper.record_allocation_extent(va, 0);
        debug!("freed {pages} pages at {va}");
        self.free_range(Extent::new(va, pages));
    }

    /// Shrink the allocation at `va` to `pages` pages, returning the trailing
    /// pages to the free extents.
    ///
    /// # Panics
    /// If `pages` is zero or not smaller than the current allocation.
    pub fn shrink<M>(&mut self, mapper: &mut M, va: VirtualAddress, pages: u64)
    where
        M: PageMapper + FrameMetadata,
    {
        let old = mapper.allocation_extent(va);
        assert!(pages > 0 && pages < old, "shrink of {va} from {old} to {pages} pages");

        let tail = Extent::new(va.add_pages(pages), old - pages);
        release_pages(mapper, tail.start, tail.pages);
        mapper.record_allocation_extent(va, pages);
        debug!("shrunk {va} from {old} to {pages} pages");
        self.free_range(tail);
    }

    /// Unmap every live allocation, forget its recorded extent and drop all
    /// free extents. The break returns to the start of the region.
    pub fn unmap_all<M>(&mut self, mapper: &mut M)
    where
        M: PageMapper + FrameMetadata,
    {
        let mut va = self.start;
        let top = Extent::new(self.brk, 0);
        for free in self.extents.iter_by_address().chain(once(top)) {
            while va < free.start {
                let pages = mapper.allocation_extent(va);
                if pages == 0 {
                    warn!("no recorded allocation at {va} below the break");
                    break;
                }
                release_pages(mapper, va, pages);
                mapper.record_allocation_extent(va, 0);
                va = va.add_pages(pages);
            }
            va = free.end();
        }
        debug!("page region {}..{} torn down", self.start, self.brk);
        self.brk = self.start;
        self.extents.clear();
    }

    /// Verify the extent index and that every extent lies below the break
    /// without touching it.
    ///
    /// # Errors
    /// A static description of the first inconsistency.
    pub fn verify(&self) -> Result<(), &'static str> {
        self.extents.verify()?;
        for extent in self.extents.iter_by_address() {
            if extent.start < self.start || extent.end() > self.brk {
                return Err("free extent outside [start, break)");
            }
            if extent.end() == self.brk {
                return Err("free extent touches the break");
            }
        }
        if self.brk > self.ceiling {
            return Err("break above the ceiling");
        }
        Ok(())
    }

    fn find_fit(&self, pages: u64) -> Option<ExtentHandle> {
        match self.strategy {
            PlacementStrategy::IndexedFit => self
                .extents
                .find_exact(pages)
                .or_else(|| self.extents.find_worst(pages)),
            PlacementStrategy::ListScan => self
                .extents
                .scan_exact(pages)
                .or_else(|| self.extents.scan_worst(pages)),
        }
    }

    fn alloc_from_extent<M>(
        &mut self,
        mapper: &mut M,
        h: ExtentHandle,
        pages: u64,
    ) -> Result<VirtualAddress, HeapError>
    where
        M: PageMapper + FrameMetadata,
    {
        let extent = self.extents.get(h);
        back_pages(mapper, extent.start, pages).inspect_err(|_| {
            warn!("out of frames reusing {extent:?} for {pages} pages");
        })?;

        if extent.pages > pages {
            let rest = Extent::new(extent.start.add_pages(pages), extent.pages - pages);
            self.extents.update(h, rest);
            debug!("split {extent:?} for {pages} pages, {rest:?} left");
        } else {
            self.extents.remove(h);
            debug!("reused {extent:?}");
        }
        mapper.record_allocation_extent(extent.start, pages);
        Ok(extent.start)
    }

    /// Coalesce `freed` with its neighbours, then either track the result
    /// or lower the break.
    fn free_range(&mut self, freed: Extent) {
        let predecessor = self
            .extents
            .find_predecessor(freed.start)
            .filter(|&h| self.extents.get(h).precedes(&freed));
        let successor = self
            .extents
            .find_successor(freed.start)
            .filter(|&h| freed.precedes(&self.extents.get(h)));

        let merged = match (predecessor, successor) {
            (Some(p), Some(s)) => {
                let before = self.extents.remove(p);
                let after = self.extents.remove(s);
                Extent::new(before.start, before.pages + freed.pages + after.pages)
            }
            (Some(p), None) => {
                let before = self.extents.remove(p);
                Extent::new(before.start, before.pages + freed.pages)
            }
            (None, Some(s)) => {
                let after = self.extents.remove(s);
                Extent::new(freed.start, freed.pages + after.pages)
            }
            (None, None) => freed,
        };
        if merged != freed {
            debug!("coalesced {freed:?} into {merged:?}");
        }

        if merged.end() == self.brk {
            self.brk = merged.start;
            debug!("break lowered to {}", self.brk);
        } else {
            debug_assert!(merged.end() < self.brk);
            self.extents.insert(merged);
        }
    }
}

//! # Small-Block Allocator
//!
//! Power-of-two slab allocator for requests of up to
//! [`MAX_BLOCK_SIZE`](crate::config::MAX_BLOCK_SIZE) bytes.
//!
//! The small-block region is a fixed run of `PAGES` pages. Every page is
//! either *unassigned* (sitting in a FIFO pool, unmapped) or dedicated to one
//! size class and carved into equally sized slots:
//!
//! ```text
//!  page (class 64)      slot0    slot1    slot2         slot63
//!                     ┌────────┬────────┬────────┬ ... ┬────────┐
//!                     │ links  │  used  │ links  │     │ links  │
//!                     └───┬────┴────────┴───┬────┴ ... ┴───┬────┘
//!  free list [64] ────────┴─────────────────┴──────────────┘
//! ```
//!
//! Free slots form one doubly linked list per size class. The links are two
//! `u32` region offsets stored in the first 8 bytes of the free slot itself,
//! which is why the smallest class is 8 bytes. Releasing a page can then
//! unlink its slots one by one instead of scanning the whole list.
//!
//! ## Allocation order
//! 1. Pop a slot from the request's own class.
//! 2. Assign an unassigned page to the class, carve it, pop its first slot.
//! 3. Pop a slot from the next larger non-empty class, **without** splitting.
//!    The slot keeps its larger class; `free` reads the class from the page
//!    descriptor, so it goes back to the right list.
//!
//! ## Safety
//! Only the link words of *free* slots are ever touched, and only while the
//! page is mapped. All raw memory access goes through [`SmallBlockAllocator::links`]
//! and [`SmallBlockAllocator::set_links`].

use crate::addresses::{VirtualAddress, copy_bytes};
use crate::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SHIFT, MIN_BLOCK_SIZE, PAGE_SHIFT, PAGE_SIZE, SIZE_CLASSES};
use crate::error::{HeapError, MapError};
use crate::mapper::{FrameMetadata, PageMapper, back_page};
use bitfield_struct::bitfield;
use log::{debug, trace, warn};

const NIL: u32 = u32::MAX;

/// Index of the size class serving `size` bytes (`size > 0`).
#[inline]
#[must_use]
pub const fn class_index(size: u64) -> usize {
    let size = if size < MIN_BLOCK_SIZE { MIN_BLOCK_SIZE } else { size };
    (size.next_power_of_two().trailing_zeros() - MIN_BLOCK_SHIFT) as usize
}

/// Slot size of size class `class`.
#[inline]
#[must_use]
pub const fn class_size(class: usize) -> u64 {
    MIN_BLOCK_SIZE << class
}

/// Bookkeeping for one page of the small-block region.
#[bitfield(u64)]
struct PageDescriptor {
    /// log2 of the slot size; `0` while the page is unassigned.
    #[bits(4)]
    block_shift: u8,

    /// Free slots currently in this page.
    #[bits(12)]
    free_slots: u16,

    #[bits(16)]
    __reserved: u16,

    /// Next page in the unassigned pool.
    pool_next: u32,
}

impl PageDescriptor {
    const UNASSIGNED: Self = Self::new().with_pool_next(NIL);

    const fn is_assigned(self) -> bool {
        self.block_shift() != 0
    }

    const fn block_size(self) -> u64 {
        if self.is_assigned() {
            1 << self.block_shift()
        } else {
            0
        }
    }

    const fn total_slots(self) -> u16 {
        (PAGE_SIZE >> self.block_shift()) as u16
    }
}

/// Link words stored at the start of every free slot.
#[repr(C)]
#[derive(Copy, Clone)]
struct SlotLinks {
    prev: u32,
    next: u32,
}

#[derive(Copy, Clone)]
struct FreeSlotList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeSlotList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

/// The small-block allocator over a region of `PAGES` pages.
pub struct SmallBlockAllocator<const PAGES: usize> {
    base: VirtualAddress,
    pages: [PageDescriptor; PAGES],
    pool_head: u32,
    pool_tail: u32,
    pool_len: usize,
    lists: [FreeSlotList; SIZE_CLASSES],
}

impl<const PAGES: usize> Default for SmallBlockAllocator<PAGES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGES: usize> SmallBlockAllocator<PAGES> {
    const REGION_FITS: () = assert!(
        (PAGES as u64) * PAGE_SIZE < NIL as u64,
        "small-block region too large for u32 slot offsets"
    );

    /// Size of the small-block region in bytes.
    pub const REGION_SIZE: u64 = PAGES as u64 * PAGE_SIZE;

    /// An allocator with no region; call [`init`](Self::init) before use.
    #[must_use]
    pub const fn new() -> Self {
        let () = Self::REGION_FITS;
        Self {
            base: VirtualAddress::null(),
            pages: [PageDescriptor::UNASSIGNED; PAGES],
            pool_head: NIL,
            pool_tail: NIL,
            pool_len: 0,
            lists: [FreeSlotList::EMPTY; SIZE_CLASSES],
        }
    }

    /// Take over `[base, base + REGION_SIZE)`. Every page starts unassigned.
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(&mut self, base: VirtualAddress) {
        debug_assert!(base.is_page_aligned());
        self.base = base;
        self.lists = [FreeSlotList::EMPTY; SIZE_CLASSES];
        self.pool_head = NIL;
        self.pool_tail = NIL;
        self.pool_len = 0;
        for page in 0..PAGES {
            self.pages[page] = PageDescriptor::UNASSIGNED;
            self.pool_push_back(page as u32);
        }
    }

    /// Unmap every assigned page. The allocator must be re-initialized
    /// before it is used again.
    pub fn unmap_all<M>(&mut self, mapper: &mut M)
    where
        M: PageMapper + FrameMetadata,
    {
        for (page, descriptor) in self.pages.iter_mut().enumerate() {
            if descriptor.is_assigned() {
                mapper.unmap_page(self.base.add_pages(page as u64));
                *descriptor = PageDescriptor::UNASSIGNED;
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.base && va < self.base + Self::REGION_SIZE
    }

    /// Slot size of the block at `va`, or `0` if its page is unassigned.
    ///
    /// # Panics
    /// If `va` lies outside the small-block region.
    #[must_use]
    pub fn block_size(&self, va: VirtualAddress) -> u64 {
        self.descriptor(va).block_size()
    }

    /// Pages currently dedicated to a size class.
    #[must_use]
    pub const fn assigned_pages(&self) -> usize {
        PAGES - self.pool_len
    }

    /// Free slots waiting in the list of size class `class`.
    #[must_use]
    pub const fn free_slots(&self, class: usize) -> usize {
        self.lists[class].len
    }

    /// Allocate a slot for `size` bytes (`size <= MAX_BLOCK_SIZE`).
    ///
    /// `size == 0` yields the null address without touching any state.
    ///
    /// # Errors
    /// - [`HeapError::OutOfFrames`] if a fresh page could not be mapped and
    ///   no larger slot was free.
    /// - [`HeapError::SlotsExhausted`] if the region has no page left and no
    ///   larger slot was free.
    ///
    /// # Panics
    /// If `size` exceeds [`MAX_BLOCK_SIZE`].
    pub fn alloc<M>(&mut self, mapper: &mut M, size: u64) -> Result<VirtualAddress, HeapError>
    where
        M: PageMapper + FrameMetadata,
    {
        if size == 0 {
            return Ok(VirtualAddress::null());
        }
        assert!(size <= MAX_BLOCK_SIZE, "small-block request of {size} bytes");

        let class = class_index(size);
        if let Some(slot) = self.pop_slot(class) {
            trace!("small block {slot} ({} B) for {size} B", class_size(class));
            return Ok(slot);
        }

        let mut out_of_frames = false;
        if let Some(page) = self.pool_pop_front() {
            match self.assign_page(mapper, page, class) {
                Ok(()) => {
                    if let Some(slot) = self.pop_slot(class) {
                        trace!("small block {slot} ({} B) from a fresh page", class_size(class));
                        return Ok(slot);
                    }
                }
                Err(MapError::OutOfFrames) => {
                    warn!("no frame for small-block page {page}, trying larger classes");
                    self.pool_push_front(page);
                    out_of_frames = true;
                }
            }
        }

        for larger in class + 1..SIZE_CLASSES {
            if let Some(slot) = self.pop_slot(larger) {
                debug!(
                    "small block {slot}: serving {size} B from the {} B class",
                    class_size(larger)
                );
                return Ok(slot);
            }
        }

        warn!("small-block allocation of {size} B failed");
        if out_of_frames {
            Err(HeapError::OutOfFrames)
        } else {
            Err(HeapError::SlotsExhausted { size })
        }
    }

    /// Return the slot at `va` to its size class. A page whose slots are all
    /// free again is unmapped and goes back to the unassigned pool.
    ///
    /// # Panics
    /// If `va` is outside the region, in an unassigned page, not at a slot
    /// boundary, or its page has no slot left to free (double free).
    pub fn free<M>(&mut self, mapper: &mut M, va: VirtualAddress)
    where
        M: PageMapper + FrameMetadata,
    {
        let page = self.page_index(va);
        let descriptor = self.pages[page];
        assert!(descriptor.is_assigned(), "free of {va} in an unassigned small-block page");
        let size = descriptor.block_size();
        assert!(va.page_offset() % size == 0, "free of {va}: not a {size} B slot boundary");
        assert!(
            descriptor.free_slots() < descriptor.total_slots(),
            "double free of small block {va}"
        );

        let class = class_index(size);
        let offset = self.offset_of(va);
        debug_assert!(!self.is_listed(class, offset), "double free of small block {va}");
        self.push_front(class, offset);
        let free = descriptor.free_slots() + 1;
        self.pages[page] = descriptor.with_free_slots(free);
        trace!("freed small block {va} ({size} B)");

        if free == descriptor.total_slots() {
            self.release_page(mapper, page, class);
        }
    }

    /// Resize the block at `va` to `new_size` bytes (`new_size <= MAX_BLOCK_SIZE`).
    ///
    /// Stays in place when the new size maps to the block's current class.
    /// Otherwise the contents move to a new slot; on failure the original
    /// block is left untouched.
    ///
    /// # Errors
    /// See [`alloc`](Self::alloc).
    pub fn realloc<M>(
        &mut self,
        mapper: &mut M,
        va: VirtualAddress,
        new_size: u64,
    ) -> Result<VirtualAddress, HeapError>
    where
        M: PageMapper + FrameMetadata,
    {
        if va.is_null() {
            return self.alloc(mapper, new_size);
        }
        if new_size == 0 {
            self.free(mapper, va);
            return Ok(VirtualAddress::null());
        }

        let old_size = self.block_size(va);
        if class_size(class_index(new_size)) == old_size {
            return Ok(va);
        }

        let moved = self.alloc(mapper, new_size)?;
        // SAFETY: both slots are live, mapped and disjoint.
        unsafe { copy_bytes(moved, va, old_size.min(new_size)) };
        self.free(mapper, va);
        Ok(moved)
    }

    /// Check that the per-page free counters agree with the free lists.
    ///
    /// # Errors
    /// A static description of the first inconsistency.
    pub fn verify(&self) -> Result<(), &'static str> {
        let mut per_class = [0_usize; SIZE_CLASSES];
        let mut assigned = 0;
        for descriptor in &self.pages {
            if descriptor.is_assigned() {
                assigned += 1;
                per_class[class_index(descriptor.block_size())] += usize::from(descriptor.free_slots());
            }
        }
        if assigned != self.assigned_pages() {
            return Err("unassigned pool size disagrees with page descriptors");
        }
        for (class, list) in self.lists.iter().enumerate() {
            if per_class[class] != list.len {
                return Err("free list length disagrees with page descriptors");
            }
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn assign_page<M>(&mut self, mapper: &mut M, page: u32, class: usize) -> Result<(), MapError>
    where
        M: PageMapper + FrameMetadata,
    {
        let page_va = self.base.add_pages(u64::from(page));
        back_page(mapper, page_va)?;

        let size = class_size(class);
        let descriptor = PageDescriptor::UNASSIGNED
            .with_block_shift((MIN_BLOCK_SHIFT as usize + class) as u8)
            .with_free_slots((PAGE_SIZE / size) as u16);
        self.pages[page as usize] = descriptor;

        let first = page << PAGE_SHIFT;
        for slot in 0..u32::from(descriptor.total_slots()) {
            self.push_back(class, first + slot * size as u32);
        }
        debug!("small-block page {page_va} assigned to the {size} B class");
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn release_page<M>(&mut self, mapper: &mut M, page: usize, class: usize)
    where
        M: PageMapper + FrameMetadata,
    {
        let size = class_size(class) as u32;
        let first = (page as u32) << PAGE_SHIFT;
        for slot in 0..u32::from(self.pages[page].total_slots()) {
            self.unlink(class, first + slot * size);
        }
        self.pages[page] = PageDescriptor::UNASSIGNED;
        self.pool_push_back(page as u32);

        let page_va = self.base.add_pages(page as u64);
        mapper.unmap_page(page_va);
        debug!("small-block page {page_va} returned to the pool");
    }

    fn pop_slot(&mut self, class: usize) -> Option<VirtualAddress> {
        let offset = self.lists[class].head;
        if offset == NIL {
            return None;
        }
        self.unlink(class, offset);
        let page = (offset >> PAGE_SHIFT) as usize;
        let descriptor = self.pages[page];
        self.pages[page] = descriptor.with_free_slots(descriptor.free_slots() - 1);
        Some(self.base + u64::from(offset))
    }

    fn push_front(&mut self, class: usize, offset: u32) {
        let head = self.lists[class].head;
        self.set_links(offset, SlotLinks { prev: NIL, next: head });
        if head == NIL {
            self.lists[class].tail = offset;
        } else {
            let links = self.links(head);
            self.set_links(head, SlotLinks { prev: offset, ..links });
        }
        self.lists[class].head = offset;
        self.lists[class].len += 1;
    }

    fn push_back(&mut self, class: usize, offset: u32) {
        let tail = self.lists[class].tail;
        self.set_links(offset, SlotLinks { prev: tail, next: NIL });
        if tail == NIL {
            self.lists[class].head = offset;
        } else {
            let links = self.links(tail);
            self.set_links(tail, SlotLinks { next: offset, ..links });
        }
        self.lists[class].tail = offset;
        self.lists[class].len += 1;
    }

    fn unlink(&mut self, class: usize, offset: u32) {
        let SlotLinks { prev, next } = self.links(offset);
        if prev == NIL {
            self.lists[class].head = next;
        } else {
            let links = self.links(prev);
            self.set_links(prev, SlotLinks { next, ..links });
        }
        if next == NIL {
            self.lists[class].tail = prev;
        } else {
            let links = self.links(next);
            self.set_links(next, SlotLinks { prev, ..links });
        }
        self.lists[class].len -= 1;
    }

    /// Walk the free list of `class` looking for `offset`.
    fn is_listed(&self, class: usize, offset: u32) -> bool {
        let mut current = self.lists[class].head;
        while current != NIL {
            if current == offset {
                return true;
            }
            current = self.links(current).next;
        }
        false
    }

    fn pool_pop_front(&mut self) -> Option<u32> {
        let page = self.pool_head;
        if page == NIL {
            return None;
        }
        self.pool_head = self.pages[page as usize].pool_next();
        if self.pool_head == NIL {
            self.pool_tail = NIL;
        }
        self.pages[page as usize].set_pool_next(NIL);
        self.pool_len -= 1;
        Some(page)
    }

    fn pool_push_front(&mut self, page: u32) {
        self.pages[page as usize].set_pool_next(self.pool_head);
        if self.pool_head == NIL {
            self.pool_tail = page;
        }
        self.pool_head = page;
        self.pool_len += 1;
    }

    fn pool_push_back(&mut self, page: u32) {
        self.pages[page as usize].set_pool_next(NIL);
        if self.pool_tail == NIL {
            self.pool_head = page;
        } else {
            self.pages[self.pool_tail as usize].set_pool_next(page);
        }
        self.pool_tail = page;
        self.pool_len += 1;
    }

    fn descriptor(&self, va: VirtualAddress) -> PageDescriptor {
        self.pages[self.page_index(va)]
    }

    fn page_index(&self, va: VirtualAddress) -> usize {
        assert!(self.contains(va), "{va} is outside the small-block region");
        (self.offset_of(va) >> PAGE_SHIFT) as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    fn offset_of(&self, va: VirtualAddress) -> u32 {
        (va - self.base) as u32
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn slot_ptr(&self, offset: u32) -> *mut SlotLinks {
        (self.base + u64::from(offset)).as_mut_ptr().cast::<SlotLinks>()
    }

    fn links(&self, offset: u32) -> SlotLinks {
        // SAFETY: `offset` is a free slot of an assigned (mapped) page; slots
        // are at least 8 bytes and aligned to their size.
        unsafe { self.slot_ptr(offset).read() }
    }

    fn set_links(&mut self, offset: u32, links: SlotLinks) {
        // SAFETY: see `links`; the slot is free, so nobody else owns its bytes.
        unsafe { self.slot_ptr(offset).write(links) }
    }
}

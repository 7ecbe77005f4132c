//! Host-side stand-ins for the memory manager the heap runs against.

#![allow(dead_code)]

use kernel_heap::config::{GUARD_PAGES, PAGE_SIZE};
use kernel_heap::{FrameMetadata, KernelHeap, MapError, PageMapper, PhysicalAddress, VirtualAddress};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const SMALL_PAGES: usize = 16;
pub const EXTENTS: usize = 64;

pub type TestHeap = KernelHeap<SimulatedMmu, EXTENTS, SMALL_PAGES>;

const FIRST_FRAME: u64 = 0x4000_0000;

/// Live pages and recorded extents of one [`SimulatedMmu`], still readable
/// after the mapper itself has been dropped.
#[derive(Default)]
pub struct Tally {
    pub pages: AtomicUsize,
    pub extents: AtomicUsize,
}

impl Tally {
    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::Relaxed)
    }

    pub fn extents(&self) -> usize {
        self.extents.load(Ordering::Relaxed)
    }
}

/// Page tables, frame pool and frame metadata in plain hash maps.
///
/// The virtual pages are real host memory (see [`TestRegion`]), so
/// "mapping" only does the bookkeeping.
#[derive(Default)]
pub struct SimulatedMmu {
    pages: HashMap<u64, u64>,
    frame_owner: HashMap<u64, u64>,
    extents: HashMap<u64, u64>,
    free_frames: Vec<u64>,
    next_frame: u64,
    /// Maximum number of simultaneously mapped pages.
    pub frame_budget: Option<usize>,
    /// Fail the n-th `map_page` call from now (0 = the next one).
    pub fail_map_in: Option<usize>,
    pub map_calls: usize,
    tally: Arc<Tally>,
}

impl SimulatedMmu {
    pub fn new() -> Self {
        Self {
            next_frame: FIRST_FRAME,
            ..Self::default()
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.pages.contains_key(&va.page_base().as_u64())
    }

    pub fn recorded_extents(&self) -> usize {
        self.extents.len()
    }

    pub fn tally(&self) -> Arc<Tally> {
        Arc::clone(&self.tally)
    }
}

impl PageMapper for SimulatedMmu {
    fn map_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        assert!(va.is_page_aligned(), "map of unaligned {va}");
        assert!(!self.is_mapped(va), "{va} mapped twice");
        self.map_calls += 1;

        if let Some(n) = self.fail_map_in {
            if n == 0 {
                self.fail_map_in = None;
                return Err(MapError::OutOfFrames);
            }
            self.fail_map_in = Some(n - 1);
        }
        if self.frame_budget.is_some_and(|b| self.pages.len() >= b) {
            return Err(MapError::OutOfFrames);
        }

        let frame = self.free_frames.pop().unwrap_or_else(|| {
            let frame = self.next_frame;
            self.next_frame += PAGE_SIZE;
            frame
        });
        self.pages.insert(va.as_u64(), frame);
        self.tally.pages.fetch_add(1, Ordering::Relaxed);
        Ok(PhysicalAddress::new(frame))
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        let frame = self
            .pages
            .remove(&va.as_u64())
            .unwrap_or_else(|| panic!("unmap of unmapped {va}"));
        self.frame_owner.remove(&frame);
        self.free_frames.push(frame);
        self.tally.pages.fetch_sub(1, Ordering::Relaxed);
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.pages
            .get(&va.page_base().as_u64())
            .map(|&frame| PhysicalAddress::new(frame + va.page_offset()))
    }
}

impl FrameMetadata for SimulatedMmu {
    fn record_allocation_extent(&mut self, va: VirtualAddress, pages: u64) {
        if pages == 0 {
            if self.extents.remove(&va.as_u64()).is_some() {
                self.tally.extents.fetch_sub(1, Ordering::Relaxed);
            }
        } else if self.extents.insert(va.as_u64(), pages).is_none() {
            self.tally.extents.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn allocation_extent(&self, va: VirtualAddress) -> u64 {
        self.extents.get(&va.as_u64()).copied().unwrap_or(0)
    }

    fn record_reverse_mapping(&mut self, va: VirtualAddress) {
        let frame = self.pages[&va.page_base().as_u64()];
        self.frame_owner.insert(frame, va.page_base().as_u64());
    }

    fn reverse_mapping(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.frame_owner
            .get(&pa.frame_base().as_u64())
            .map(|&va| VirtualAddress::new(va))
    }
}

/// Page-aligned host memory standing in for the heap's virtual range.
pub struct TestRegion {
    ptr: *mut u8,
    layout: Layout,
}

// The region is only handed out as addresses; the heap serializes access.
unsafe impl Send for TestRegion {}
unsafe impl Sync for TestRegion {}

impl TestRegion {
    pub fn new(pages: u64) -> Self {
        let layout = Layout::from_size_align((pages * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn start(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.ptr)
    }

    pub fn end(&self) -> VirtualAddress {
        self.start() + self.layout.size() as u64
    }
}

impl Drop for TestRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A heap over a fresh region with `page_region` pages of page region.
pub struct Fixture {
    pub heap: TestHeap,
    pub region: TestRegion,
}

impl Fixture {
    pub fn new(page_region: u64) -> Self {
        let region = TestRegion::new(SMALL_PAGES as u64 + GUARD_PAGES + page_region);
        let heap = TestHeap::new(SimulatedMmu::new(), region.start(), region.end()).unwrap();
        Self { heap, region }
    }

    pub fn small_start(&self) -> VirtualAddress {
        self.region.start()
    }

    pub fn page_start(&self) -> VirtualAddress {
        self.heap.page_region_start()
    }

    /// Free extents as `(first page index, pages)` relative to the page region.
    pub fn extents(&self) -> Vec<(u64, u64)> {
        let base = self.page_start();
        self.heap
            .free_extents()
            .map(|e| ((e.start - base) / PAGE_SIZE, e.pages))
            .collect()
    }

    /// Page index of `va` within the page region.
    pub fn page_of(&self, va: VirtualAddress) -> u64 {
        (va - self.page_start()) / PAGE_SIZE
    }

    pub fn assert_consistent(&self) {
        if let Err(e) = self.heap.check_consistency() {
            panic!("heap inconsistent: {e}");
        }
    }
}

/// Fill `len` bytes at `va` with a pattern derived from `seed`.
pub fn fill(va: VirtualAddress, len: u64, seed: u8) {
    let bytes = unsafe { std::slice::from_raw_parts_mut(va.as_mut_ptr(), len as usize) };
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8).wrapping_mul(31);
    }
}

/// `true` if the first `len` bytes at `va` still hold the pattern of `seed`.
pub fn holds(va: VirtualAddress, len: u64, seed: u8) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(va.as_mut_ptr(), len as usize) };
    bytes
        .iter()
        .enumerate()
        .all(|(i, &b)| b == seed.wrapping_add(i as u8).wrapping_mul(31))
}

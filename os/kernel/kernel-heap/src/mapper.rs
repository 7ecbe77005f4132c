//! # Frame-Mapping Collaborators
//!
//! The heap owns virtual address bookkeeping only. Physical frames, page-table
//! updates and the per-frame metadata used for reverse lookups belong to the
//! kernel's memory manager, which the heap reaches through these two traits.
//!
//! ```text
//!   KernelHeap ──► PageMapper     map / unmap / translate one 4 KiB page
//!              └─► FrameMetadata  allocation extents, reverse mappings
//! ```
//!
//! A kernel typically implements both on one type wrapping its VMM and frame
//! allocator; tests use a simulated MMU.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::error::MapError;

/// Page-table access for a single address space.
pub trait PageMapper {
    /// Back the page at `va` with a freshly obtained frame, mapped read-write.
    ///
    /// May block while waiting for physical memory.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame can be obtained.
    fn map_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError>;

    /// Tear down the mapping of the page at `va` and return its frame.
    fn unmap_page(&mut self, va: VirtualAddress);

    /// Walk the page tables for `va`; keeps the in-page offset.
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}

/// Per-frame and per-allocation metadata maintained by the memory manager.
pub trait FrameMetadata {
    /// Record that a page-range allocation of `pages` pages starts at `va`.
    /// Recording `0` clears the entry.
    fn record_allocation_extent(&mut self, va: VirtualAddress, pages: u64);

    /// Pages recorded for the allocation starting at `va` (`0` if none).
    fn allocation_extent(&self, va: VirtualAddress) -> u64;

    /// Remember `va` on the frame that currently backs it.
    fn record_reverse_mapping(&mut self, va: VirtualAddress);

    /// Page-aligned virtual address recorded on the frame containing `pa`.
    fn reverse_mapping(&self, pa: PhysicalAddress) -> Option<VirtualAddress>;
}

/// Map one page and publish its reverse mapping.
pub(crate) fn back_page<M>(mapper: &mut M, va: VirtualAddress) -> Result<(), MapError>
where
    M: PageMapper + FrameMetadata,
{
    mapper.map_page(va)?;
    mapper.record_reverse_mapping(va);
    Ok(())
}

/// Map `pages` consecutive pages from `start`.
///
/// On failure every page mapped by this call is unmapped again, so the
/// caller observes either all pages backed or none.
pub(crate) fn back_pages<M>(mapper: &mut M, start: VirtualAddress, pages: u64) -> Result<(), MapError>
where
    M: PageMapper + FrameMetadata,
{
    for i in 0..pages {
        if let Err(e) = back_page(mapper, start.add_pages(i)) {
            for j in 0..i {
                mapper.unmap_page(start.add_pages(j));
            }
            return Err(e);
        }
    }
    Ok(())
}

pub(crate) fn release_pages<M: PageMapper>(mapper: &mut M, start: VirtualAddress, pages: u64) {
    for i in 0..pages {
        mapper.unmap_page(start.add_pages(i));
    }
}

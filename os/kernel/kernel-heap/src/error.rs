//! # Heap Errors
//!
//! Only resource exhaustion is reported through these types. Invalid
//! arguments and broken invariants are kernel-consistency violations and
//! panic instead.

/// Failure reported by the [`PageMapper`](crate::PageMapper) collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("no physical frame available")]
    OutOfFrames,
}

/// Recoverable allocation failure. The caller's existing allocations stay valid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of physical memory")]
    OutOfFrames,
    #[error("no free extent and no room above the break for {pages} pages")]
    AddressSpaceExhausted { pages: u64 },
    #[error("no free slot for a {size} byte block")]
    SlotsExhausted { size: u64 },
    #[error("heap is not initialized")]
    NotInitialized,
}

/// Rejected heap region passed to `init`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("heap region bounds must be page aligned")]
    Unaligned,
    #[error("heap region too small: {needed} bytes needed, {available} available")]
    RegionTooSmall { needed: u64, available: u64 },
    #[error("page region of {pages} pages exceeds the extent capacity of {capacity}")]
    TooManyPages { pages: u64, capacity: usize },
}

impl From<MapError> for HeapError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfFrames => Self::OutOfFrames,
        }
    }
}

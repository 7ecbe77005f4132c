//! # Heap Layout Configuration

/// Size of one page (and of one small-block page) in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// log2 of the smallest small-block size class (8 bytes).
pub const MIN_BLOCK_SHIFT: u32 = 3;

/// log2 of the largest small-block size class (2 KiB).
pub const MAX_BLOCK_SHIFT: u32 = 11;

/// Smallest slot handed out by the small-block allocator.
pub const MIN_BLOCK_SIZE: u64 = 1 << MIN_BLOCK_SHIFT;

/// Requests up to and including this size go to the small-block allocator;
/// anything larger is served in whole pages.
pub const MAX_BLOCK_SIZE: u64 = 1 << MAX_BLOCK_SHIFT;

/// Number of power-of-two size classes between [`MIN_BLOCK_SIZE`] and [`MAX_BLOCK_SIZE`].
pub const SIZE_CLASSES: usize = (MAX_BLOCK_SHIFT - MIN_BLOCK_SHIFT + 1) as usize;

/// Unmapped pages separating the small-block region from the page region.
pub const GUARD_PAGES: u64 = 1;

/// Pages in the small-block region of the default kernel heap (32 MiB).
pub const DEFAULT_SMALL_PAGES: usize = 8192;

/// Free-extent records available to the page-range allocator of the default
/// kernel heap. Free extents are never adjacent, so this covers a page region
/// of up to twice as many pages.
pub const DEFAULT_EXTENT_CAPACITY: usize = 8192;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(MIN_BLOCK_SIZE >= 8, "slots must hold two u32 links");
    assert!(MAX_BLOCK_SIZE < PAGE_SIZE);
    assert!(PAGE_SIZE / MIN_BLOCK_SIZE < (1 << 12), "free-slot counter width");
    assert!(SIZE_CLASSES < 16, "size class index width");
};

//! # Kernel Heap
//!
//! Turns one fixed virtual address range into allocatable kernel memory,
//! serving two allocation regimes from the same range:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            LockedHeap / KernelHeap                  │
//! │    • kmalloc / kfree / krealloc                     │
//! │    • virtual ⇄ physical lookups                     │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │ size ≤ 2 KiB                 │ size > 2 KiB
//! ┌──────────▼───────────────┐   ┌──────────▼───────────────────┐
//! │  Small-Block Allocator   │   │    Page-Range Allocator      │
//! │  • 8 B … 2 KiB classes   │   │  • exact fit, then worst fit │
//! │  • per-class free lists  │   │  • break extension           │
//! │  • unassigned page pool  │   │  • coalescing on free        │
//! └──────────┬───────────────┘   └──────────┬───────────────────┘
//!            │                   ┌──────────▼───────────────────┐
//!            │                   │        Extent Index          │
//!            │                   │  • size tree, address tree   │
//!            │                   │  • shadow list               │
//!            │                   └──────────────────────────────┘
//! ┌──────────▼──────────────────────────────────────────────────┐
//! │          PageMapper + FrameMetadata (memory manager)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure model
//!
//! Running out of frames, extents or slots is reported as a [`HeapError`] and
//! never disturbs existing allocations. Passing an address the heap does not
//! own, freeing a slot twice, or finding the bookkeeping corrupted panics.
//!
//! ## Concurrency
//!
//! [`KernelHeap`] is a plain owned value. [`LockedHeap`] wraps it in a single
//! [`HeapLock`] and is what the kernel shares (and installs as
//! `#[global_allocator]`).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addresses;
pub mod config;
mod error;
pub mod extent_index;
mod heap;
mod locked;
mod mapper;
pub mod page_range;
pub mod small_block;
pub mod sync;

pub use addresses::{PhysicalAddress, VirtualAddress};
pub use error::{HeapError, InitError, MapError};
pub use extent_index::Extent;
pub use heap::{DefaultKernelHeap, HeapStats, KernelHeap};
pub use locked::LockedHeap;
pub use mapper::{FrameMetadata, PageMapper};
pub use page_range::PlacementStrategy;
pub use sync::{HeapLock, HeapLockGuard, Relax, Spin};

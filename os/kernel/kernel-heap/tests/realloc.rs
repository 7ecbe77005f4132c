mod support;

use kernel_heap::config::PAGE_SIZE;
use kernel_heap::{FrameMetadata, HeapError, VirtualAddress};
use support::{Fixture, fill, holds};

#[test]
fn contents_survive_every_class_transition() {
    let sizes = [1, 8, 9, 100, 2048, 2049, 4096, 5000, 12_000];
    let mut fx = Fixture::new(32);

    for (i, &old) in sizes.iter().enumerate() {
        for (j, &new) in sizes.iter().enumerate() {
            let seed = (i * sizes.len() + j) as u8;
            let a = fx.heap.kmalloc(old).unwrap();
            fill(a, old, seed);

            let b = fx.heap.krealloc(a, new).unwrap();
            assert!(holds(b, old.min(new), seed), "{old} -> {new}");
            assert!(fx.heap.block_size(b).unwrap() >= new);

            fx.heap.kfree(b);
            fx.assert_consistent();
        }
    }

    let stats = fx.heap.stats();
    assert_eq!(stats.brk, fx.page_start());
    assert_eq!(stats.assigned_small_pages, 0);
    assert_eq!(fx.heap.mapper().unwrap().mapped_pages(), 0);
}

#[test]
fn small_block_moves_to_the_page_region() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(100).unwrap();
    fill(a, 100, 7);

    let b = fx.heap.krealloc(a, 10_000).unwrap();
    assert_eq!(b, fx.page_start());
    assert!(holds(b, 100, 7));
    assert_eq!(fx.heap.stats().assigned_small_pages, 0);
}

#[test]
fn page_range_moves_to_a_small_block() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(3 * PAGE_SIZE).unwrap();
    fill(a, 3 * PAGE_SIZE, 9);

    let b = fx.heap.krealloc(a, 500).unwrap();
    assert_eq!(fx.heap.block_size(b), Some(512));
    assert!(holds(b, 500, 9));
    assert_eq!(fx.heap.stats().brk, fx.page_start());
}

#[test]
fn shrinking_a_page_range_stays_in_place() {
    let mut fx = Fixture::new(16);
    let a = fx.heap.kmalloc(5 * PAGE_SIZE).unwrap();
    let _top = fx.heap.kmalloc(PAGE_SIZE).unwrap();
    fill(a, 5 * PAGE_SIZE, 1);

    let b = fx.heap.krealloc(a, 2 * PAGE_SIZE - 10).unwrap();
    assert_eq!(b, a);
    assert!(holds(a, 2 * PAGE_SIZE - 10, 1));
    assert_eq!(fx.heap.mapper().unwrap().allocation_extent(a), 2);
    assert_eq!(fx.heap.block_size(a), Some(2 * PAGE_SIZE));
    assert_eq!(fx.extents(), [(2, 3)]);
    assert!(!fx.heap.mapper().unwrap().is_mapped(a.add_pages(2)));
    fx.assert_consistent();

    assert_eq!(fx.heap.krealloc(a, 2 * PAGE_SIZE).unwrap(), a);
}

#[test]
fn shrinking_the_topmost_range_lowers_the_break() {
    let mut fx = Fixture::new(16);
    let a = fx.heap.kmalloc(6 * PAGE_SIZE).unwrap();
    assert_eq!(fx.heap.krealloc(a, PAGE_SIZE + 1).unwrap(), a);
    assert_eq!(fx.heap.stats().brk, a.add_pages(2));
    assert!(fx.extents().is_empty());
}

#[test]
fn growing_a_page_range_moves_it() {
    let mut fx = Fixture::new(16);
    let a = fx.heap.kmalloc(2 * PAGE_SIZE).unwrap();
    let _next = fx.heap.kmalloc(PAGE_SIZE).unwrap();
    fill(a, 2 * PAGE_SIZE, 5);

    let b = fx.heap.krealloc(a, 3 * PAGE_SIZE).unwrap();
    assert_ne!(b, a);
    assert!(holds(b, 2 * PAGE_SIZE, 5));
    assert_eq!(fx.extents(), [(0, 2)]);
}

#[test]
fn null_and_zero_edges() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.krealloc(VirtualAddress::null(), 40).unwrap();
    assert_eq!(fx.heap.block_size(a), Some(64));

    assert!(fx.heap.krealloc(a, 0).unwrap().is_null());
    assert_eq!(fx.heap.stats().assigned_small_pages, 0);
    assert!(fx.heap.krealloc(VirtualAddress::null(), 0).unwrap().is_null());
}

#[test]
fn failed_resize_leaves_the_original_intact() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(100).unwrap();
    fill(a, 100, 42);

    fx.heap.mapper_mut().unwrap().frame_budget = Some(fx.heap.mapper().unwrap().mapped_pages());
    assert_eq!(fx.heap.krealloc(a, 10_000), Err(HeapError::OutOfFrames));
    assert!(holds(a, 100, 42));
    assert_eq!(fx.heap.block_size(a), Some(128));

    fx.heap.mapper_mut().unwrap().frame_budget = None;
    assert_eq!(
        fx.heap.krealloc(a, 100 * PAGE_SIZE),
        Err(HeapError::AddressSpaceExhausted { pages: 100 })
    );
    assert!(holds(a, 100, 42));
    fx.assert_consistent();
}

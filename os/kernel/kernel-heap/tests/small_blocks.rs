mod support;

use kernel_heap::HeapError;
use kernel_heap::config::{MAX_BLOCK_SIZE, PAGE_SIZE, SIZE_CLASSES};
use kernel_heap::small_block::class_index;
use support::{Fixture, SMALL_PAGES, fill, holds};

#[test]
fn requests_round_up_to_their_size_class() {
    let mut fx = Fixture::new(8);
    for (size, slot) in [(1, 8), (8, 8), (9, 16), (100, 128), (1500, 2048), (MAX_BLOCK_SIZE, 2048)] {
        let va = fx.heap.kmalloc(size).unwrap();
        assert!(fx.heap.mapper().unwrap().is_mapped(va));
        assert_eq!(fx.heap.block_size(va), Some(slot), "size {size}");
        assert_eq!(va.as_u64() % slot, 0, "slot alignment for {size}");
    }
    fx.assert_consistent();
}

#[test]
fn slots_are_carved_in_address_order() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(64).unwrap();
    let b = fx.heap.kmalloc(64).unwrap();

    assert_eq!(a, fx.small_start());
    assert_eq!(b, a + 64);
    assert_eq!(fx.heap.stats().assigned_small_pages, 1);
    assert_eq!(fx.heap.stats().free_slots[class_index(64)], (PAGE_SIZE / 64 - 2) as usize);
}

#[test]
fn freed_slot_is_handed_out_first() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(32).unwrap();
    let b = fx.heap.kmalloc(32).unwrap();
    fx.heap.kfree(a);
    assert_eq!(fx.heap.kmalloc(32).unwrap(), a);
    fx.heap.kfree(b);
    fx.assert_consistent();
}

#[test]
fn empty_page_goes_back_to_the_pool() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(64).unwrap();
    let b = fx.heap.kmalloc(64).unwrap();

    fx.heap.kfree(a);
    assert_eq!(fx.heap.stats().assigned_small_pages, 1);
    fx.heap.kfree(b);

    let stats = fx.heap.stats();
    assert_eq!(stats.assigned_small_pages, 0);
    assert_eq!(stats.free_slots, [0; SIZE_CLASSES]);
    assert_eq!(fx.heap.mapper().unwrap().mapped_pages(), 0);
    assert_eq!(fx.heap.block_size(a), None);
    fx.assert_consistent();
}

#[test]
fn unassigned_pages_are_reused_in_fifo_order() {
    let mut fx = Fixture::new(8);
    let page_of = |va: kernel_heap::VirtualAddress, fx: &Fixture| (va - fx.small_start()) / PAGE_SIZE;

    let a = fx.heap.kmalloc(8).unwrap();
    let b = fx.heap.kmalloc(16).unwrap();
    assert_eq!(page_of(a, &fx), 0);
    assert_eq!(page_of(b, &fx), 1);

    fx.heap.kfree(a);
    let c = fx.heap.kmalloc(32).unwrap();
    assert_eq!(page_of(c, &fx), 2);
    fx.assert_consistent();
}

#[test]
fn larger_slot_serves_a_small_request_when_the_pool_is_empty() {
    let mut fx = Fixture::new(8);
    let blocks: Vec<_> = (0..2 * SMALL_PAGES)
        .map(|_| fx.heap.kmalloc(2048).unwrap())
        .collect();
    assert_eq!(fx.heap.stats().assigned_small_pages, SMALL_PAGES);
    assert_eq!(
        fx.heap.kmalloc(8),
        Err(HeapError::SlotsExhausted { size: 8 })
    );

    fx.heap.kfree(blocks[5]);
    let tiny = fx.heap.kmalloc(8).unwrap();
    assert_eq!(tiny, blocks[5]);
    assert_eq!(fx.heap.block_size(tiny), Some(2048));

    // goes back to the list of its real class
    fx.heap.kfree(tiny);
    assert_eq!(fx.heap.stats().free_slots[class_index(2048)], 1);
    assert_eq!(fx.heap.stats().free_slots[class_index(8)], 0);
    fx.assert_consistent();
}

#[test]
fn mapping_failure_keeps_the_page_in_the_pool() {
    let mut fx = Fixture::new(8);
    let spare = fx.heap.kmalloc(1024).unwrap();
    let _keep = fx.heap.kmalloc(1024).unwrap();
    fx.heap.kfree(spare);

    fx.heap.mapper_mut().unwrap().frame_budget = Some(fx.heap.mapper().unwrap().mapped_pages());
    let before = fx.heap.stats();

    // a free 1024 B slot exists, so the 8 B request still succeeds
    let a = fx.heap.kmalloc(8).unwrap();
    assert_eq!(a, spare);
    fx.heap.kfree(a);

    // no larger slot for 2048 B
    assert_eq!(fx.heap.kmalloc(2048), Err(HeapError::OutOfFrames));
    assert_eq!(fx.heap.stats(), before);

    fx.heap.mapper_mut().unwrap().frame_budget = None;
    let b = fx.heap.kmalloc(2048).unwrap();
    assert_eq!((b - fx.small_start()) / PAGE_SIZE, 1);
    fx.assert_consistent();
}

#[test]
fn resize_within_the_class_stays_in_place() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(20).unwrap();
    fill(a, 20, 3);

    assert_eq!(fx.heap.krealloc(a, 30).unwrap(), a);
    assert_eq!(fx.heap.krealloc(a, 17).unwrap(), a);

    let b = fx.heap.krealloc(a, 100).unwrap();
    assert_ne!(b, a);
    assert_eq!(fx.heap.block_size(b), Some(128));
    assert!(holds(b, 20, 3));
    fx.assert_consistent();
}

#[test]
#[should_panic(expected = "unassigned small-block page")]
fn double_free_of_the_last_slot_is_fatal() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(64).unwrap();
    fx.heap.kfree(a);
    fx.heap.kfree(a);
}

#[test]
#[should_panic(expected = "not a 64 B slot boundary")]
fn freeing_inside_a_slot_is_fatal() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(64).unwrap();
    fx.heap.kfree(a + 8);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "double free of small block")]
fn double_free_next_to_a_live_slot_is_fatal() {
    let mut fx = Fixture::new(8);
    let a = fx.heap.kmalloc(64).unwrap();
    let _b = fx.heap.kmalloc(64).unwrap();
    fx.heap.kfree(a);
    fx.heap.kfree(a);
}

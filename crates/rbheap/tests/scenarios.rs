#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use rbheap::{Addr, BlockStatus, Heap, HeapBlock, MIN_BLOCK_SIZE, WORD, heap_align};

fn with_heap<F>(heap_size: usize, test_fn: F)
where
    F: FnOnce(&mut Heap<'_>),
{
    let mut arena = vec![0_u8; heap_size];
    let mut heap = Heap::init(&mut arena).unwrap();
    test_fn(&mut heap);
    if let Err(violation) = heap.check_heap() {
        panic!("heap left invalid: {violation}");
    }
}

fn expect_malloc(heap: &mut Heap<'_>, size: usize) -> Addr {
    let addr = heap.malloc(size).unwrap();
    assert!(heap.validate_heap());
    addr
}

fn expect_free(heap: &mut Heap<'_>, addr: Addr) {
    heap.free(Some(addr));
    assert!(heap.validate_heap());
}

fn expect_state(heap: &Heap<'_>, expected: &[HeapBlock]) {
    let mut actual = vec![HeapBlock::default(); expected.len()];
    heap.heap_diff(expected, &mut actual);
    for (i, block) in actual.iter().enumerate() {
        assert!(block.status.is_ok(), "slot {i}: {block:?}");
    }
}

fn block_payload(heap: &Heap<'_>, addr: Addr) -> usize {
    heap.payload(addr).len()
}

#[test]
fn single_malloc_layout() {
    with_heap(1024, |heap| {
        let p = expect_malloc(heap, 100);
        expect_state(
            heap,
            &[
                HeapBlock::new(Some(p), Some(100), BlockStatus::Ok),
                HeapBlock::new(None, None, BlockStatus::Ok),
            ],
        );
    });
}

#[test]
fn round_trip_restores_capacity() {
    with_heap(1024, |heap| {
        let capacity = heap.heap_capacity();
        let p = expect_malloc(heap, 100);
        assert!(heap.heap_capacity() < capacity);
        expect_free(heap, p);
        assert_eq!(heap.heap_capacity(), capacity);
        assert_eq!(heap.free_total(), 1);
    });
}

#[test]
fn adjacent_frees_in_either_order() {
    for first_a in [true, false] {
        with_heap(1024, |heap| {
            let capacity = heap.heap_capacity();
            let a = expect_malloc(heap, 80);
            let b = expect_malloc(heap, 200);
            assert_eq!(b.offset() - a.offset(), block_payload(heap, a) + WORD);

            let (first, second) = if first_a { (a, b) } else { (b, a) };
            expect_free(heap, first);
            expect_free(heap, second);
            assert_eq!(heap.heap_capacity(), capacity);
            assert_eq!(heap.free_total(), 1);
        });
    }
}

#[test]
fn repeated_size_builds_duplicate_chain() {
    const K: usize = 64;
    with_heap(1024, |heap| {
        let ptrs: Vec<_> = (0..10).map(|_| expect_malloc(heap, K)).collect();
        // Take the rest of the arena so no freed block touches a free tail.
        let rest = heap.heap_capacity();
        let _tail = expect_malloc(heap, rest);
        assert_eq!(heap.free_total(), 0);

        for ptr in ptrs.iter().step_by(2) {
            expect_free(heap, *ptr);
        }
        let block_size = heap_align(K + WORD);
        assert_eq!(heap.size_classes().collect::<Vec<_>>(), [(block_size, 5)]);
        assert_eq!(heap.free_total(), 5);

        // Freeing a neighbor coalesces three blocks into one.
        expect_free(heap, ptrs[1]);
        assert_eq!(
            heap.size_classes().collect::<Vec<_>>(),
            [(block_size, 3), (3 * block_size, 1)]
        );
    });
}

#[test]
fn realloc_grows_into_free_right_neighbor() {
    with_heap(1024, |heap| {
        let p = expect_malloc(heap, 64);
        let q = expect_malloc(heap, 64);
        let _guard = expect_malloc(heap, 64);
        heap.payload_mut(p).fill(0x5a);
        expect_free(heap, q);
        assert_eq!(heap.free_total(), 2);

        let grown = heap.realloc(Some(p), 100).unwrap();
        assert!(heap.validate_heap());
        assert_eq!(grown, p);
        assert!(heap.payload(grown)[..64].iter().all(|&b| b == 0x5a));
        // Only the tail is left in the index.
        assert_eq!(heap.free_total(), 1);
        let classes: Vec<_> = heap.size_classes().collect();
        assert_eq!(classes.len(), 1);
        assert!(classes[0].0 > 4 * MIN_BLOCK_SIZE);
    });
}

#[test]
fn malloc_picks_smallest_fitting_block() {
    with_heap(4096, |heap| {
        let sizes = [512, 64, 256, 128];
        let mut freed = Vec::new();
        for size in sizes {
            freed.push((size, expect_malloc(heap, size)));
            let _guard = expect_malloc(heap, 16);
        }
        for (_, addr) in &freed {
            expect_free(heap, *addr);
        }
        let address_of = |size: usize| freed.iter().find(|(s, _)| *s == size).map(|(_, a)| *a);

        for (request, winner) in [(100, 128), (200, 256), (64, 64), (300, 512)] {
            let addr = expect_malloc(heap, request);
            assert_eq!(Some(addr), address_of(winner), "request {request}");
        }
    });
}

#[test]
fn exhausted_heap_rejects_requests() {
    with_heap(128, |heap| {
        let before = heap.heap_capacity();
        assert_eq!(heap.malloc(128), None);
        assert_eq!(heap.malloc(0), None);
        assert_eq!(heap.heap_capacity(), before);
        let p = expect_malloc(heap, 1);
        assert_eq!(heap.malloc(1), None);
        expect_free(heap, p);
    });
}

#[test]
fn failed_realloc_leaves_block_untouched() {
    with_heap(1024, |heap| {
        let left = expect_malloc(heap, 100);
        let p = expect_malloc(heap, 100);
        let guard = expect_malloc(heap, 100);
        expect_free(heap, left);
        for (i, byte) in heap.payload_mut(p).iter_mut().enumerate() {
            *byte = u8::try_from(i % 251).unwrap();
        }
        let before: Vec<u8> = heap.payload(p).to_vec();
        let capacity = heap.heap_capacity();
        let free_total = heap.free_total();

        assert_eq!(heap.realloc(Some(p), 2000), None);
        assert!(heap.validate_heap());
        assert_eq!(heap.payload(p), &before[..]);
        assert_eq!(heap.heap_capacity(), capacity);
        assert_eq!(heap.free_total(), free_total);
        expect_state(
            heap,
            &[
                HeapBlock::new(None, Some(heap_align(100)), BlockStatus::Ok),
                HeapBlock::new(Some(p), Some(100), BlockStatus::Ok),
                HeapBlock::new(Some(guard), Some(100), BlockStatus::Ok),
                HeapBlock::new(None, None, BlockStatus::Ok),
            ],
        );
    });
}

#[test]
fn realloc_prefers_left_merge_over_move() {
    with_heap(1024, |heap| {
        let left = expect_malloc(heap, 64);
        let p = expect_malloc(heap, 64);
        let _guard = expect_malloc(heap, 64);
        heap.payload_mut(p).fill(0xc3);
        expect_free(heap, left);

        let moved = heap.realloc(Some(p), 128).unwrap();
        assert!(heap.validate_heap());
        assert_eq!(moved, left);
        assert!(heap.payload(moved)[..64].iter().all(|&b| b == 0xc3));
    });
}

#[test]
fn reset_discards_allocations() {
    with_heap(2048, |heap| {
        let capacity = heap.heap_capacity();
        for size in [10, 200, 30, 400] {
            expect_malloc(heap, size);
        }
        heap.reset();
        assert!(heap.validate_heap());
        assert_eq!(heap.heap_capacity(), capacity);
    });
}

//! Best-fit heap allocator over a borrowed byte arena.
//!
//! [`Heap`] manages one contiguous `&mut [u8]` and hands out payload
//! addresses through the classic `malloc` / `realloc` / `free` interface. It
//! keeps no metadata outside the arena: block headers, boundary tags and the
//! free-block index all live in the managed bytes themselves.
//!
//! # Design
//!
//! Free blocks are indexed by a red-black tree keyed by block size. Each
//! distinct size occupies one tree node; further free blocks of the same size
//! hang off that node in a doubly-linked duplicate chain.
//!
//! - **Allocation** searches the tree for the smallest block that fits. An
//!   exact size with duplicates is served from the chain in O(1).
//! - **Deallocation** merges the block with free neighbors found through
//!   boundary tags, then indexes the result. A chain member can be unlinked
//!   in O(1) when a neighbor absorbs it.
//! - **Reallocation** grows in place into free neighbors when it can and
//!   moves otherwise; a failed reallocation leaves the heap untouched.
//!
//! | Operation | Cost |
//! |-----------|------|
//! | `malloc` | O(log n) in distinct free sizes |
//! | `free` | O(log n) |
//! | `realloc` | O(log n) plus the payload copy |
//! | `validate_heap` | O(blocks) |
//!
//! # Usage
//!
//! ```rust
//! use rbheap::Heap;
//!
//! let mut arena = vec![0_u8; 4096];
//! let mut heap = Heap::init(&mut arena).unwrap();
//!
//! let a = heap.malloc(100).unwrap();
//! let b = heap.malloc(200).unwrap();
//! heap.payload_mut(a).fill(0xaa);
//!
//! // `a` grows in place or moves; its bytes come along.
//! let a = heap.realloc(Some(a), 500).unwrap();
//! assert!(heap.payload(a)[..100].iter().all(|&byte| byte == 0xaa));
//!
//! heap.free(Some(a));
//! heap.free(Some(b));
//! assert_eq!(heap.free_total(), 1);
//! assert!(heap.validate_heap());
//! ```
//!
//! # Diagnostics
//!
//! [`Heap::check_heap`] walks the whole heap and reports the first broken
//! invariant as a [`Violation`]; [`Heap::validate_heap`] is its boolean form.
//! [`Heap::heap_diff`] compares the block layout with an expected one, and
//! [`Heap::size_classes`] lists the free-block sizes in ascending order.
//!
//! With the `tracing` feature the allocator emits `tracing` events for its
//! decisions. With the `breakpoint` feature a debug build traps into an
//! attached debugger when validation fails.
//!
//! # Thread Safety
//!
//! A `Heap` borrows its arena mutably and is driven through `&mut self`. It
//! is `Send` but concurrent use needs external synchronization.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod arena;
mod block;
mod chain;
mod coalesce;
mod diff;
mod heap;
mod trace;
mod tree;
mod validate;

pub use self::{
    block::{
        ALIGNMENT, MAX_REQUEST_SIZE, MIN_BLOCK_SIZE, MIN_HEAP_SIZE, SENTINEL_WIDTH, WORD,
        heap_align,
    },
    diff::{BlockStatus, HeapBlock},
    heap::{Addr, Heap, InitError},
    tree::SizeClasses,
    validate::Violation,
};

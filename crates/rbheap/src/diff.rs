//! Comparing the heap layout against an expected block sequence.
//!
//! Tests describe the heap they expect block by block, left to right, and
//! [`Heap::heap_diff`] fills in what it actually finds next to each
//! expectation.

use derive_more::IsVariant;

use crate::{Addr, Heap, block, heap_align};

/// Outcome of comparing one block with its expectation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum BlockStatus {
    /// The block matches.
    #[default]
    Ok,
    /// The block differs from the expectation.
    Error,
    /// The heap ended before this slot.
    OutOfBounds,
    /// The heap has more blocks than there are slots.
    HeapContinues,
}

/// One block of an expected or actual heap layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    /// Address of an allocated block, `None` for a free one.
    pub address: Option<Addr>,
    /// Payload capacity in bytes. `None` in an expectation matches any size.
    pub payload_bytes: Option<usize>,
    /// Outcome of the comparison for this slot; ignored in an expectation.
    pub status: BlockStatus,
}

impl HeapBlock {
    #[must_use]
    pub const fn new(
        address: Option<Addr>,
        payload_bytes: Option<usize>,
        status: BlockStatus,
    ) -> Self {
        Self {
            address,
            payload_bytes,
            status,
        }
    }
}

impl Heap<'_> {
    /// Walks the heap in step with `expected` and records every block found
    /// in the matching slot of `actual`.
    ///
    /// For slot `i`:
    ///
    /// - an expected free block (`address: None`) that is allocated is an
    ///   [`Error`](BlockStatus::Error);
    /// - an expected size of `None` is [`Ok`](BlockStatus::Ok) and reported
    ///   as `None`;
    /// - a payload capacity other than the expected size rounded up with
    ///   [`heap_align`] is an [`Error`](BlockStatus::Error);
    /// - anything else is [`Ok`](BlockStatus::Ok).
    ///
    /// Slots past the last block get [`OutOfBounds`](BlockStatus::OutOfBounds).
    /// If blocks remain after the last slot, that slot's status becomes
    /// [`HeapContinues`](BlockStatus::HeapContinues).
    ///
    /// # Panics
    ///
    /// Panics if `expected` and `actual` differ in length.
    ///
    /// # Examples
    ///
    /// ```
    /// use rbheap::{BlockStatus, Heap, HeapBlock, heap_align};
    ///
    /// let mut arena = vec![0_u8; 1024];
    /// let mut heap = Heap::init(&mut arena).unwrap();
    /// let addr = heap.malloc(100);
    ///
    /// let expected = [
    ///     HeapBlock::new(addr, Some(100), BlockStatus::Ok),
    ///     HeapBlock::new(None, None, BlockStatus::Ok),
    /// ];
    /// let mut actual = [HeapBlock::default(); 2];
    /// heap.heap_diff(&expected, &mut actual);
    /// assert!(actual.iter().all(|block| block.status.is_ok()));
    /// assert_eq!(actual[0].payload_bytes, Some(heap_align(100)));
    /// ```
    pub fn heap_diff(&self, expected: &[HeapBlock], actual: &mut [HeapBlock]) {
        assert_eq!(
            expected.len(),
            actual.len(),
            "expected and actual layouts must have the same length"
        );

        let mut blocks = self.blocks().peekable();
        let mut filled = 0;
        for (want, got) in expected.iter().zip(actual.iter_mut()) {
            let Some((offset, header)) = blocks.next() else {
                break;
            };
            let address = header
                .is_allocated()
                .then(|| Addr::from_block(offset));
            let payload_bytes = block::payload_capacity(header.size());
            *got = if want.address.is_none() && header.is_allocated() {
                HeapBlock::new(address, Some(payload_bytes), BlockStatus::Error)
            } else if want.payload_bytes.is_none() {
                HeapBlock::new(address, None, BlockStatus::Ok)
            } else if want.payload_bytes.map(heap_align) != Some(payload_bytes) {
                HeapBlock::new(address, Some(payload_bytes), BlockStatus::Error)
            } else {
                HeapBlock::new(address, Some(payload_bytes), BlockStatus::Ok)
            };
            filled += 1;
        }

        if filled < actual.len() {
            for slot in &mut actual[filled..] {
                *slot = HeapBlock::new(None, None, BlockStatus::OutOfBounds);
            }
            return;
        }
        if blocks.peek().is_some()
            && let Some(last) = actual.last_mut()
        {
            last.status = BlockStatus::HeapContinues;
        }
    }
}

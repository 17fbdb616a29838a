//! The allocator façade: `init`, `malloc`, `realloc` and `free` over one
//! arena.
//!
//! # Arena Layout
//!
//! ```text
//!   0                                              client_end       len
//!   +----------+--------+----------------+-----+-----+----------+----+
//!   | block    | block  | block          | ... |     | sentinel |pad |
//!   +----------+--------+----------------+-----+-----+----------+----+
//!   |<------------------- client range -------------->|
//! ```
//!
//! The client range is tiled by blocks with no gaps. The sentinel's header
//! reads as an allocated block, which bounds every right-neighbor lookup.
//! Trailing bytes that do not fill a whole alignment unit are never touched.
//!
//! # Algorithm
//!
//! - **Allocation**: best fit through the size-ordered tree; an exact size
//!   with duplicates is served from the chain without touching the tree. A
//!   found block is split when the remainder can stand alone as a free block.
//! - **Deallocation**: the block absorbs its free neighbors and the result is
//!   indexed.
//! - **Reallocation**: grows in place when the block plus its free neighbors
//!   is large enough, otherwise moves. A failed move changes nothing.

use core::num::NonZeroUsize;

use snafu::{Snafu, ensure};

use crate::{
    arena::{Arena, Blocks},
    block::{
        self, ALIGNMENT, Header, MAX_REQUEST_SIZE, MIN_BLOCK_SIZE, MIN_HEAP_SIZE, SENTINEL_WIDTH,
        Status, WORD, heap_align,
    },
    coalesce::{self, CLIENT_START},
    trace::{debug_log, trace_log},
    tree::{FreeIndex, SizeClasses},
};

/// Address of an allocation: the offset of its first payload byte from the
/// start of the arena.
///
/// Payloads start one header word into their block, so an address is never
/// zero and `Option<Addr>` is the nullable pointer of the C-style interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{:#x}", _0.get())]
pub struct Addr(NonZeroUsize);

impl Addr {
    pub(crate) fn from_block(block: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(block::to_payload(block) - 1))
    }

    /// Offset of the first payload byte from the start of the arena.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0.get()
    }

    const fn block(self) -> usize {
        block::to_block(self.offset())
    }
}

/// Error returned by [`Heap::init`].
#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("arena of {size} bytes is smaller than the minimum of {min} bytes"))]
    ArenaTooSmall {
        size: usize,
        min: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// A best-fit heap managing one borrowed byte arena.
///
/// All bookkeeping lives inside the arena itself; this struct only remembers
/// where the tree root and the sentinel are and how many blocks are free.
///
/// # Thread Safety
///
/// A `Heap` is an ordinary `&mut`-driven value. Sharing it between threads
/// requires external synchronization.
#[derive(Debug)]
pub struct Heap<'a> {
    arena: Arena<'a>,
    index: FreeIndex,
    client_end: usize,
}

impl<'a> Heap<'a> {
    /// Takes over `arena` and formats it as one free block.
    ///
    /// The arena length is rounded down to [`ALIGNMENT`]. Payload addresses
    /// are aligned relative to the start of `arena`, so a caller wanting
    /// aligned memory must hand in an aligned buffer.
    ///
    /// # Errors
    ///
    /// Fails if the arena cannot hold the sentinel plus one minimum-sized
    /// block ([`MIN_HEAP_SIZE`] bytes).
    ///
    /// # Examples
    ///
    /// ```
    /// use rbheap::Heap;
    ///
    /// let mut arena = vec![0_u8; 1024];
    /// let mut heap = Heap::init(&mut arena).unwrap();
    ///
    /// let addr = heap.malloc(100).unwrap();
    /// heap.payload_mut(addr)[..5].copy_from_slice(b"hello");
    /// assert_eq!(&heap.payload(addr)[..5], b"hello");
    ///
    /// heap.free(Some(addr));
    /// assert!(heap.validate_heap());
    ///
    /// let mut tiny = [0_u8; 16];
    /// assert!(Heap::init(&mut tiny).is_err());
    /// ```
    pub fn init(arena: &'a mut [u8]) -> Result<Self, InitError> {
        let size = arena.len();
        let usable = size & !(ALIGNMENT - 1);
        ensure!(
            usable >= MIN_HEAP_SIZE,
            ArenaTooSmallSnafu {
                size,
                min: MIN_HEAP_SIZE
            }
        );

        let (arena, _) = arena.split_at_mut(usable);
        let client_end = usable - SENTINEL_WIDTH;
        let mut heap = Self {
            arena: Arena::new(arena),
            index: FreeIndex::new(client_end),
            client_end,
        };
        heap.reset();
        Ok(heap)
    }

    /// Discards every allocation and returns the arena to its initial
    /// single free block.
    pub fn reset(&mut self) {
        let end = self.client_end;
        // The lone free block sits left of the sentinel.
        self.arena.set_header(end, Header::new(0, Status::ALLOCATED));
        self.index = FreeIndex::new(end);
        self.insert_free(CLIENT_START, end);
        debug_log!(
            "heap formatted: {} bytes, client range {:#x}..{end:#x}",
            self.arena.len(),
            CLIENT_START
        );
    }

    /// Allocates at least `requested_size` bytes.
    ///
    /// Returns `None` if `requested_size` is zero, exceeds
    /// [`MAX_REQUEST_SIZE`], or no free block is large enough. A failed call
    /// leaves the heap unchanged.
    pub fn malloc(&mut self, requested_size: usize) -> Option<Addr> {
        let request = block_size_for(requested_size)?;
        let Some(block) = self.index.best_fit(&mut self.arena, request) else {
            trace_log!("malloc({requested_size}): no free block of {request} bytes");
            return None;
        };
        let addr = self.split_alloc(block, request);
        trace_log!("malloc({requested_size}) -> {addr}");
        Some(addr)
    }

    /// Resizes the allocation at `old_ptr` to at least `new_size` bytes.
    ///
    /// - `old_ptr == None` behaves like [`malloc`](Self::malloc).
    /// - `new_size == 0` frees `old_ptr` and returns `None`.
    /// - Otherwise the block first tries to grow into its free neighbors. The
    ///   returned address then equals `old_ptr`, or lies left of it when the
    ///   left neighbor was absorbed. Failing that, the payload moves to a
    ///   fresh allocation.
    ///
    /// The first `min(old capacity, new capacity)` payload bytes are kept.
    /// On failure `None` is returned and the original allocation is left
    /// exactly as it was.
    ///
    /// `old_ptr` must be a live address returned by this heap.
    pub fn realloc(&mut self, old_ptr: Option<Addr>, new_size: usize) -> Option<Addr> {
        if new_size > MAX_REQUEST_SIZE {
            return None;
        }
        let Some(old) = old_ptr else {
            return self.malloc(new_size);
        };
        if new_size == 0 {
            self.free(Some(old));
            return None;
        }
        let request = block_size_for(new_size)?;

        let block = old.block();
        let old_payload = old.offset()..old.offset() + self.payload_len(block);
        let merge = coalesce::plan(&self.arena, block);
        if merge.size >= request {
            let start = coalesce::commit(&mut self.arena, &mut self.index, &merge);
            if start != block {
                self.arena.copy_within(old_payload, block::to_payload(start));
            }
            let addr = self.split_alloc(start, request);
            trace_log!("realloc({old}, {new_size}) -> {addr} in place");
            return Some(addr);
        }

        let Some(addr) = self.malloc(new_size) else {
            trace_log!("realloc({old}, {new_size}): out of memory");
            return None;
        };
        self.arena.copy_within(old_payload, addr.offset());
        self.free(Some(old));
        trace_log!("realloc({old}, {new_size}) -> {addr} moved");
        Some(addr)
    }

    /// Returns the allocation at `ptr` to the heap. `None` is ignored.
    ///
    /// `ptr` must be a live address returned by this heap; freeing anything
    /// else, or freeing twice, corrupts the heap.
    pub fn free(&mut self, ptr: Option<Addr>) {
        let Some(addr) = ptr else {
            return;
        };
        let block = coalesce::coalesce(&mut self.arena, &mut self.index, addr.block());
        let size = self.arena.header(block).size();
        self.insert_free(block, size);
        trace_log!("free({addr}): {size}-byte free block at {block:#x}");
    }

    /// Payload bytes of the live allocation at `addr`.
    ///
    /// The slice covers the block's whole capacity, which may exceed the
    /// requested size.
    ///
    /// # Panics
    ///
    /// May panic if `addr` is not a live allocation of this heap.
    #[must_use]
    pub fn payload(&self, addr: Addr) -> &[u8] {
        let len = self.payload_len(addr.block());
        self.arena.bytes(addr.offset()..addr.offset() + len)
    }

    /// Mutable payload bytes of the live allocation at `addr`.
    ///
    /// # Panics
    ///
    /// May panic if `addr` is not a live allocation of this heap.
    pub fn payload_mut(&mut self, addr: Addr) -> &mut [u8] {
        let len = self.payload_len(addr.block());
        self.arena.bytes_mut(addr.offset()..addr.offset() + len)
    }

    /// Number of free blocks. O(1).
    #[must_use]
    pub fn free_total(&self) -> usize {
        self.index.total()
    }

    /// Total payload bytes of all free blocks, found by walking the arena.
    #[must_use]
    pub fn heap_capacity(&self) -> usize {
        self.blocks()
            .filter(|(_, header)| !header.is_allocated())
            .map(|(_, header)| block::payload_capacity(header.size()))
            .sum()
    }

    /// Distinct free block sizes in ascending order, each with the number of
    /// free blocks of that size.
    ///
    /// # Examples
    ///
    /// ```
    /// use rbheap::Heap;
    ///
    /// let mut arena = vec![0_u8; 1024];
    /// let heap = Heap::init(&mut arena).unwrap();
    /// assert_eq!(heap.size_classes().count(), 1);
    /// ```
    #[must_use]
    pub fn size_classes(&self) -> SizeClasses<'_, 'a> {
        self.index.size_classes(&self.arena)
    }

    pub(crate) fn arena(&self) -> &Arena<'a> {
        &self.arena
    }

    #[cfg(test)]
    pub(crate) fn arena_mut(&mut self) -> &mut Arena<'a> {
        &mut self.arena
    }

    pub(crate) fn index(&self) -> &FreeIndex {
        &self.index
    }

    pub(crate) fn client_end(&self) -> usize {
        self.client_end
    }

    pub(crate) fn blocks(&self) -> Blocks<'_, 'a> {
        self.arena.blocks(self.client_end)
    }

    fn payload_len(&self, block: usize) -> usize {
        block::payload_capacity(self.arena.header(block).size())
    }

    /// Writes boundary tags for a free block, tells its right neighbor, and
    /// indexes it.
    fn insert_free(&mut self, block: usize, size: usize) {
        self.arena
            .set_boundary_tags(block, Header::new(size, Status::LEFT_ALLOCATED | Status::RED));
        let right = block::right_neighbor(block, size);
        let right_header = self.arena.header(right);
        self.arena
            .set_header(right, right_header.without(Status::LEFT_ALLOCATED));
        self.index.insert(&mut self.arena, block);
    }

    /// Marks the first `request` bytes of the unindexed block `block` as
    /// allocated and frees the rest if it is big enough to be a block.
    fn split_alloc(&mut self, block: usize, request: usize) -> Addr {
        let space = self.arena.header(block).size();
        let size = if space >= request + MIN_BLOCK_SIZE {
            self.insert_free(block::right_neighbor(block, request), space - request);
            request
        } else {
            let right = block::right_neighbor(block, space);
            let right_header = self.arena.header(right);
            self.arena
                .set_header(right, right_header.with(Status::LEFT_ALLOCATED));
            space
        };
        self.arena.set_header(
            block,
            Header::new(size, Status::ALLOCATED | Status::LEFT_ALLOCATED),
        );
        Addr::from_block(block)
    }
}

/// Block size needed to serve a request of `requested_size` payload bytes.
fn block_size_for(requested_size: usize) -> Option<usize> {
    (requested_size != 0 && requested_size <= MAX_REQUEST_SIZE)
        .then(|| heap_align(requested_size + WORD).max(MIN_BLOCK_SIZE))
}

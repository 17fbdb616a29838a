//! Block headers, boundary tags and offset arithmetic.
//!
//! Every block starts with a one-word header holding the block's total size
//! (header word included) and three status bits in the low bits that the
//! alignment keeps clear:
//!
//! ```text
//!   v-- most significant bit          v-- least significant bit
//!   +------------------------+--------+--------+--------+
//!   | size (multiple of 8)   |  red   |  left  | alloc  |
//!   |                        |        |  alloc |        |
//!   +------------------------+--------+--------+--------+
//! ```
//!
//! A free block mirrors its header into its last word (the footer), which is
//! how the right neighbor finds the start of a free left neighbor. While a
//! block is allocated, the footer word belongs to the client.

use core::fmt;

use bitflags::bitflags;
use derive_more::IsVariant;

/// Alignment of every block size and payload offset.
pub const ALIGNMENT: usize = 8;

/// Size of one machine word: a header, footer or link field.
pub const WORD: usize = size_of::<usize>();

/// Largest request `malloc` and `realloc` accept.
pub const MAX_REQUEST_SIZE: usize = 1 << 30;

/// Smallest block the allocator ever creates.
///
/// A free block must be able to hold its header, the four tree/chain link
/// words and its footer.
pub const MIN_BLOCK_SIZE: usize = heap_align(6 * WORD);

/// Bytes reserved at the end of the arena for the sentinel.
///
/// The sentinel carries a header plus the four link words of a tree node, but
/// it is never free and thus has no footer.
pub const SENTINEL_WIDTH: usize = heap_align(5 * WORD);

/// Smallest arena [`Heap::init`](crate::Heap::init) accepts.
pub const MIN_HEAP_SIZE: usize = MIN_BLOCK_SIZE + SENTINEL_WIDTH;

const SIZE_MASK: usize = !(ALIGNMENT - 1);

const _: () = assert!(ALIGNMENT.is_power_of_two() && ALIGNMENT >= WORD);
const _: () = assert!(ALIGNMENT >= 8, "three status bits must fit below the size");

/// Rounds `request` up to the next multiple of [`ALIGNMENT`].
///
/// Saturates at the largest aligned `usize` instead of overflowing, so the
/// function is idempotent over its whole domain.
///
/// # Examples
///
/// ```
/// use rbheap::heap_align;
///
/// assert_eq!(heap_align(13), 16);
/// assert_eq!(heap_align(16), 16);
/// assert_eq!(heap_align(heap_align(99)), heap_align(99));
/// ```
#[must_use]
pub const fn heap_align(request: usize) -> usize {
    request.saturating_add(ALIGNMENT - 1) & SIZE_MASK
}

bitflags! {
    /// Status bits packed below the size in a header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Status: usize {
        /// The block belongs to a client.
        const ALLOCATED = 0b001;
        /// The block immediately to the left is allocated (or this is the
        /// first block).
        const LEFT_ALLOCATED = 0b010;
        /// The block is a red tree node. Only meaningful while free.
        const RED = 0b100;
    }
}

/// Tree node color of a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub(crate) enum Color {
    Black,
    Red,
}

/// A decoded header (or footer) word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(usize);

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("status", &self.status())
            .finish()
    }
}

impl Header {
    #[must_use]
    pub(crate) const fn new(size: usize, status: Status) -> Self {
        debug_assert!(size & !SIZE_MASK == 0, "block size must be aligned");
        Self(size | status.bits())
    }

    #[must_use]
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub(crate) const fn raw(self) -> usize {
        self.0
    }

    #[must_use]
    pub(crate) const fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    #[must_use]
    pub(crate) const fn status(self) -> Status {
        Status::from_bits_truncate(self.0)
    }

    #[must_use]
    pub(crate) const fn is_allocated(self) -> bool {
        self.status().contains(Status::ALLOCATED)
    }

    #[must_use]
    pub(crate) const fn is_left_allocated(self) -> bool {
        self.status().contains(Status::LEFT_ALLOCATED)
    }

    #[must_use]
    pub(crate) const fn is_left_free(self) -> bool {
        !self.is_left_allocated()
    }

    #[must_use]
    pub(crate) const fn color(self) -> Color {
        if self.status().contains(Status::RED) {
            Color::Red
        } else {
            Color::Black
        }
    }

    #[must_use]
    pub(crate) const fn with(self, status: Status) -> Self {
        Self(self.0 | status.bits())
    }

    #[must_use]
    pub(crate) const fn without(self, status: Status) -> Self {
        Self(self.0 & !status.bits())
    }

    #[must_use]
    pub(crate) const fn with_color(self, color: Color) -> Self {
        match color {
            Color::Red => self.with(Status::RED),
            Color::Black => self.without(Status::RED),
        }
    }
}

/// Offset of the block that starts right after `block`.
#[must_use]
pub(crate) const fn right_neighbor(block: usize, size: usize) -> usize {
    block + size
}

/// Offset of the footer word of a block of `size` bytes.
#[must_use]
pub(crate) const fn footer_of(block: usize, size: usize) -> usize {
    block + size - WORD
}

/// Offset of the first payload byte of `block`.
#[must_use]
pub(crate) const fn to_payload(block: usize) -> usize {
    block + WORD
}

/// Offset of the block owning the payload at `payload`.
#[must_use]
pub(crate) const fn to_block(payload: usize) -> usize {
    payload - WORD
}

/// Payload bytes available to the client in a block of `size` bytes.
#[must_use]
pub(crate) const fn payload_capacity(size: usize) -> usize {
    size - WORD
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        for i in 0..10 {
            for size in (ALIGNMENT * i + 1)..=(ALIGNMENT * (i + 1)) {
                assert_eq!(heap_align(size), ALIGNMENT * (i + 1));
            }
        }
        assert_eq!(heap_align(0), 0);
    }

    #[test]
    fn test_align_saturates() {
        let top = heap_align(usize::MAX);
        assert_eq!(top % ALIGNMENT, 0);
        assert_eq!(heap_align(top), top);
    }

    #[test]
    fn test_header_packing() {
        let header = Header::new(96, Status::LEFT_ALLOCATED | Status::RED);
        assert_eq!(header.size(), 96);
        assert!(!header.is_allocated());
        assert!(header.is_left_allocated());
        assert!(header.color().is_red());

        let header = header.with(Status::ALLOCATED).with_color(Color::Black);
        assert_eq!(header.size(), 96);
        assert!(header.is_allocated());
        assert!(header.color().is_black());

        let header = header.without(Status::LEFT_ALLOCATED);
        assert!(header.is_left_free());
        assert_eq!(Header::from_raw(header.raw()), header);
    }

    #[test]
    fn test_navigation() {
        assert_eq!(right_neighbor(64, 48), 112);
        assert_eq!(footer_of(64, 48), 112 - WORD);
        assert_eq!(to_block(to_payload(64)), 64);
        assert_eq!(payload_capacity(MIN_BLOCK_SIZE), MIN_BLOCK_SIZE - WORD);
    }

    #[test]
    fn test_geometry() {
        assert_eq!(MIN_BLOCK_SIZE % ALIGNMENT, 0);
        assert!(MIN_BLOCK_SIZE >= 6 * WORD);
        assert!(SENTINEL_WIDTH >= 5 * WORD);
    }
}

//! Word-level access to the managed byte buffer.
//!
//! All allocator metadata lives inside the arena. Block, tree and chain
//! references are byte offsets from the start of the buffer, so following a
//! link is an offset computation plus one word read.
//!
//! # Node Layout
//!
//! A free block is either a tree node (one per distinct free size) or a
//! duplicate hanging off the tree node of its size:
//!
//! ```text
//!   word:   0        1         2         3         4            last
//!         +--------+---------+---------+---------+------------+---+--------+
//!   tree  | header | parent  | left    | right   | list_start |...| footer |
//!         +--------+---------+---------+---------+------------+---+--------+
//!   dup   | header | prev    | next    | unused  | DUPLICATE  |...| footer |
//!         +--------+---------+---------+---------+------------+---+--------+
//! ```
//!
//! The first duplicate's `prev` is the tree node itself; the last
//! duplicate's `next` is the sentinel.

use core::{fmt, ops::Range};

use crate::block::{self, Header, WORD};

const PARENT: usize = WORD;
const PREV: usize = WORD;
const LEFT: usize = 2 * WORD;
const NEXT: usize = 2 * WORD;
const RIGHT: usize = 3 * WORD;
const LIST_START: usize = 4 * WORD;

/// Value stored in the `list_start` slot of a duplicate.
///
/// Never a valid offset, so it tells duplicates and tree nodes apart.
const DUPLICATE: usize = usize::MAX;

/// Child direction of a tree link.
///
/// The red-black algorithms are written once for one direction and use `!dir`
/// for the mirror case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Left,
    Right,
}

impl core::ops::Not for Dir {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

impl From<bool> for Dir {
    /// `true` goes right, `false` goes left, matching `node_size < key`.
    fn from(right: bool) -> Self {
        if right { Self::Right } else { Self::Left }
    }
}

/// The managed byte buffer.
pub(crate) struct Arena<'a> {
    bytes: &'a mut [u8],
}

impl fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Arena<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    fn word(&self, at: usize) -> usize {
        let mut raw = [0; WORD];
        raw.copy_from_slice(&self.bytes[at..at + WORD]);
        usize::from_ne_bytes(raw)
    }

    fn set_word(&mut self, at: usize, value: usize) {
        self.bytes[at..at + WORD].copy_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn header(&self, block: usize) -> Header {
        Header::from_raw(self.word(block))
    }

    /// Rewrites the header word only.
    ///
    /// Used for allocated blocks and the sentinel; free blocks go through
    /// [`set_boundary_tags`](Self::set_boundary_tags).
    pub(crate) fn set_header(&mut self, block: usize, header: Header) {
        self.set_word(block, header.raw());
    }

    /// Reads the footer of a block of `size` bytes.
    pub(crate) fn footer(&self, block: usize, size: usize) -> Header {
        Header::from_raw(self.word(block::footer_of(block, size)))
    }

    /// Writes `header` into both the header and the footer of `block`.
    pub(crate) fn set_boundary_tags(&mut self, block: usize, header: Header) {
        self.set_word(block, header.raw());
        self.set_word(block::footer_of(block, header.size()), header.raw());
    }

    /// Locates the free block ending right before `block` through its footer.
    ///
    /// Only valid when `block`'s header says its left neighbor is free.
    pub(crate) fn left_neighbor(&self, block: usize) -> usize {
        let left_footer = Header::from_raw(self.word(block - WORD));
        block - left_footer.size()
    }

    /// Parent of a tree node; the sentinel for the root.
    pub(crate) fn parent(&self, node: usize) -> usize {
        self.word(node + PARENT)
    }

    /// Sets the parent of tree node `node`.
    pub(crate) fn set_parent(&mut self, node: usize, parent: usize) {
        self.set_word(node + PARENT, parent);
    }

    /// Child of a tree node on side `dir`.
    pub(crate) fn link(&self, node: usize, dir: Dir) -> usize {
        match dir {
            Dir::Left => self.word(node + LEFT),
            Dir::Right => self.word(node + RIGHT),
        }
    }

    /// Sets the child of tree node `node` on side `dir`.
    pub(crate) fn set_link(&mut self, node: usize, dir: Dir, child: usize) {
        match dir {
            Dir::Left => self.set_word(node + LEFT, child),
            Dir::Right => self.set_word(node + RIGHT, child),
        }
    }

    /// First duplicate in a tree node's chain, or the sentinel when it has none.
    pub(crate) fn list_start(&self, node: usize) -> usize {
        self.word(node + LIST_START)
    }

    /// Sets the first duplicate of tree node `node`.
    pub(crate) fn set_list_start(&mut self, node: usize, first: usize) {
        self.set_word(node + LIST_START, first);
    }

    /// Previous chain entry; the owning tree node for the first duplicate.
    pub(crate) fn prev(&self, entry: usize) -> usize {
        self.word(entry + PREV)
    }

    /// Sets the previous chain entry of `entry`.
    pub(crate) fn set_prev(&mut self, entry: usize, prev: usize) {
        self.set_word(entry + PREV, prev);
    }

    /// Next chain entry; the sentinel at the tail.
    pub(crate) fn next(&self, entry: usize) -> usize {
        self.word(entry + NEXT)
    }

    /// Sets the next chain entry of `entry`.
    pub(crate) fn set_next(&mut self, entry: usize, next: usize) {
        self.set_word(entry + NEXT, next);
    }

    /// Returns `true` if the free block `block` is a duplicate-chain entry
    /// rather than a tree node.
    pub(crate) fn is_duplicate(&self, block: usize) -> bool {
        self.list_start(block) == DUPLICATE
    }

    pub(crate) fn mark_duplicate(&mut self, block: usize) {
        self.set_list_start(block, DUPLICATE);
    }

    pub(crate) fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.bytes[range]
    }

    pub(crate) fn bytes_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.bytes[range]
    }

    /// Moves payload bytes inside the arena; the ranges may overlap.
    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        self.bytes.copy_within(src, dest);
    }

    /// Walks blocks from offset 0 up to `end`.
    pub(crate) fn blocks(&self, end: usize) -> Blocks<'_, 'a> {
        Blocks {
            arena: self,
            at: 0,
            end,
        }
    }
}

/// Linear walk over the blocks of the client range.
///
/// Stops early on a zero-sized header so a corrupted heap cannot loop
/// forever.
pub(crate) struct Blocks<'r, 'a> {
    arena: &'r Arena<'a>,
    at: usize,
    end: usize,
}

impl Iterator for Blocks<'_, '_> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.at >= self.end {
            return None;
        }
        let at = self.at;
        let header = self.arena.header(at);
        self.at = match header.size() {
            0 => self.end,
            size => at.saturating_add(size),
        };
        Some((at, header))
    }
}

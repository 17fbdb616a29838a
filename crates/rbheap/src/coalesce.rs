//! Merging a block with its free neighbors.
//!
//! Because every free block is coalesced before it is indexed, a block has at
//! most one free neighbor on each side and merging never cascades.

use crate::{
    arena::Arena,
    block::{self, Header, Status},
    tree::FreeIndex,
};

/// Offset of the first block of the client range.
pub(crate) const CLIENT_START: usize = 0;

/// The span a block would cover after absorbing its free neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Merge {
    /// Leftmost offset of the merged span.
    pub(crate) start: usize,
    /// Total size of the merged span.
    pub(crate) size: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// Inspects the neighbors of `block` without changing anything.
pub(crate) fn plan(arena: &Arena<'_>, block: usize) -> Merge {
    let header = arena.header(block);
    let mut merge = Merge {
        start: block,
        size: header.size(),
        left: None,
        right: None,
    };

    // The sentinel reads as allocated, so this never runs off the end.
    let right = block::right_neighbor(block, header.size());
    let right_header = arena.header(right);
    if !right_header.is_allocated() {
        merge.size += right_header.size();
        merge.right = Some(right);
    }

    if block != CLIENT_START && header.is_left_free() {
        let left = arena.left_neighbor(block);
        merge.size += arena.header(left).size();
        merge.start = left;
        merge.left = Some(left);
    }
    merge
}

/// Takes the neighbors named by `merge` out of the index and writes the
/// merged header. Returns the merged block's offset.
///
/// The footer is not written: a reallocation may still be reading payload
/// from the span. Whoever indexes the block as free writes it.
pub(crate) fn commit(arena: &mut Arena<'_>, index: &mut FreeIndex, merge: &Merge) -> usize {
    if let Some(right) = merge.right {
        index.remove(arena, right);
    }
    if let Some(left) = merge.left {
        index.remove(arena, left);
    }
    arena.set_header(merge.start, Header::new(merge.size, Status::LEFT_ALLOCATED));
    merge.start
}

/// Merges `block` with any free neighbor and returns the merged block's
/// offset, which is left of `block` if the left neighbor was absorbed.
pub(crate) fn coalesce(arena: &mut Arena<'_>, index: &mut FreeIndex, block: usize) -> usize {
    let merge = plan(arena, block);
    commit(arena, index, &merge)
}

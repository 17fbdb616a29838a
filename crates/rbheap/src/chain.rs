//! Doubly-linked chains of same-sized free blocks.
//!
//! Only one block per distinct size sits in the tree. Every other free block
//! of that size is pushed onto the tree node's chain, so repeated sizes never
//! cause rotations and any chain member can be unlinked in O(1) when a
//! neighbor coalesces with it.
//!
//! All functions here only rewrite chain links. Keeping the free-block count
//! is up to the caller.

use crate::arena::Arena;

/// Links `entry` in front of `head`'s chain.
pub(crate) fn push_front(arena: &mut Arena<'_>, head: usize, entry: usize, nil: usize) {
    let first = arena.list_start(head);
    arena.mark_duplicate(entry);
    arena.set_prev(entry, head);
    arena.set_next(entry, first);
    if first != nil {
        arena.set_prev(first, entry);
    }
    arena.set_list_start(head, entry);
}

/// Detaches and returns the first entry of `head`'s chain.
///
/// The chain must not be empty.
pub(crate) fn pop_front(arena: &mut Arena<'_>, head: usize, nil: usize) -> usize {
    let first = arena.list_start(head);
    debug_assert_ne!(first, nil, "chain of {head:#x} is empty");
    let next = arena.next(first);
    arena.set_list_start(head, next);
    if next != nil {
        arena.set_prev(next, head);
    }
    first
}

/// Detaches `entry` from wherever it sits in its chain.
pub(crate) fn unlink(arena: &mut Arena<'_>, entry: usize, nil: usize) {
    let prev = arena.prev(entry);
    let next = arena.next(entry);
    if arena.is_duplicate(prev) {
        arena.set_next(prev, next);
    } else {
        // `entry` is the first duplicate; `prev` is the tree node.
        arena.set_list_start(prev, next);
    }
    if next != nil {
        arena.set_prev(next, prev);
    }
}

/// Iterates over the entries of `head`'s chain, front to back.
pub(crate) fn entries<'r, 'a>(arena: &'r Arena<'a>, head: usize, nil: usize) -> Entries<'r, 'a> {
    Entries {
        arena,
        at: arena.list_start(head),
        nil,
    }
}

pub(crate) struct Entries<'r, 'a> {
    arena: &'r Arena<'a>,
    at: usize,
    nil: usize,
}

impl Iterator for Entries<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.at == self.nil {
            return None;
        }
        let entry = self.at;
        self.at = self.arena.next(entry);
        Some(entry)
    }
}

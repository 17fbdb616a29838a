//! Size-ordered red-black tree of free blocks.
//!
//! Each tree node is a free block and the sole representative of its size;
//! other free blocks of the same size wait in the node's duplicate chain (see
//! [`chain`](crate::chain)). Leaves and the root's parent are the sentinel, a
//! permanently black block at the end of the arena. The sentinel is compared
//! by offset only and none of its link fields is ever written.
//!
//! Insertion and deletion follow Cormen et al., chapter 13, with the left and
//! right cases unified through [`Dir`] and its negation. The fixup loops are
//! iterative and touch O(log n) nodes.

use arrayvec::ArrayVec;

use crate::{
    arena::{Arena, Dir},
    block::Color,
    chain,
};

/// Deepest tree the explicit-stack traversals can follow.
///
/// A red-black tree with `n` nodes is at most `2 * log2(n + 1)` deep and an
/// arena cannot hold more than `usize::MAX / MIN_BLOCK_SIZE` blocks.
pub(crate) const MAX_DEPTH: usize = 2 * usize::BITS as usize;

/// Root, sentinel and free-block count of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeIndex {
    root: usize,
    nil: usize,
    total: usize,
}

impl FreeIndex {
    /// Creates an empty index whose sentinel lives at `nil`.
    pub(crate) const fn new(nil: usize) -> Self {
        Self {
            root: nil,
            nil,
            total: 0,
        }
    }

    pub(crate) const fn root(&self) -> usize {
        self.root
    }

    pub(crate) const fn nil(&self) -> usize {
        self.nil
    }

    /// Number of free blocks, tree nodes and duplicates alike.
    pub(crate) const fn total(&self) -> usize {
        self.total
    }

    fn color(arena: &Arena<'_>, node: usize) -> Color {
        arena.header(node).color()
    }

    fn paint(&self, arena: &mut Arena<'_>, node: usize, color: Color) {
        debug_assert_ne!(node, self.nil, "the sentinel is always black");
        let header = arena.header(node).with_color(color);
        arena.set_boundary_tags(node, header);
    }

    /// Which side of its parent `node` hangs on. `node` must not be the root.
    fn side_of(arena: &Arena<'_>, node: usize) -> Dir {
        let parent = arena.parent(node);
        Dir::from(arena.link(parent, Dir::Right) == node)
    }

    fn min(&self, arena: &Arena<'_>, mut node: usize) -> usize {
        loop {
            let left = arena.link(node, Dir::Left);
            if left == self.nil {
                return node;
            }
            node = left;
        }
    }

    /// Rotates `current` down towards `dir`, lifting its `!dir` child.
    fn rotate(&mut self, arena: &mut Arena<'_>, current: usize, dir: Dir) {
        let child = arena.link(current, !dir);
        let grandchild = arena.link(child, dir);
        arena.set_link(current, !dir, grandchild);
        if grandchild != self.nil {
            arena.set_parent(grandchild, current);
        }

        let parent = arena.parent(current);
        arena.set_parent(child, parent);
        if parent == self.nil {
            self.root = child;
        } else {
            let side = Self::side_of(arena, current);
            arena.set_link(parent, side, child);
        }
        arena.set_link(child, dir, current);
        arena.set_parent(current, child);
    }

    /// Adds the free block `block` to the index.
    ///
    /// The block's boundary tags must already hold its size. A block whose
    /// size is already represented joins that node's duplicate chain.
    pub(crate) fn insert(&mut self, arena: &mut Arena<'_>, block: usize) {
        let key = arena.header(block).size();
        let mut parent = self.nil;
        let mut seeker = self.root;
        while seeker != self.nil {
            parent = seeker;
            let seeker_size = arena.header(seeker).size();
            if seeker_size == key {
                chain::push_front(arena, seeker, block, self.nil);
                self.total += 1;
                return;
            }
            seeker = arena.link(seeker, Dir::from(seeker_size < key));
        }

        arena.set_parent(block, parent);
        if parent == self.nil {
            self.root = block;
        } else {
            let dir = Dir::from(arena.header(parent).size() < key);
            arena.set_link(parent, dir, block);
        }
        arena.set_link(block, Dir::Left, self.nil);
        arena.set_link(block, Dir::Right, self.nil);
        arena.set_list_start(block, self.nil);
        self.paint(arena, block, Color::Red);
        self.fix_insert(arena, block);
        self.total += 1;
    }

    fn fix_insert(&mut self, arena: &mut Arena<'_>, mut current: usize) {
        while Self::color(arena, arena.parent(current)).is_red() {
            let parent = arena.parent(current);
            let grandparent = arena.parent(parent);
            let side = Self::side_of(arena, parent);
            let aunt = arena.link(grandparent, !side);
            if Self::color(arena, aunt).is_red() {
                self.paint(arena, aunt, Color::Black);
                self.paint(arena, parent, Color::Black);
                self.paint(arena, grandparent, Color::Red);
                current = grandparent;
            } else {
                if current == arena.link(parent, !side) {
                    current = parent;
                    self.rotate(arena, current, side);
                }
                let parent = arena.parent(current);
                let grandparent = arena.parent(parent);
                self.paint(arena, parent, Color::Black);
                self.paint(arena, grandparent, Color::Red);
                self.rotate(arena, grandparent, !side);
            }
        }
        self.paint(arena, self.root, Color::Black);
    }

    /// Puts `replacement` where `remove` hangs. `replacement` may be the
    /// sentinel, whose parent field is left alone.
    fn transplant(&mut self, arena: &mut Arena<'_>, remove: usize, replacement: usize) {
        let parent = arena.parent(remove);
        if parent == self.nil {
            self.root = replacement;
        } else {
            let side = Self::side_of(arena, remove);
            arena.set_link(parent, side, replacement);
        }
        if replacement != self.nil {
            arena.set_parent(replacement, parent);
        }
    }

    /// Unlinks the tree node `remove`, whose duplicate chain must be empty.
    fn delete(&mut self, arena: &mut Arena<'_>, remove: usize) {
        debug_assert_eq!(arena.list_start(remove), self.nil);

        let mut removed_color = Self::color(arena, remove);
        let left = arena.link(remove, Dir::Left);
        let right = arena.link(remove, Dir::Right);
        // The sentinel's parent is never written, so the position the extra
        // black lands in is tracked as (node, parent).
        let (extra_black, extra_parent);
        if left == self.nil || right == self.nil {
            let child = if left == self.nil { right } else { left };
            extra_black = child;
            extra_parent = arena.parent(remove);
            self.transplant(arena, remove, child);
        } else {
            let replacement = self.min(arena, right);
            removed_color = Self::color(arena, replacement);
            extra_black = arena.link(replacement, Dir::Right);
            if replacement == right {
                extra_parent = replacement;
            } else {
                extra_parent = arena.parent(replacement);
                self.transplant(arena, replacement, extra_black);
                arena.set_link(replacement, Dir::Right, right);
                arena.set_parent(right, replacement);
            }
            self.transplant(arena, remove, replacement);
            arena.set_link(replacement, Dir::Left, left);
            arena.set_parent(left, replacement);
            let color = Self::color(arena, remove);
            self.paint(arena, replacement, color);
        }

        if removed_color.is_black() {
            self.fix_delete(arena, extra_black, extra_parent);
        }
        self.total -= 1;
    }

    fn fix_delete(&mut self, arena: &mut Arena<'_>, mut extra_black: usize, mut parent: usize) {
        while extra_black != self.root && Self::color(arena, extra_black).is_black() {
            let side = Dir::from(arena.link(parent, Dir::Right) == extra_black);
            let mut sibling = arena.link(parent, !side);
            if Self::color(arena, sibling).is_red() {
                self.paint(arena, sibling, Color::Black);
                self.paint(arena, parent, Color::Red);
                self.rotate(arena, parent, side);
                sibling = arena.link(parent, !side);
            }

            let near = arena.link(sibling, side);
            let far = arena.link(sibling, !side);
            if Self::color(arena, near).is_black() && Self::color(arena, far).is_black() {
                self.paint(arena, sibling, Color::Red);
                extra_black = parent;
                parent = arena.parent(extra_black);
                continue;
            }

            if Self::color(arena, far).is_black() {
                self.paint(arena, near, Color::Black);
                self.paint(arena, sibling, Color::Red);
                self.rotate(arena, sibling, !side);
                sibling = arena.link(parent, !side);
            }
            let parent_color = Self::color(arena, parent);
            self.paint(arena, sibling, parent_color);
            self.paint(arena, parent, Color::Black);
            let far = arena.link(sibling, !side);
            self.paint(arena, far, Color::Black);
            self.rotate(arena, parent, side);
            extra_black = self.root;
            parent = self.nil;
        }
        if extra_black != self.nil {
            self.paint(arena, extra_black, Color::Black);
        }
    }

    /// Moves the first duplicate of `head` into `head`'s tree position.
    ///
    /// The tree shape and colors are unchanged, so no fixup runs.
    fn promote_duplicate(&mut self, arena: &mut Arena<'_>, head: usize) {
        let successor = chain::pop_front(arena, head, self.nil);
        let header = arena.header(head);
        arena.set_boundary_tags(successor, header);

        let rest = arena.list_start(head);
        arena.set_list_start(successor, rest);
        if rest != self.nil {
            arena.set_prev(rest, successor);
        }

        let parent = arena.parent(head);
        arena.set_parent(successor, parent);
        for dir in [Dir::Left, Dir::Right] {
            let child = arena.link(head, dir);
            arena.set_link(successor, dir, child);
            if child != self.nil {
                arena.set_parent(child, successor);
            }
        }
        if parent == self.nil {
            self.root = successor;
        } else {
            let side = Self::side_of(arena, head);
            arena.set_link(parent, side, successor);
        }
    }

    /// Removes and returns the smallest free block of at least `key` bytes.
    ///
    /// An exact size match stops the descent immediately. When the winning
    /// size has duplicates, one of them is handed out and the tree is left
    /// untouched. Returns `None` without modifying anything if no free block
    /// is large enough.
    pub(crate) fn best_fit(&mut self, arena: &mut Arena<'_>, key: usize) -> Option<usize> {
        let mut seeker = self.root;
        let mut best = None;
        let mut best_size = usize::MAX;
        while seeker != self.nil {
            let seeker_size = arena.header(seeker).size();
            if seeker_size == key {
                best = Some(seeker);
                break;
            }
            let dir = Dir::from(seeker_size < key);
            // Anything that sends the search left is large enough; the last
            // one seen on the way down is the tightest.
            if dir == Dir::Left && seeker_size < best_size {
                best = Some(seeker);
                best_size = seeker_size;
            }
            seeker = arena.link(seeker, dir);
        }

        let node = best?;
        if arena.list_start(node) != self.nil {
            self.total -= 1;
            return Some(chain::pop_front(arena, node, self.nil));
        }
        self.delete(arena, node);
        Some(node)
    }

    /// Removes a specific free block, tree node or duplicate, so a neighbor
    /// can absorb it.
    pub(crate) fn remove(&mut self, arena: &mut Arena<'_>, block: usize) {
        if arena.is_duplicate(block) {
            chain::unlink(arena, block, self.nil);
            self.total -= 1;
        } else if arena.list_start(block) == self.nil {
            self.delete(arena, block);
        } else {
            self.promote_duplicate(arena, block);
            self.total -= 1;
        }
    }

    /// Walks the distinct free sizes in ascending order.
    pub(crate) fn size_classes<'r, 'a>(&self, arena: &'r Arena<'a>) -> SizeClasses<'r, 'a> {
        let mut classes = SizeClasses {
            arena,
            nil: self.nil,
            stack: ArrayVec::new(),
        };
        classes.descend_left(self.root);
        classes
    }
}

/// In-order iterator over the index, yielding `(block size, block count)`
/// for every distinct free size.
///
/// Returned by [`Heap::size_classes`](crate::Heap::size_classes).
pub struct SizeClasses<'r, 'a> {
    arena: &'r Arena<'a>,
    nil: usize,
    stack: ArrayVec<usize, MAX_DEPTH>,
}

impl SizeClasses<'_, '_> {
    fn descend_left(&mut self, mut node: usize) {
        while node != self.nil {
            if self.stack.try_push(node).is_err() {
                break;
            }
            node = self.arena.link(node, Dir::Left);
        }
    }
}

impl Iterator for SizeClasses<'_, '_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.descend_left(self.arena.link(node, Dir::Right));
        let size = self.arena.header(node).size();
        let count = 1 + chain::entries(self.arena, node, self.nil).count();
        Some((size, count))
    }
}

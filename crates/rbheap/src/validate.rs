//! Read-only consistency checks over the whole heap.
//!
//! [`Heap::check_heap`] first walks the client range block by block, then
//! walks the free index from its root. Either walk stops at the first
//! violation it finds. Every link is bounds-checked before it is followed, so
//! a corrupted heap is reported instead of panicking.

use arrayvec::ArrayVec;
use snafu::{Snafu, ensure};

use crate::{
    Heap,
    arena::Dir,
    block::{ALIGNMENT, Color, MIN_BLOCK_SIZE, SENTINEL_WIDTH},
    coalesce::CLIENT_START,
    trace::warn_log,
    tree::MAX_DEPTH,
};

/// The first broken heap invariant found by [`Heap::check_heap`].
///
/// Offsets are block offsets from the start of the arena.
#[derive(Debug, Snafu)]
pub enum Violation {
    #[snafu(display("sentinel at {offset:#x} is not an allocated, empty, black block"))]
    BadSentinel {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("first block does not mark its left neighbor as allocated"))]
    FirstBlockLeftFree {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("block at {offset:#x} has size {size}, below the minimum"))]
    Undersized {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("block at {offset:#x} of size {size} runs past {end:#x}"))]
    Overrun {
        offset: usize,
        size: usize,
        end: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("free block at {offset:#x} has a footer that differs from its header"))]
    FooterMismatch {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("block at {offset:#x} has a stale left-neighbor bit"))]
    StaleLeftBit {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("free block at {offset:#x} follows another free block"))]
    AdjacentFree {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("{used} used and {free} free bytes do not cover the {client} client bytes"))]
    Unaccounted {
        used: usize,
        free: usize,
        client: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("arena walk found {walked} free blocks, the index counts {total}"))]
    FreeCountMismatch {
        walked: usize,
        total: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display(
        "arena walk found {walked_bytes} free bytes, the index reaches {indexed_bytes} in \
         {indexed_blocks} blocks"
    ))]
    IndexMismatch {
        walked_bytes: usize,
        indexed_bytes: usize,
        indexed_blocks: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("index links to {offset:#x}, which is not a block of the client range"))]
    StrayLink {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("tree root at {offset:#x} is red"))]
    RedRoot {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("red node at {offset:#x} has a red parent"))]
    RedRed {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("subtrees of {offset:#x} have black heights {left} and {right}"))]
    BlackHeight {
        offset: usize,
        left: usize,
        right: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("path ending below {offset:#x} has {found} black nodes, expected {expected}"))]
    BlackPath {
        offset: usize,
        found: usize,
        expected: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("tree node at {offset:#x} of size {size} is out of order"))]
    TreeOrder {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("node at {offset:#x} names {found:#x} as parent instead of {expected:#x}"))]
    ParentLink {
        offset: usize,
        found: usize,
        expected: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("chain entry at {offset:#x} has size {size}, its tree node has {expected}"))]
    ChainSize {
        offset: usize,
        size: usize,
        expected: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("chain entry at {offset:#x} is not linked back to {expected:#x}"))]
    ChainLink {
        offset: usize,
        expected: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("allocated block at {offset:#x} is indexed as free"))]
    IndexedAllocated {
        offset: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("tree is deeper than {} levels", MAX_DEPTH))]
    TooDeep {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Running count of free blocks and their bytes.
#[derive(Debug, Default)]
struct Tally {
    bytes: usize,
    blocks: usize,
}

impl Heap<'_> {
    /// Returns `true` if every heap invariant holds.
    ///
    /// A violation is logged at warn level. With the `breakpoint` feature in
    /// a debug build it also traps into an attached debugger.
    #[must_use]
    pub fn validate_heap(&self) -> bool {
        match self.check_heap() {
            Ok(()) => true,
            Err(violation) => {
                warn_log!("heap validation failed: {violation}");
                breakpoint();
                false
            }
        }
    }

    /// Checks every heap invariant and reports the first one broken.
    ///
    /// Takes time linear in the number of blocks.
    pub fn check_heap(&self) -> Result<(), Violation> {
        self.check_bounds()?;
        let walked = self.check_blocks()?;
        self.check_index(&walked)
    }

    fn check_bounds(&self) -> Result<(), Violation> {
        let end = self.client_end();
        let sentinel = self.arena().header(end);
        ensure!(
            end + SENTINEL_WIDTH == self.arena().len()
                && self.index().nil() == end
                && sentinel.size() == 0
                && sentinel.is_allocated()
                && sentinel.color().is_black(),
            BadSentinelSnafu { offset: end }
        );
        ensure!(
            self.arena().header(CLIENT_START).is_left_allocated(),
            FirstBlockLeftFreeSnafu
        );
        Ok(())
    }

    fn check_blocks(&self) -> Result<Tally, Violation> {
        let arena = self.arena();
        let end = self.client_end();
        let mut walked = Tally::default();
        let mut used = 0;
        let mut left_allocated = true;
        let mut at = CLIENT_START;
        while at < end {
            let header = arena.header(at);
            let size = header.size();
            ensure!(size >= MIN_BLOCK_SIZE, UndersizedSnafu { offset: at, size });
            ensure!(size <= end - at, OverrunSnafu { offset: at, size, end });
            ensure!(
                header.is_left_allocated() == left_allocated,
                StaleLeftBitSnafu { offset: at }
            );
            if header.is_allocated() {
                used += size;
            } else {
                ensure!(left_allocated, AdjacentFreeSnafu { offset: at });
                ensure!(
                    arena.footer(at, size) == header,
                    FooterMismatchSnafu { offset: at }
                );
                walked.bytes += size;
                walked.blocks += 1;
            }
            left_allocated = header.is_allocated();
            at += size;
        }

        ensure!(
            arena.header(end).is_left_allocated() == left_allocated,
            StaleLeftBitSnafu { offset: end }
        );
        ensure!(
            used + walked.bytes == end - CLIENT_START,
            UnaccountedSnafu {
                used,
                free: walked.bytes,
                client: end - CLIENT_START,
            }
        );
        let total = self.index().total();
        ensure!(
            walked.blocks == total,
            FreeCountMismatchSnafu {
                walked: walked.blocks,
                total
            }
        );
        Ok(walked)
    }

    fn check_index(&self, walked: &Tally) -> Result<(), Violation> {
        let index = self.index();
        let root = index.root();
        let mut reached = Tally::default();
        if root != index.nil() {
            self.check_link(root)?;
            ensure!(
                self.arena().header(root).color().is_black(),
                RedRootSnafu { offset: root }
            );
        }
        let height = self.check_subtree(root, index.nil(), (0, usize::MAX), 0, &mut reached)?;
        self.check_black_paths(height)?;

        ensure!(
            reached.bytes == walked.bytes && reached.blocks == walked.blocks,
            IndexMismatchSnafu {
                walked_bytes: walked.bytes,
                indexed_bytes: reached.bytes,
                indexed_blocks: reached.blocks,
            }
        );
        Ok(())
    }

    /// Ensures `offset` can be read as a block of the client range.
    fn check_link(&self, offset: usize) -> Result<(), Violation> {
        ensure!(
            offset.is_multiple_of(ALIGNMENT)
                && offset < self.client_end()
                && self.client_end() - offset >= MIN_BLOCK_SIZE,
            StrayLinkSnafu { offset }
        );
        let size = self.arena().header(offset).size();
        ensure!(
            size >= MIN_BLOCK_SIZE && size <= self.client_end() - offset,
            StrayLinkSnafu { offset }
        );
        Ok(())
    }

    /// Checks the subtree at `node` and returns its black height.
    ///
    /// Sizes in the subtree must lie strictly inside `bounds`.
    fn check_subtree(
        &self,
        node: usize,
        parent: usize,
        bounds: (usize, usize),
        depth: usize,
        reached: &mut Tally,
    ) -> Result<usize, Violation> {
        let arena = self.arena();
        let nil = self.index().nil();
        if node == nil {
            return Ok(0);
        }
        ensure!(depth < MAX_DEPTH, TooDeepSnafu);
        self.check_link(node)?;

        let header = arena.header(node);
        let size = header.size();
        ensure!(!header.is_allocated(), IndexedAllocatedSnafu { offset: node });
        ensure!(
            !arena.is_duplicate(node),
            ChainLinkSnafu {
                offset: node,
                expected: parent
            }
        );
        let found = arena.parent(node);
        ensure!(
            found == parent,
            ParentLinkSnafu {
                offset: node,
                found,
                expected: parent
            }
        );
        ensure!(
            bounds.0 < size && size < bounds.1,
            TreeOrderSnafu { offset: node, size }
        );
        if header.color().is_red() && parent != nil {
            ensure!(
                arena.header(parent).color().is_black(),
                RedRedSnafu { offset: node }
            );
        }
        reached.bytes += size;
        reached.blocks += 1;
        self.check_chain(node, size, reached)?;

        let left = arena.link(node, Dir::Left);
        let right = arena.link(node, Dir::Right);
        let left_height = self.check_subtree(left, node, (bounds.0, size), depth + 1, reached)?;
        let right_height = self.check_subtree(right, node, (size, bounds.1), depth + 1, reached)?;
        ensure!(
            left_height == right_height,
            BlackHeightSnafu {
                offset: node,
                left: left_height,
                right: right_height
            }
        );
        Ok(left_height + usize::from(header.color().is_black()))
    }

    fn check_chain(&self, head: usize, size: usize, reached: &mut Tally) -> Result<(), Violation> {
        let arena = self.arena();
        let nil = self.index().nil();
        let mut prev = head;
        let mut entry = arena.list_start(head);
        while entry != nil {
            // More entries than free blocks means the chain loops.
            ensure!(
                reached.blocks < self.index().total(),
                ChainLinkSnafu {
                    offset: entry,
                    expected: prev
                }
            );
            self.check_link(entry)?;
            let header = arena.header(entry);
            ensure!(!header.is_allocated(), IndexedAllocatedSnafu { offset: entry });
            ensure!(
                header.size() == size,
                ChainSizeSnafu {
                    offset: entry,
                    size: header.size(),
                    expected: size
                }
            );
            ensure!(
                arena.is_duplicate(entry) && arena.prev(entry) == prev,
                ChainLinkSnafu {
                    offset: entry,
                    expected: prev
                }
            );
            reached.bytes += size;
            reached.blocks += 1;
            prev = entry;
            entry = arena.next(entry);
        }
        Ok(())
    }

    /// Recounts the black nodes on every root-to-leaf path with an explicit
    /// stack and compares each count against `expected`.
    ///
    /// Runs after [`check_subtree`](Self::check_subtree) has proven every link
    /// in bounds and the tree acyclic.
    fn check_black_paths(&self, expected: usize) -> Result<(), Violation> {
        let arena = self.arena();
        let nil = self.index().nil();
        let root = self.index().root();
        if root == nil {
            return Ok(());
        }

        let black = |node: usize| usize::from(arena.header(node).color() == Color::Black);
        let mut stack = ArrayVec::<(usize, usize), MAX_DEPTH>::new();
        stack.push((root, black(root)));
        while let Some((node, count)) = stack.pop() {
            for dir in [Dir::Left, Dir::Right] {
                let child = arena.link(node, dir);
                if child == nil {
                    ensure!(
                        count == expected,
                        BlackPathSnafu {
                            offset: node,
                            found: count,
                            expected
                        }
                    );
                } else {
                    ensure!(
                        stack.try_push((child, count + black(child))).is_ok(),
                        TooDeepSnafu
                    );
                }
            }
        }
        Ok(())
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(
        feature = "breakpoint",
        debug_assertions,
        not(test),
        any(target_arch = "x86", target_arch = "x86_64"),
    ))] {
        fn breakpoint() {
            // SAFETY: `int3` raises a debug trap and touches no memory.
            unsafe { core::arch::asm!("int3") };
        }
    } else if #[cfg(all(
        feature = "breakpoint",
        debug_assertions,
        not(test),
        target_arch = "aarch64",
    ))] {
        fn breakpoint() {
            // SAFETY: `brk` raises a debug trap and touches no memory.
            unsafe { core::arch::asm!("brk #0xf000") };
        }
    } else if #[cfg(all(
        feature = "breakpoint",
        debug_assertions,
        not(test),
        target_arch = "riscv64",
    ))] {
        fn breakpoint() {
            // SAFETY: `ebreak` raises a debug trap and touches no memory.
            unsafe { core::arch::asm!("ebreak") };
        }
    } else {
        fn breakpoint() {}
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Addr,
        block::{Header, Status, WORD},
    };

    fn with_test_heap<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(&mut Heap<'_>),
    {
        let mut arena = vec![0_u8; heap_size];
        let mut heap = Heap::init(&mut arena).unwrap();
        test_fn(&mut heap);
    }

    fn block_of(addr: Addr) -> usize {
        addr.offset() - WORD
    }

    /// Allocates four blocks, frees the first and third, and returns the
    /// allocated addresses plus the two free block offsets.
    fn checkerboard(heap: &mut Heap<'_>) -> ([Addr; 2], [usize; 2]) {
        let ptrs: Vec<_> = (0..4).map(|_| heap.malloc(64).unwrap()).collect();
        heap.free(Some(ptrs[0]));
        heap.free(Some(ptrs[2]));
        heap.check_heap().unwrap();
        ([ptrs[1], ptrs[3]], [block_of(ptrs[0]), block_of(ptrs[2])])
    }

    #[test]
    fn test_fresh_and_busy_heaps_are_valid() {
        with_test_heap(4096, |heap| {
            assert!(heap.validate_heap());
            let ptrs: Vec<_> = (1..12).map(|i| heap.malloc(i * 24).unwrap()).collect();
            for ptr in ptrs.iter().step_by(3) {
                heap.free(Some(*ptr));
            }
            assert!(heap.validate_heap());
        });
    }

    #[test]
    fn test_footer_mismatch() {
        with_test_heap(1024, |heap| {
            let (_, [free, _]) = checkerboard(heap);
            let size = heap.arena().header(free).size();
            let footer = crate::block::footer_of(free, size);
            heap.arena_mut().set_header(footer, Header::new(size + 8, Status::empty()));
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::FooterMismatch { offset, .. }) if offset == free
            ));
            assert!(!heap.validate_heap());
        });
    }

    #[test]
    fn test_stale_left_bit() {
        with_test_heap(1024, |heap| {
            let ([used, _], _) = checkerboard(heap);
            let block = block_of(used);
            let header = heap.arena().header(block);
            heap.arena_mut()
                .set_header(block, header.with(Status::LEFT_ALLOCATED));
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::StaleLeftBit { offset, .. }) if offset == block
            ));
        });
    }

    #[test]
    fn test_undersized_block() {
        with_test_heap(1024, |heap| {
            let ([used, _], _) = checkerboard(heap);
            let block = block_of(used);
            heap.arena_mut()
                .set_header(block, Header::new(0, Status::ALLOCATED));
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::Undersized { size: 0, .. })
            ));
        });
    }

    #[test]
    fn test_free_block_marked_allocated() {
        with_test_heap(1024, |heap| {
            let (_, [_, free]) = checkerboard(heap);
            let header = heap.arena().header(free);
            heap.arena_mut()
                .set_boundary_tags(free, header.with(Status::ALLOCATED));
            let right = free + header.size();
            let right_header = heap.arena().header(right);
            heap.arena_mut()
                .set_header(right, right_header.with(Status::LEFT_ALLOCATED));
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::FreeCountMismatch { walked: 2, total: 3, .. })
            ));
        });
    }

    #[test]
    fn test_bad_sentinel() {
        with_test_heap(1024, |heap| {
            let end = heap.client_end();
            let header = heap.arena().header(end);
            heap.arena_mut()
                .set_header(end, header.without(Status::ALLOCATED));
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::BadSentinel { offset, .. }) if offset == end
            ));
        });
    }

    #[test]
    fn test_red_root() {
        with_test_heap(1024, |heap| {
            let root = heap.index().root();
            let header = heap.arena().header(root);
            heap.arena_mut()
                .set_boundary_tags(root, header.with_color(Color::Red));
            assert!(matches!(heap.check_heap(), Err(Violation::RedRoot { .. })));
        });
    }

    #[test]
    fn test_parent_link() {
        with_test_heap(1024, |heap| {
            let root = heap.index().root();
            heap.arena_mut().set_parent(root, root);
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::ParentLink { offset, found, .. }) if offset == root && found == root
            ));
        });
    }

    #[test]
    fn test_stray_tree_link() {
        with_test_heap(1024, |heap| {
            let root = heap.index().root();
            heap.arena_mut().set_link(root, Dir::Left, 3);
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::StrayLink { offset: 3, .. })
            ));
        });
    }

    #[test]
    fn test_broken_chain_back_link() {
        with_test_heap(1024, |heap| {
            // Both freed blocks have the same size; the second joins the
            // first one's chain.
            let (_, [first, second]) = checkerboard(heap);
            let (head, dup) = if heap.arena().is_duplicate(first) {
                (second, first)
            } else {
                (first, second)
            };
            assert_eq!(heap.arena().list_start(head), dup);
            heap.arena_mut().set_prev(dup, dup);
            assert!(matches!(
                heap.check_heap(),
                Err(Violation::ChainLink { offset, expected, .. }) if offset == dup && expected == head
            ));
        });
    }

    #[test]
    fn test_chain_cycle_is_reported() {
        with_test_heap(1024, |heap| {
            let (_, [first, second]) = checkerboard(heap);
            let dup = if heap.arena().is_duplicate(first) { first } else { second };
            heap.arena_mut().set_prev(dup, dup);
            heap.arena_mut().set_next(dup, dup);
            heap.check_heap().unwrap_err();
        });
    }

    #[test]
    fn test_violation_display() {
        with_test_heap(1024, |heap| {
            let root = heap.index().root();
            let header = heap.arena().header(root);
            heap.arena_mut()
                .set_boundary_tags(root, header.with_color(Color::Red));
            let message = heap.check_heap().unwrap_err().to_string();
            assert_eq!(message, format!("tree root at {root:#x} is red"));
        });
    }
}

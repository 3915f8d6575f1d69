//! The segregated free-list index.
//!
//! The heads of the class lists live in the first `NUM_SIZE_CLASSES` words
//! of the arena. Each list is doubly linked through the first two payload
//! words of its free blocks, with links stored as arena offsets and 0 as the
//! empty link. Insertion is LIFO.

use crate::block::{read_word, write_word, Block};
use crate::units::WORD_SIZE;

/// Number of size classes. Class `i` holds free blocks with sizes in
/// `(2^(i+3), 2^(i+4)]`; the last class also takes everything larger.
pub(crate) const NUM_SIZE_CLASSES: usize = 16;

/// The class a block of `size` bytes belongs to: the smallest `i` with
/// `size <= 2^(i+4)`, capped at the last class.
#[inline]
pub(crate) fn class_of(size: u32) -> usize {
    (0..NUM_SIZE_CLASSES - 1)
        .find(|i| u64::from(size) <= 1 << (i + 4))
        .unwrap_or(NUM_SIZE_CLASSES - 1)
}

#[inline]
fn slot_offset(class: usize) -> usize {
    extra_assert!(class < NUM_SIZE_CLASSES);
    class * WORD_SIZE
}

/// The first free block of `class`, if any.
#[inline]
pub(crate) fn head(mem: &[u8], class: usize) -> Option<Block> {
    Block::from_link(read_word(mem, slot_offset(class)))
}

#[inline]
fn set_head(mem: &mut [u8], class: usize, block: Option<Block>) {
    write_word(mem, slot_offset(class), Block::to_link(block));
}

/// Push a free block onto the front of its class list.
pub(crate) fn insert(mem: &mut [u8], block: Block) {
    let header = block.header(mem);
    extra_assert!(!header.allocated, "inserting allocated {:?}", block);
    let class = class_of(header.size);

    let old_head = head(mem, class);
    block.set_prev_link(mem, None);
    block.set_next_link(mem, old_head);
    if let Some(old_head) = old_head {
        old_head.set_prev_link(mem, Some(block));
    }
    set_head(mem, class, Some(block));
}

/// Unlink a free block from its class list in O(1).
///
/// The block's header must still carry the size it was inserted with, so
/// that the head-of-list case rewrites the right slot.
pub(crate) fn remove(mem: &mut [u8], block: Block) {
    let prev = block.prev_link(mem);
    let next = block.next_link(mem);

    match (prev, next) {
        (Some(prev), Some(next)) => {
            prev.set_next_link(mem, Some(next));
            next.set_prev_link(mem, Some(prev));
        }
        (Some(prev), None) => {
            prev.set_next_link(mem, None);
        }
        (None, Some(next)) => {
            let class = class_of(block.header(mem).size);
            extra_assert!(head(mem, class) == Some(block));
            set_head(mem, class, Some(next));
            next.set_prev_link(mem, None);
        }
        (None, None) => {
            let class = class_of(block.header(mem).size);
            extra_assert!(head(mem, class) == Some(block));
            set_head(mem, class, None);
        }
    }
}

/// Walk one class list from head to tail.
pub(crate) fn iter(mem: &[u8], class: usize) -> FreeList<'_> {
    FreeList {
        mem,
        next: head(mem, class),
    }
}

/// Iterator returned by `iter`.
pub(crate) struct FreeList<'a> {
    mem: &'a [u8],
    next: Option<Block>,
}

impl<'a> Iterator for FreeList<'a> {
    type Item = Block;

    #[inline]
    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        self.next = block.next_link(self.mem);
        Some(block)
    }
}

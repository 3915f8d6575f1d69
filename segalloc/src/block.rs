//! Block layout inside the arena.
//!
//! ```text
//! offset 0        64   68       72       76       80
//! +---------------+----+--------+--------+--------+-----------------------
//! | class heads   |pad | prolog | prolog | block  | payload ...
//! | 16 x u32      |    | header | footer | header |
//! +---------------+----+--------+--------+--------+-----------------------
//! ```
//!
//! Every block is addressed by the offset of its payload (its "block
//! pointer"). The header is the word just before that offset. Free blocks
//! also carry a footer in their last word and reuse the first two payload
//! words as the previous/next links of their size class list. Allocated
//! blocks have no footer; the block after them learns that they are
//! allocated through the `PREV_ALLOCATED` bit of its own header.

use core::fmt;
use core::num::NonZeroU32;
use core::ops::Range;
use crate::size_classes::NUM_SIZE_CLASSES;
use crate::units::{align_up, Words, ALIGNMENT, WORD_SIZE};

/// Smallest block: header, two links, footer.
pub(crate) const MIN_BLOCK_SIZE: u32 = 4 * WORD_SIZE as u32;

/// Words requested from the grower by `init`: the class table, one padding
/// word, the prologue header and footer, and the epilogue header.
pub(crate) const INITIAL_WORDS: Words = Words(NUM_SIZE_CLASSES + 4);

/// The prologue is a header and footer with no payload between them.
pub(crate) const PROLOGUE_SIZE: u32 = 2 * WORD_SIZE as u32;

/// Block pointer of the prologue.
pub(crate) const PROLOGUE: Block = Block(((NUM_SIZE_CLASSES + 2) * WORD_SIZE) as u32);

/// Block pointer of the first block after the prologue. Right after `init`
/// this is where the epilogue header lives.
pub(crate) const FIRST_BLOCK: Block = Block(PROLOGUE.0 + PROLOGUE_SIZE);

/// Read the native-endian word at `at`.
///
/// Panics if `at` is out of bounds; the allocator only calls this on offsets
/// derived from a consistent heap.
#[inline]
pub(crate) fn read_word(mem: &[u8], at: usize) -> u32 {
    let mut word = [0; WORD_SIZE];
    word.copy_from_slice(&mem[at..at + WORD_SIZE]);
    u32::from_ne_bytes(word)
}

/// Bounds-checked `read_word`, for code that must survive a corrupted heap.
#[inline]
pub(crate) fn try_read_word(mem: &[u8], at: usize) -> Option<u32> {
    let bytes = mem.get(at..at.checked_add(WORD_SIZE)?)?;
    let mut word = [0; WORD_SIZE];
    word.copy_from_slice(bytes);
    Some(u32::from_ne_bytes(word))
}

#[inline]
pub(crate) fn write_word(mem: &mut [u8], at: usize, value: u32) {
    mem[at..at + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
}

/// The block size needed to serve a request of `request` payload bytes: one
/// header word of overhead, rounded up to the alignment, and never less
/// than the minimum block. `None` when that does not fit a size field.
pub(crate) fn adjust_size(request: usize) -> Option<u32> {
    let size = if request <= ALIGNMENT {
        MIN_BLOCK_SIZE as usize
    } else {
        align_up(request.checked_add(WORD_SIZE)?)?
    };
    u32::try_from(size).ok()
}

/// A decoded header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) size: u32,
    pub(crate) allocated: bool,
    pub(crate) prev_allocated: bool,
}

impl Header {
    // Low bits of a header word. Sizes are multiples of 8, so the bottom
    // three bits are free for tags; bit 2 is unused.
    const ALLOCATED: u32 = 0b001;
    const PREV_ALLOCATED: u32 = 0b010;
    pub(crate) const SIZE_MASK: u32 = !0b111;

    #[inline]
    pub(crate) fn allocated(size: u32, prev_allocated: bool) -> Header {
        Header {
            size,
            allocated: true,
            prev_allocated,
        }
    }

    #[inline]
    pub(crate) fn free(size: u32, prev_allocated: bool) -> Header {
        Header {
            size,
            allocated: false,
            prev_allocated,
        }
    }

    #[inline]
    pub(crate) fn with_prev_allocated(self, prev_allocated: bool) -> Header {
        Header {
            prev_allocated,
            ..self
        }
    }

    #[inline]
    pub(crate) fn pack(self) -> u32 {
        extra_assert!(self.size & !Self::SIZE_MASK == 0, "unaligned size {}", self.size);
        let mut word = self.size;
        if self.allocated {
            word |= Self::ALLOCATED;
        }
        if self.prev_allocated {
            word |= Self::PREV_ALLOCATED;
        }
        word
    }

    #[inline]
    pub(crate) fn unpack(word: u32) -> Header {
        Header {
            size: word & Self::SIZE_MASK,
            allocated: word & Self::ALLOCATED != 0,
            prev_allocated: word & Self::PREV_ALLOCATED != 0,
        }
    }
}

/// The client-visible address of an allocation: the offset of its payload
/// from the start of the arena.
///
/// Offset 0 is the first class-table slot and never a payload, so
/// `Option<Address>` plays the role of a nullable pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(NonZeroU32);

impl Address {
    /// Wrap a raw arena offset; `None` for offset 0.
    #[inline]
    pub fn new(offset: u32) -> Option<Address> {
        NonZeroU32::new(offset).map(Address)
    }

    /// The offset of the payload from the start of the arena.
    #[inline]
    pub fn offset(self) -> usize {
        self.0.get() as usize
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// A block pointer: the payload offset of a block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(pub(crate) u32);

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:#x})", self.0)
    }
}

impl From<Address> for Block {
    #[inline]
    fn from(address: Address) -> Block {
        Block(address.0.get())
    }
}

impl Block {
    #[inline]
    pub(crate) fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn address(self) -> Address {
        extra_assert!(self.0 >= FIRST_BLOCK.0);
        Address::new(self.0).unwrap_or_else(|| unreachable!("block pointers are never 0"))
    }

    /// Decode a free-list link; 0 is the empty link.
    #[inline]
    pub(crate) fn from_link(link: u32) -> Option<Block> {
        if link == 0 {
            None
        } else {
            Some(Block(link))
        }
    }

    #[inline]
    pub(crate) fn to_link(block: Option<Block>) -> u32 {
        block.map_or(0, |b| b.0)
    }

    #[inline]
    pub(crate) fn header_offset(self) -> usize {
        self.offset() - WORD_SIZE
    }

    #[inline]
    pub(crate) fn footer_offset(self, size: u32) -> usize {
        self.offset() + size as usize - 2 * WORD_SIZE
    }

    #[inline]
    pub(crate) fn header(self, mem: &[u8]) -> Header {
        Header::unpack(read_word(mem, self.header_offset()))
    }

    #[inline]
    pub(crate) fn set_header(self, mem: &mut [u8], header: Header) {
        write_word(mem, self.header_offset(), header.pack());
    }

    /// The footer word as located by the current header's size.
    #[inline]
    pub(crate) fn footer(self, mem: &[u8]) -> Header {
        let size = self.header(mem).size;
        Header::unpack(read_word(mem, self.footer_offset(size)))
    }

    /// Mark this block free with the given size, writing both boundary tags.
    pub(crate) fn write_free(self, mem: &mut [u8], size: u32, prev_allocated: bool) {
        extra_assert!(size >= MIN_BLOCK_SIZE);
        let header = Header::free(size, prev_allocated);
        self.set_header(mem, header);
        write_word(mem, self.footer_offset(size), header.pack());
    }

    /// Rewrite the `prev_allocated` tag, including the footer of a free
    /// block. The epilogue has size 0 and no footer.
    pub(crate) fn set_prev_allocated(self, mem: &mut [u8], prev_allocated: bool) {
        let header = self.header(mem).with_prev_allocated(prev_allocated);
        self.set_header(mem, header);
        if !header.allocated && header.size > 0 {
            write_word(mem, self.footer_offset(header.size), header.pack());
        }
    }

    /// The block immediately after this one.
    #[inline]
    pub(crate) fn next(self, mem: &[u8]) -> Block {
        Block(self.0 + self.header(mem).size)
    }

    /// The block immediately before this one. Only meaningful when that
    /// block is free, since only free blocks have a footer to read.
    #[inline]
    pub(crate) fn prev(self, mem: &[u8]) -> Block {
        extra_assert!(!self.header(mem).prev_allocated);
        let prev_footer = Header::unpack(read_word(mem, self.offset() - 2 * WORD_SIZE));
        Block(self.0 - prev_footer.size)
    }

    #[inline]
    pub(crate) fn prev_link(self, mem: &[u8]) -> Option<Block> {
        Block::from_link(read_word(mem, self.offset()))
    }

    #[inline]
    pub(crate) fn next_link(self, mem: &[u8]) -> Option<Block> {
        Block::from_link(read_word(mem, self.offset() + WORD_SIZE))
    }

    #[inline]
    pub(crate) fn set_prev_link(self, mem: &mut [u8], prev: Option<Block>) {
        write_word(mem, self.offset(), Block::to_link(prev));
    }

    #[inline]
    pub(crate) fn set_next_link(self, mem: &mut [u8], next: Option<Block>) {
        write_word(mem, self.offset() + WORD_SIZE, Block::to_link(next));
    }

    /// Payload bytes available to the client of an allocated block: the
    /// whole block minus its header.
    #[inline]
    pub(crate) fn usable_size(self, mem: &[u8]) -> usize {
        self.header(mem).size as usize - WORD_SIZE
    }

    #[inline]
    pub(crate) fn payload(self, mem: &[u8]) -> Range<usize> {
        self.offset()..self.offset() + self.usable_size(mem)
    }

    /// Walk every block between the prologue and the epilogue, in address
    /// order. Stops early rather than reading out of bounds.
    pub(crate) fn walk(mem: &[u8]) -> Walk<'_> {
        Walk {
            mem,
            next: Some(FIRST_BLOCK),
        }
    }
}

/// Iterator returned by `Block::walk`.
pub(crate) struct Walk<'a> {
    mem: &'a [u8],
    next: Option<Block>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next.take()?;
        let header = Header::unpack(try_read_word(self.mem, block.header_offset())?);
        if header.size == 0 {
            return None;
        }
        self.next = block.0.checked_add(header.size).map(Block);
        Some(block)
    }
}

//! The heap checker.
//!
//! Nothing in the allocator depends on the checker for correctness. It reads
//! the arena through bounds-checked accessors only, so it can describe a
//! badly corrupted heap without panicking, and it never writes.

use crate::block::{
    read_word, try_read_word, Block, Header, FIRST_BLOCK, MIN_BLOCK_SIZE, PROLOGUE, PROLOGUE_SIZE,
};
use crate::size_classes::{class_of, NUM_SIZE_CLASSES};
use crate::units::{ALIGNMENT, WORD_SIZE};
use core::fmt;
use thiserror::Error;

/// A broken heap invariant. Offsets are arena offsets of block pointers
/// unless stated otherwise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The arena is too short to hold the class table and the prologue.
    #[error("arena of {len} bytes is too short to hold the prologue")]
    TruncatedArena {
        /// Arena length in bytes.
        len: usize,
    },

    /// The prologue is not an allocated 8-byte block.
    #[error("bad prologue: header {header:#x}, footer {footer:#x}")]
    BadPrologue {
        /// Raw prologue header word.
        header: u32,
        /// Raw prologue footer word.
        footer: u32,
    },

    /// A block pointer is not 8-byte aligned.
    #[error("block {block:#x} is not 8-byte aligned")]
    MisalignedBlock {
        /// The block.
        block: usize,
    },

    /// A block is smaller than the minimum block.
    #[error("block {block:#x} has impossible size {size}")]
    BadBlockSize {
        /// The block.
        block: usize,
        /// Its recorded size.
        size: u32,
    },

    /// A block reaches past the end of the arena.
    #[error("block {block:#x} of size {size} runs past the end of the arena")]
    BlockOutOfBounds {
        /// The block.
        block: usize,
        /// Its recorded size.
        size: u32,
    },

    /// A free block's header and footer disagree.
    #[error("free block {block:#x}: header {header:#x} != footer {footer:#x}")]
    FooterMismatch {
        /// The block.
        block: usize,
        /// Raw header word.
        header: u32,
        /// Raw footer word.
        footer: u32,
    },

    /// A header's `prev_allocated` tag does not match the previous block.
    #[error("block {block:#x} records previous allocated = {recorded}, but it is {actual}")]
    PrevAllocatedMismatch {
        /// The block (or epilogue).
        block: usize,
        /// What the header says.
        recorded: bool,
        /// What the previous block really is.
        actual: bool,
    },

    /// Two free blocks sit next to each other.
    #[error("free block {block:#x} follows another free block")]
    UncoalescedNeighbors {
        /// The second of the two free blocks.
        block: usize,
    },

    /// The epilogue is not an allocated, zero-sized header.
    #[error("bad epilogue at {offset:#x}: header {header:#x}")]
    BadEpilogue {
        /// Offset of the epilogue header word.
        offset: usize,
        /// Raw header word.
        header: u32,
    },

    /// The epilogue header is not the last word of the arena.
    #[error("epilogue at {offset:#x} is not the last word of a {arena_len}-byte arena")]
    EpilogueNotLast {
        /// Offset of the epilogue header word.
        offset: usize,
        /// Arena length in bytes.
        arena_len: usize,
    },

    /// A class list points at something that is not a free block.
    #[error("class {class} list links to {block:#x}, which is not a free block")]
    UnknownListEntry {
        /// The size class.
        class: usize,
        /// The linked offset.
        block: usize,
    },

    /// A free block sits on the list of the wrong class.
    #[error("block {block:#x} of size {size} is on the list of class {class}")]
    WrongClass {
        /// The size class whose list holds the block.
        class: usize,
        /// The block.
        block: usize,
        /// Its size.
        size: u32,
    },

    /// A list entry's previous link does not point at the entry before it.
    #[error("class {class}: block {block:#x} links back to {recorded:#x}, expected {expected:#x}")]
    BrokenBackLink {
        /// The size class.
        class: usize,
        /// The block.
        block: usize,
        /// Its previous link (0 for none).
        recorded: usize,
        /// The entry actually before it (0 for none).
        expected: usize,
    },

    /// A class list is longer than the number of free blocks.
    #[error("class {class} list does not terminate")]
    ListCycle {
        /// The size class.
        class: usize,
    },

    /// Some free block is not on any list.
    #[error("{on_walk} free blocks in the heap but {on_lists} on the class lists")]
    FreeCountMismatch {
        /// Free blocks found walking headers.
        on_walk: usize,
        /// Blocks found walking the class lists.
        on_lists: usize,
    },

    /// A fit handed to placement is smaller than the request.
    #[error("block {block:#x} of size {size} cannot hold {requested} bytes")]
    UndersizedFit {
        /// The block.
        block: usize,
        /// Its size.
        size: u32,
        /// The adjusted request.
        requested: u32,
    },
}

/// Totals over a heap that passed `check_heap`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Length of the arena, including the class table and sentinels.
    pub arena_bytes: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Bytes in allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes in free blocks, boundary tags included.
    pub free_bytes: usize,
}

impl HeapStats {
    /// Fraction of the arena handed out to clients, headers included.
    pub fn utilization(&self) -> f64 {
        if self.arena_bytes == 0 {
            0.0
        } else {
            self.allocated_bytes as f64 / self.arena_bytes as f64
        }
    }
}

/// Check every heap invariant.
pub(crate) fn check_heap(mem: &[u8]) -> Result<HeapStats, Violation> {
    let len = mem.len();
    if len < FIRST_BLOCK.offset() {
        return Err(Violation::TruncatedArena { len });
    }

    let header = read_word(mem, PROLOGUE.header_offset());
    let footer = read_word(mem, PROLOGUE.offset());
    let expected = Header::allocated(PROLOGUE_SIZE, true).pack();
    if header != expected || footer != expected {
        return Err(Violation::BadPrologue { header, footer });
    }

    let mut stats = HeapStats {
        arena_bytes: len,
        ..HeapStats::default()
    };
    let mut free_blocks = Vec::new();
    let mut prev_allocated = true;
    let mut block = FIRST_BLOCK;

    loop {
        let at = block.offset();
        let word = try_read_word(mem, block.header_offset())
            .ok_or(Violation::BlockOutOfBounds { block: at, size: 0 })?;
        let header = Header::unpack(word);

        if header.prev_allocated != prev_allocated {
            return Err(Violation::PrevAllocatedMismatch {
                block: at,
                recorded: header.prev_allocated,
                actual: prev_allocated,
            });
        }

        if header.size == 0 {
            let offset = block.header_offset();
            if !header.allocated {
                return Err(Violation::BadEpilogue {
                    offset,
                    header: word,
                });
            }
            if offset + WORD_SIZE != len {
                return Err(Violation::EpilogueNotLast {
                    offset,
                    arena_len: len,
                });
            }
            break;
        }

        if at % ALIGNMENT != 0 {
            return Err(Violation::MisalignedBlock { block: at });
        }
        if header.size < MIN_BLOCK_SIZE {
            return Err(Violation::BadBlockSize {
                block: at,
                size: header.size,
            });
        }
        let end = at + header.size as usize;
        if end > len {
            return Err(Violation::BlockOutOfBounds {
                block: at,
                size: header.size,
            });
        }

        if header.allocated {
            stats.allocated_blocks += 1;
            stats.allocated_bytes += header.size as usize;
        } else {
            let footer = read_word(mem, block.footer_offset(header.size));
            if footer != word {
                return Err(Violation::FooterMismatch {
                    block: at,
                    header: word,
                    footer,
                });
            }
            if !prev_allocated {
                return Err(Violation::UncoalescedNeighbors { block: at });
            }
            stats.free_blocks += 1;
            stats.free_bytes += header.size as usize;
            free_blocks.push(block);
        }

        prev_allocated = header.allocated;
        block = Block(end as u32);
    }

    // `free_blocks` was filled in address order, so it is sorted.
    let mut on_lists = 0;
    for class in 0..NUM_SIZE_CLASSES {
        let mut expected_prev = None;
        let mut cursor = Block::from_link(read_word(mem, class * WORD_SIZE));
        let mut steps = 0;

        while let Some(entry) = cursor {
            steps += 1;
            if steps > free_blocks.len() {
                return Err(Violation::ListCycle { class });
            }
            if free_blocks.binary_search(&entry).is_err() {
                return Err(Violation::UnknownListEntry {
                    class,
                    block: entry.offset(),
                });
            }

            let header = entry.header(mem);
            if class_of(header.size) != class {
                return Err(Violation::WrongClass {
                    class,
                    block: entry.offset(),
                    size: header.size,
                });
            }

            let recorded = entry.prev_link(mem);
            if recorded != expected_prev {
                return Err(Violation::BrokenBackLink {
                    class,
                    block: entry.offset(),
                    recorded: Block::to_link(recorded) as usize,
                    expected: Block::to_link(expected_prev) as usize,
                });
            }

            expected_prev = Some(entry);
            cursor = entry.next_link(mem);
        }

        on_lists += steps;
    }

    if on_lists != stats.free_blocks {
        return Err(Violation::FreeCountMismatch {
            on_walk: stats.free_blocks,
            on_lists,
        });
    }

    Ok(stats)
}

/// A printable snapshot of every block and every class list, for
/// inspecting a heap that failed its check.
///
/// Rendering tolerates corruption: walks stop at the first unreadable word
/// and list walks are capped.
pub struct HeapDump<'a> {
    mem: &'a [u8],
}

impl<'a> HeapDump<'a> {
    pub(crate) fn new(mem: &'a [u8]) -> HeapDump<'a> {
        HeapDump { mem }
    }
}

fn describe(f: &mut fmt::Formatter<'_>, what: &str, at: usize, word: Option<u32>) -> fmt::Result {
    match word.map(Header::unpack) {
        Some(h) => write!(
            f,
            "{} @{:#x}: size {} alloc {} prev_alloc {}",
            what, at, h.size, h.allocated as u8, h.prev_allocated as u8
        ),
        None => write!(f, "{} @{:#x}: <out of bounds>", what, at),
    }
}

impl<'a> fmt::Display for HeapDump<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mem = self.mem;
        let max_steps = mem.len() / MIN_BLOCK_SIZE as usize + 1;

        writeln!(f, "======== heap: {} bytes ========", mem.len())?;

        describe(
            f,
            "prologue",
            PROLOGUE.offset(),
            try_read_word(mem, PROLOGUE.header_offset()),
        )?;
        writeln!(f)?;

        let mut block = FIRST_BLOCK;
        for _ in 0..max_steps {
            let word = try_read_word(mem, block.header_offset());
            let size = word.map_or(0, |w| Header::unpack(w).size);
            if size == 0 {
                describe(f, "epilogue", block.offset(), word)?;
                writeln!(f)?;
                break;
            }
            describe(f, "block", block.offset(), word)?;
            if word.map_or(false, |w| !Header::unpack(w).allocated) {
                let footer = try_read_word(mem, block.footer_offset(size));
                match footer.map(Header::unpack) {
                    Some(h) => write!(f, " | footer size {} alloc {}", h.size, h.allocated as u8)?,
                    None => write!(f, " | footer <out of bounds>")?,
                }
            }
            writeln!(f)?;
            match block.0.checked_add(size) {
                Some(next) => block = Block(next),
                None => break,
            }
        }

        writeln!(f, "======== free lists ========")?;
        for class in 0..NUM_SIZE_CLASSES {
            write!(f, "class[{}] ({}, {}]:", class, 1u64 << (class + 3), 1u64 << (class + 4))?;
            let mut cursor = try_read_word(mem, class * WORD_SIZE).and_then(Block::from_link);
            if cursor.is_none() {
                write!(f, " empty")?;
            }
            let mut steps = 0;
            while let Some(entry) = cursor {
                if steps == max_steps {
                    write!(f, " ...")?;
                    break;
                }
                steps += 1;
                let prev = try_read_word(mem, entry.offset()).unwrap_or(0);
                let next = try_read_word(mem, entry.offset() + WORD_SIZE);
                let size = entry
                    .offset()
                    .checked_sub(WORD_SIZE)
                    .and_then(|at| try_read_word(mem, at))
                    .map(|w| Header::unpack(w).size);
                match size {
                    Some(size) => write!(
                        f,
                        " {:#x}(size {}, prev {:#x})",
                        entry.offset(),
                        size,
                        prev
                    )?,
                    None => write!(f, " {:#x}(<out of bounds>)", entry.offset())?,
                }
                cursor = next.and_then(Block::from_link);
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

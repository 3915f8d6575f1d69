/*!

`segalloc`: a **seg**regated free-list heap **alloc**ator.

- **Explicit free lists:** Free blocks are threaded onto doubly linked lists,
  so allocation never has to walk past allocated blocks.

- **Segregated by size:** Sixteen power-of-two size classes keep small
  requests from wading through big blocks, and big requests from wading
  through small ones.

- **Immediate coalescing:** Boundary tags let every free merge with both of
  its neighbors in *O(1)*, so the heap never holds two free blocks side by
  side.

- **Byte-exact:** The heap is one contiguous byte arena, addressed by offset.
  Headers, footers, and list links are 4-byte words in that arena, exactly as
  they would be laid out by a C allocator on top of `sbrk`.

`segalloc` manages memory that belongs to an [`ArenaGrower`]: a contiguous
region that can only grow at its end. The grower is the only thing that talks
to the outside world. Two are provided: [`VecGrower`], a bounded `Vec<u8>`,
and (on unix) [`MmapGrower`], an `mmap` reservation that is committed page by
page.

## Using `segalloc`

```
use segalloc::SegAlloc;

let mut heap = SegAlloc::new()?;

let p = heap.allocate(100).expect("the first chunk has room");
heap.payload_mut(p)?[..5].copy_from_slice(b"hello");

let p = heap.resize(Some(p), 200).expect("the first chunk has room");
assert_eq!(&heap.payload(p)?[..5], b"hello");

heap.release(Some(p))?;
heap.check_heap("example")?;
# Ok::<(), segalloc::AllocError>(())
```

Allocation addresses are [`Address`]es: non-zero offsets of a payload from the
start of the arena, always 8-byte aligned. `Option<Address>` stands in for a
nullable pointer, so `release(None)` is a no-op and `resize(None, n)` is
`allocate(n)`.

Every operation has a `try_` form returning `Result<_, AllocError>`, and a
plain form returning `Option<Address>` that logs the error and yields `None`,
which is how `malloc` reports failure.

### Cargo Features

- **extra_assertions**: Run the full heap checker after every operation that
  mutates the heap, panicking with a heap dump on the first broken invariant.
  This is slow, and only meant for debugging the allocator.

The arena limit of the default [`VecGrower`] is read from the
`SEGALLOC_ARENA_LIMIT_BYTES` environment variable at build time, and is
20 MiB when that variable is unset.

## Implementation Notes and Constraints

- `segalloc` is single threaded. It does no locking, and a `SegAlloc` must
  only be used from one thread at a time; wrap it in a `Mutex` to share it.

- The arena only ever grows. Memory is recycled through the free lists, never
  returned to the grower.

- Offsets, sizes, and links are 32 bits, so an arena is at most 4 GiB.

- Pointers handed back to `release`, `resize`, and the payload accessors are
  looked up by walking block headers from the start of the heap, so those
  calls cost time proportional to the number of blocks in front of the
  pointer. In exchange a double free, or a pointer into the middle of a
  block, is always reported as an error and never corrupts the heap, even
  when the client has written a plausible header in front of it.

### Heap Layout

```text
+--------------+---------+----------+--------------------------+---------+
| class heads  | padding | prologue | block | block | ...      | epilogue|
| 16 words     | 1 word  | 2 words  |                          | 1 word  |
+--------------+---------+----------+--------------------------+---------+
  offset 0       64        68         76 (first header)          len - 4
```

Every block starts with a header word packing its size (a multiple of 8,
including the header) with two flags: *allocated* and *previous block
allocated*. Free blocks repeat the header in a footer word at their end, and
use their first two payload words as the previous/next links of their size
class list. Allocated blocks have no footer, because the only reader of a
footer is the next block's coalescing, and the next block already knows its
predecessor is allocated from its own header. The smallest block is 16 bytes:
header, two links, footer.

The prologue and epilogue are always-allocated sentinels, so coalescing never
has to special-case the ends of the heap.

### Size Classes

Class `i` holds free blocks of `(2^(i+3), 2^(i+4)]` bytes; the last class
also holds everything larger. Freed and split-off blocks are pushed onto the
front of their class list. Allocation searches the request's own class and
then each larger class in turn, taking the first block that is big enough
([`Fit::FirstFit`]); [`Fit::BestFit`] instead takes the smallest adequate
block in the whole heap. If nothing fits, the arena is extended by the larger
of the request and the configured chunk size.

```text
                    allocate(n)                      release(p)
                         |                                |
                         V                                V
           +---------------------------+     +-------------------------+
           | find_fit in class(n), ... |     | mark free, write footer |
           +---------------------------+     +-------------------------+
                |                 |                       |
           found fit          no fit                      |
                |                 V                       |
                |      +--------------------+             |
                |      | extend the arena   |------+      |
                |      +--------------------+      |      |
                V                                  V      V
           +--------------------+            +-------------------------+
           | place: unlink,     |--remainder-| coalesce with free      |
           | split off the rest |            | neighbors, push to list |
           +--------------------+            +-------------------------+
```

 */

#![deny(missing_docs)]

#[macro_use]
mod extra_assert;

mod block;
mod check;
mod config;
mod error;
mod fit;
mod grower;
mod imp_vec;
mod size_classes;
mod units;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        pub use imp_unix::MmapGrower;
    }
}

pub use block::Address;
pub use check::{HeapDump, HeapStats, Violation};
pub use config::{Config, Fit};
pub use error::AllocError;
pub use grower::ArenaGrower;
pub use imp_vec::VecGrower;
pub use units::{Bytes, RoundUpTo, Words};

use block::{
    adjust_size, write_word, Block, Header, FIRST_BLOCK, INITIAL_WORDS,
    MIN_BLOCK_SIZE, PROLOGUE, PROLOGUE_SIZE,
};
use core::cmp;
use core::fmt;
use core::ops::Range;
use extra_assert::assert_heap_consistent;
use fit::FitStrategy;
use size_classes::NUM_SIZE_CLASSES;
use units::{ALIGNMENT, WORD_SIZE};

/// Merge a block whose boundary tags were just marked free with whichever of
/// its neighbors are free, and push the result onto its class list.
fn coalesce(mem: &mut [u8], block: Block) -> Block {
    let header = block.header(mem);
    extra_assert!(!header.allocated);
    let next = block.next(mem);
    let next_header = next.header(mem);

    let merged = match (header.prev_allocated, next_header.allocated) {
        (true, true) => {
            next.set_header(mem, next_header.with_prev_allocated(false));
            block
        }
        (true, false) => {
            size_classes::remove(mem, next);
            block.write_free(mem, header.size + next_header.size, true);
            block
        }
        (false, true) => {
            let prev = block.prev(mem);
            let prev_header = prev.header(mem);
            size_classes::remove(mem, prev);
            next.set_header(mem, next_header.with_prev_allocated(false));
            prev.write_free(
                mem,
                prev_header.size + header.size,
                prev_header.prev_allocated,
            );
            prev
        }
        (false, false) => {
            let prev = block.prev(mem);
            let prev_header = prev.header(mem);
            size_classes::remove(mem, next);
            size_classes::remove(mem, prev);
            prev.write_free(
                mem,
                prev_header.size + header.size + next_header.size,
                prev_header.prev_allocated,
            );
            prev
        }
    };

    size_classes::insert(mem, merged);
    merged
}

/// Allocate `size` bytes out of the free block `block`, splitting off the
/// remainder as a new free block when it is big enough to stand alone.
fn place(mem: &mut [u8], block: Block, size: u32) -> Result<(), Violation> {
    let header = block.header(mem);
    extra_assert!(!header.allocated);
    let leftover = header
        .size
        .checked_sub(size)
        .ok_or(Violation::UndersizedFit {
            block: block.offset(),
            size: header.size,
            requested: size,
        })?;

    size_classes::remove(mem, block);

    if leftover >= MIN_BLOCK_SIZE {
        block.set_header(mem, Header::allocated(size, header.prev_allocated));
        let rest = block.next(mem);
        rest.write_free(mem, leftover, true);
        size_classes::insert(mem, rest);
        rest.next(mem).set_prev_allocated(mem, false);
    } else {
        block.set_header(mem, Header::allocated(header.size, header.prev_allocated));
        block.next(mem).set_prev_allocated(mem, true);
    }

    Ok(())
}

/// Cut an allocated block down to `size` bytes, handing the tail back to the
/// free lists if it can form a block of its own.
fn shrink(mem: &mut [u8], block: Block, size: u32) {
    let header = block.header(mem);
    extra_assert!(header.allocated && header.size >= size);
    let leftover = header.size.saturating_sub(size);
    if leftover < MIN_BLOCK_SIZE {
        return;
    }

    block.set_header(mem, Header::allocated(size, header.prev_allocated));
    let rest = block.next(mem);
    rest.write_free(mem, leftover, true);
    coalesce(mem, rest);
}

/// Try to make `block` hold `size` bytes without moving it: shrink it, or
/// grow it into a free block right after it.
fn resize_in_place(mem: &mut [u8], block: Block, size: u32) -> bool {
    let header = block.header(mem);
    if header.size >= size {
        shrink(mem, block, size);
        return true;
    }

    let next = block.next(mem);
    let next_header = next.header(mem);
    let combined = match header.size.checked_add(next_header.size) {
        Some(combined) if !next_header.allocated && combined >= size => combined,
        _ => return false,
    };

    size_classes::remove(mem, next);
    block.set_header(mem, Header::allocated(combined, header.prev_allocated));
    block.next(mem).set_prev_allocated(mem, true);
    shrink(mem, block, size);
    true
}

/// A segregated free-list allocator over the arena of an [`ArenaGrower`].
///
/// Constructing one with [`SegAlloc::init`] lays out the class table and the
/// sentinel blocks and seeds the heap with one free chunk. From then on the
/// `SegAlloc` exclusively owns its grower.
pub struct SegAlloc<G: ArenaGrower = VecGrower> {
    grower: G,
    config: Config,
    fit: &'static dyn FitStrategy,
}

impl SegAlloc<VecGrower> {
    /// An allocator over a fresh [`VecGrower`] with the default
    /// configuration.
    pub fn new() -> Result<SegAlloc<VecGrower>, AllocError> {
        SegAlloc::init(VecGrower::new(), Config::default())
    }
}

impl<G: ArenaGrower> fmt::Debug for SegAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegAlloc")
            .field("arena_size", &self.arena_size())
            .field("config", &self.config)
            .finish()
    }
}

impl<G: ArenaGrower> SegAlloc<G> {
    /// Build the initial heap in the empty arena of `grower`: the class
    /// table, the prologue and epilogue, and one free block of the
    /// configured chunk size.
    ///
    /// Fails with `OutOfMemory` if the grower cannot provide that much, and
    /// with `ArenaNotEmpty` if the grower already holds bytes.
    pub fn init(grower: G, config: Config) -> Result<SegAlloc<G>, AllocError> {
        let mut heap = SegAlloc {
            grower,
            config,
            fit: config.get_fit().strategy(),
        };

        let offset = heap.grower.extend(INITIAL_WORDS.into())?;
        if offset != 0 {
            return Err(AllocError::ArenaNotEmpty { offset });
        }

        let mem = heap.grower.memory_mut();
        for slot in 0..=NUM_SIZE_CLASSES {
            // Class heads, then the alignment padding word.
            write_word(mem, slot * WORD_SIZE, 0);
        }
        let prologue = Header::allocated(PROLOGUE_SIZE, true);
        PROLOGUE.set_header(mem, prologue);
        write_word(mem, PROLOGUE.footer_offset(PROLOGUE_SIZE), prologue.pack());
        FIRST_BLOCK.set_header(mem, Header::allocated(0, true));

        let chunk: Words = config.get_chunk_size().round_up_to();
        heap.extend(chunk)?;

        log::debug!(
            "initialized heap: {} bytes, {:?}",
            heap.arena_size(),
            heap.config
        );
        assert_heap_consistent(heap.grower.memory(), "init");
        Ok(heap)
    }

    /// Grow the arena by `words` (rounded up to an even count) and turn the
    /// new space into a free block, merged with a free block that ended the
    /// heap before.
    fn extend(&mut self, words: Words) -> Result<Block, AllocError> {
        let bytes: Bytes = words.round_up_to_even().into();
        let size = u32::try_from(bytes.0)
            .map_err(|_| AllocError::OutOfMemory { requested: bytes.0 })?;

        let offset = self.grower.extend(bytes).map_err(|e| {
            log::warn!("could not extend arena by {} bytes: {}", bytes.0, e);
            e
        })?;
        log::debug!("extended arena by {} bytes at {:#x}", bytes.0, offset);

        let mem = self.grower.memory_mut();
        // The old epilogue header becomes the new block's header, and keeps
        // telling the truth about the block before it.
        let block = Block(offset as u32);
        let prev_allocated = block.header(mem).prev_allocated;
        block.write_free(mem, size, prev_allocated);
        block.next(mem).set_header(mem, Header::allocated(0, false));

        Ok(coalesce(mem, block))
    }

    fn allocate_block(&mut self, size: usize) -> Result<Block, AllocError> {
        let adjusted = adjust_size(size).ok_or(AllocError::OutOfMemory { requested: size })?;

        let block = match self.fit.find_fit(self.grower.memory(), adjusted) {
            Some(block) => block,
            None => {
                let grow = cmp::max(Bytes(adjusted as usize), self.config.get_chunk_size());
                self.extend(grow.round_up_to())?
            }
        };

        place(self.grower.memory_mut(), block, adjusted)?;
        Ok(block)
    }

    fn free_block(&mut self, block: Block) {
        let mem = self.grower.memory_mut();
        let header = block.header(mem);
        block.write_free(mem, header.size, header.prev_allocated);
        coalesce(mem, block);
    }

    /// The block behind `address`, if `address` is the payload of a live
    /// allocation.
    ///
    /// The words in front of an arbitrary offset may be client data, so only
    /// a block boundary reached by walking headers from the first block is
    /// trusted. The walk stops at the first block past `address`.
    fn live_block(&self, address: Address) -> Option<Block> {
        let mem = self.grower.memory();
        let target = Block::from(address);
        if target < FIRST_BLOCK || target.offset() % ALIGNMENT != 0 {
            return None;
        }

        let block = Block::walk(mem)
            .take_while(|block| *block <= target)
            .find(|block| *block == target)?;
        if !block.header(mem).allocated {
            return None;
        }

        Some(block)
    }

    /// Allocate at least `size` bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request, and `OutOfMemory` when
    /// the arena cannot grow enough.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<Address>, AllocError> {
        if size == 0 {
            return Ok(None);
        }

        let block = self.allocate_block(size)?;
        log::trace!("allocate({}) = {}", size, block.address());
        assert_heap_consistent(self.grower.memory(), "allocate");
        Ok(Some(block.address()))
    }

    /// Allocate at least `size` bytes, or `None` if `size` is zero or the
    /// arena is exhausted.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        self.try_allocate(size).unwrap_or_else(|e| {
            log::warn!("allocate({}) failed: {}", size, e);
            None
        })
    }

    /// Free the allocation at `ptr`. Releasing `None` does nothing.
    ///
    /// Fails with `InvalidFree`, leaving the heap untouched, if `ptr` is not
    /// a live allocation.
    pub fn release(&mut self, ptr: Option<Address>) -> Result<(), AllocError> {
        let address = match ptr {
            Some(address) => address,
            None => return Ok(()),
        };

        let block = self.live_block(address).ok_or_else(|| {
            log::warn!("release({}): not a live allocation", address);
            AllocError::InvalidFree(address)
        })?;
        self.free_block(block);

        log::trace!("release({})", address);
        assert_heap_consistent(self.grower.memory(), "release");
        Ok(())
    }

    /// Resize the allocation at `ptr` to at least `size` bytes, moving it if
    /// it cannot be resized in place. The first `min(old usable size, size)`
    /// bytes are preserved.
    ///
    /// `ptr == None` allocates; `size == 0` releases and returns `None`. If
    /// the allocation has to move and there is no room, `OutOfMemory` is
    /// returned and the old allocation is left as it was.
    pub fn try_resize(
        &mut self,
        ptr: Option<Address>,
        size: usize,
    ) -> Result<Option<Address>, AllocError> {
        if size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }
        let address = match ptr {
            Some(address) => address,
            None => return self.try_allocate(size),
        };

        let block = self.live_block(address).ok_or_else(|| {
            log::warn!("resize({}, {}): not a live allocation", address, size);
            AllocError::InvalidFree(address)
        })?;
        let adjusted = adjust_size(size).ok_or(AllocError::OutOfMemory { requested: size })?;

        if resize_in_place(self.grower.memory_mut(), block, adjusted) {
            log::trace!("resize({}, {}) in place", address, size);
            assert_heap_consistent(self.grower.memory(), "resize");
            return Ok(Some(address));
        }

        let moved = self.allocate_block(size)?;
        let mem = self.grower.memory_mut();
        let len = cmp::min(block.usable_size(mem), size);
        mem.copy_within(block.offset()..block.offset() + len, moved.offset());
        self.free_block(block);

        log::trace!("resize({}, {}) = {}", address, size, moved.address());
        assert_heap_consistent(self.grower.memory(), "resize");
        Ok(Some(moved.address()))
    }

    /// Like [`try_resize`](SegAlloc::try_resize), logging the error and
    /// returning `None` on failure.
    pub fn resize(&mut self, ptr: Option<Address>, size: usize) -> Option<Address> {
        self.try_resize(ptr, size).unwrap_or_else(|e| {
            log::warn!("resize failed: {}", e);
            None
        })
    }

    /// Allocate room for `count` items of `size` bytes, zero filled.
    ///
    /// An overflowing `count * size` is `OutOfMemory`.
    pub fn try_allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<Option<Address>, AllocError> {
        let bytes = count
            .checked_mul(size)
            .ok_or(AllocError::OutOfMemory {
                requested: usize::MAX,
            })?;
        let address = match self.try_allocate(bytes)? {
            Some(address) => address,
            None => return Ok(None),
        };

        let mem = self.grower.memory_mut();
        let payload = Block::from(address).payload(mem);
        mem[payload].fill(0);
        Ok(Some(address))
    }

    /// Like [`try_allocate_zeroed`](SegAlloc::try_allocate_zeroed), logging
    /// the error and returning `None` on failure.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<Address> {
        self.try_allocate_zeroed(count, size).unwrap_or_else(|e| {
            log::warn!("allocate_zeroed({}, {}) failed: {}", count, size, e);
            None
        })
    }

    /// The usable bytes of the allocation at `address`. There may be a few
    /// more than were asked for.
    pub fn payload(&self, address: Address) -> Result<&[u8], AllocError> {
        let block = self
            .live_block(address)
            .ok_or(AllocError::NotAllocated(address))?;
        let mem = self.grower.memory();
        Ok(&mem[block.payload(mem)])
    }

    /// The usable bytes of the allocation at `address`, mutably.
    pub fn payload_mut(&mut self, address: Address) -> Result<&mut [u8], AllocError> {
        let block = self
            .live_block(address)
            .ok_or(AllocError::NotAllocated(address))?;
        let mem = self.grower.memory_mut();
        let payload = block.payload(mem);
        Ok(&mut mem[payload])
    }

    /// How many bytes the allocation at `address` can hold.
    pub fn usable_size(&self, address: Address) -> Result<usize, AllocError> {
        let block = self
            .live_block(address)
            .ok_or(AllocError::NotAllocated(address))?;
        Ok(block.usable_size(self.grower.memory()))
    }

    /// Check every heap invariant. On failure the violation is logged along
    /// with a full heap dump, prefixed by `tag`. Never modifies the heap.
    pub fn check_heap(&self, tag: &str) -> Result<HeapStats, Violation> {
        let mem = self.grower.memory();
        check::check_heap(mem).map_err(|violation| {
            log::error!("{}: {}\n{}", tag, violation, HeapDump::new(mem));
            violation
        })
    }

    /// A printable snapshot of every block and class list.
    pub fn dump(&self) -> HeapDump<'_> {
        HeapDump::new(self.grower.memory())
    }

    /// Current arena length in bytes.
    pub fn arena_size(&self) -> usize {
        self.grower.memory().len()
    }

    /// The offsets spanned by the mapped arena. Every live payload lies
    /// inside.
    pub fn heap_bounds(&self) -> Range<usize> {
        self.grower.low()..self.grower.high()
    }

    /// The configuration this allocator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The grower backing the arena.
    pub fn grower(&self) -> &G {
        &self.grower
    }
}

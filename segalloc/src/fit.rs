//! Fit strategies: how a free block is chosen for a request.

use crate::block::Block;
use crate::config::Fit;
use crate::size_classes::{self, class_of, NUM_SIZE_CLASSES};

/// Choose a free block of at least `size` bytes, without modifying the heap.
///
/// `None` is the ordinary "nothing fits, grow the arena" answer.
pub(crate) trait FitStrategy: Sync {
    fn find_fit(&self, mem: &[u8], size: u32) -> Option<Block>;
}

/// Scan the request's own class list, then each larger class, returning the
/// first block that is big enough.
pub(crate) struct FirstFit;

/// Walk every block in the heap and return the smallest free block that is
/// big enough, the lowest-addressed one on ties. Slower, packs a little
/// tighter.
pub(crate) struct BestFit;

static FIRST_FIT: FirstFit = FirstFit;
static BEST_FIT: BestFit = BestFit;

impl Fit {
    pub(crate) fn strategy(self) -> &'static dyn FitStrategy {
        match self {
            Fit::FirstFit => &FIRST_FIT,
            Fit::BestFit => &BEST_FIT,
        }
    }
}

impl FitStrategy for FirstFit {
    fn find_fit(&self, mem: &[u8], size: u32) -> Option<Block> {
        // A class is an upper bound on the sizes below it, so every class
        // from the request's own upward may hold a fit.
        (class_of(size)..NUM_SIZE_CLASSES).find_map(|class| {
            size_classes::iter(mem, class).find(|block| block.header(mem).size >= size)
        })
    }
}

impl FitStrategy for BestFit {
    fn find_fit(&self, mem: &[u8], size: u32) -> Option<Block> {
        Block::walk(mem)
            .filter(|block| {
                let header = block.header(mem);
                !header.allocated && header.size >= size
            })
            .min_by_key(|block| block.header(mem).size)
    }
}

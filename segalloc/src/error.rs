use crate::block::Address;
use crate::check::Violation;
use thiserror::Error;

/// Everything that can go wrong in a call into the allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The arena could not grow, or the request can never fit in a block.
    #[error("out of memory: could not provide {requested} bytes")]
    OutOfMemory {
        /// Bytes that were asked for.
        requested: usize,
    },

    /// The heap failed its consistency check. Nothing is repaired.
    #[error("heap corruption: {0}")]
    HeapCorruption(#[from] Violation),

    /// A pointer passed to `release` or `resize` is not a live allocation.
    #[error("invalid free of {0}: not a live allocation")]
    InvalidFree(Address),

    /// A payload was looked up through a pointer that is not a live
    /// allocation.
    #[error("{0} is not a live allocation")]
    NotAllocated(Address),

    /// `init` was handed an arena that already holds bytes.
    #[error("arena is not empty: fresh region starts at offset {offset}")]
    ArenaNotEmpty {
        /// Where the grower placed the first region.
        offset: usize,
    },
}

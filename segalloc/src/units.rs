//! Byte and word quantities.
//!
//! A word here is the 4-byte width of a block header, a block footer, and a
//! free-list link, not the machine word.

/// Size in bytes of one header, footer, or free-list link.
pub const WORD_SIZE: usize = 4;

/// Payload alignment, and the granularity of every block size.
pub const ALIGNMENT: usize = 8;

#[inline]
fn round_up_to(n: usize, divisor: usize) -> usize {
    extra_assert!(divisor > 0);
    (n + divisor - 1) / divisor
}

/// Round `n` up to the next multiple of `ALIGNMENT`.
#[inline]
pub fn align_up(n: usize) -> Option<usize> {
    n.checked_add(ALIGNMENT - 1).map(|n| n & !(ALIGNMENT - 1))
}

/// Conversion into a coarser unit, rounding up.
pub trait RoundUpTo<T> {
    /// Convert `self`, rounding up to a whole number of `T`s.
    fn round_up_to(self) -> T;
}

macro_rules! define_unit_type {
    ( $( #[$attr:meta] )* $name:ident ) => {
        $( #[$attr] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub usize);
    };
}

define_unit_type!(
    /// A quantity of bytes.
    Bytes
);
define_unit_type!(
    /// A quantity of 4-byte words.
    Words
);

impl From<Words> for Bytes {
    #[inline]
    fn from(words: Words) -> Bytes {
        Bytes(words.0 * WORD_SIZE)
    }
}

impl RoundUpTo<Words> for Bytes {
    #[inline]
    fn round_up_to(self) -> Words {
        Words(round_up_to(self.0, WORD_SIZE))
    }
}

impl Words {
    /// Round up to an even number of words, so the quantity stays a
    /// multiple of `ALIGNMENT` bytes.
    #[inline]
    pub fn round_up_to_even(self) -> Words {
        Words(self.0 + (self.0 & 1))
    }
}

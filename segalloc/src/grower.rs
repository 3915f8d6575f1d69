//! The collaborator that owns the arena's bytes and grows it on demand.

use crate::error::AllocError;
use crate::units::Bytes;

/// A monotonically growing, contiguous byte arena, in the manner of `sbrk`.
///
/// Offsets handed out by an `ArenaGrower` are relative to the start of the
/// arena and stay valid for its whole lifetime: the arena is never shrunk
/// and never moved from the allocator's point of view.
pub trait ArenaGrower {
    /// Append `bytes` fresh bytes to the end of the arena and return the
    /// offset where they start, which is the arena length before the call.
    ///
    /// Fails with `AllocError::OutOfMemory` when the arena cannot grow that
    /// far. A failed call leaves the arena untouched.
    fn extend(&mut self, bytes: Bytes) -> Result<usize, AllocError>;

    /// The mapped arena.
    fn memory(&self) -> &[u8];

    /// The mapped arena, mutably.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Offset of the first mapped byte.
    fn low(&self) -> usize {
        0
    }

    /// Offset one past the last mapped byte.
    fn high(&self) -> usize {
        self.memory().len()
    }
}

impl<'a, G: ArenaGrower + ?Sized> ArenaGrower for &'a mut G {
    fn extend(&mut self, bytes: Bytes) -> Result<usize, AllocError> {
        (**self).extend(bytes)
    }

    fn memory(&self) -> &[u8] {
        (**self).memory()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        (**self).memory_mut()
    }

    fn low(&self) -> usize {
        (**self).low()
    }

    fn high(&self) -> usize {
        (**self).high()
    }
}

/// The new arena length after growing `len` by `bytes`, if the arena may
/// reach it. Offsets are stored in 32-bit words, so no arena may outgrow
/// `u32::MAX` bytes whatever its own limit says.
pub(crate) fn grown_len(len: usize, bytes: Bytes, limit: usize) -> Result<usize, AllocError> {
    let limit = limit.min(u32::MAX as usize);
    len.checked_add(bytes.0)
        .filter(|&new_len| new_len <= limit)
        .ok_or(AllocError::OutOfMemory { requested: bytes.0 })
}

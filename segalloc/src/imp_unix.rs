use crate::error::AllocError;
use crate::grower::{grown_len, ArenaGrower};
use crate::units::Bytes;
use core::ptr::{self, NonNull};
use core::slice;

/// An arena carved out of one `mmap` reservation.
///
/// The whole address range is reserved up front with `PROT_NONE`, so the
/// arena never moves. Growing commits pages by flipping them to read/write
/// with `mprotect`, which is as close to `sbrk` as a library can get without
/// touching the process break.
#[derive(Debug)]
pub struct MmapGrower {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    len: usize,
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl MmapGrower {
    /// Reserve `reserve` bytes of address space (rounded up to whole pages).
    pub fn reserve(reserve: Bytes) -> Result<MmapGrower, AllocError> {
        let page = page_size();
        let reserved = reserve
            .0
            .checked_add(page - 1)
            .map(|n| n / page * page)
            .filter(|&n| n > 0)
            .ok_or(AllocError::OutOfMemory { requested: reserve.0 })?;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::warn!("mmap of {} bytes failed", reserved);
            return Err(AllocError::OutOfMemory { requested: reserved });
        }
        let base = NonNull::new(addr as *mut u8)
            .ok_or(AllocError::OutOfMemory { requested: reserved })?;

        Ok(MmapGrower {
            base,
            reserved,
            committed: 0,
            len: 0,
        })
    }

    /// Bytes of address space reserved for this arena.
    pub fn reserved(&self) -> Bytes {
        Bytes(self.reserved)
    }
}

impl ArenaGrower for MmapGrower {
    fn extend(&mut self, bytes: Bytes) -> Result<usize, AllocError> {
        let new_len = grown_len(self.len, bytes, self.reserved)?;

        if new_len > self.committed {
            let page = page_size();
            let new_committed = (new_len + page - 1) / page * page;
            let new_committed = new_committed.min(self.reserved);
            let code = unsafe {
                libc::mprotect(
                    self.base.as_ptr().add(self.committed) as *mut libc::c_void,
                    new_committed - self.committed,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if code != 0 {
                log::warn!(
                    "mprotect of {} bytes failed",
                    new_committed - self.committed
                );
                return Err(AllocError::OutOfMemory { requested: bytes.0 });
            }
            self.committed = new_committed;
        }

        let old_len = self.len;
        self.len = new_len;
        Ok(old_len)
    }

    fn memory(&self) -> &[u8] {
        // The first `len` bytes are committed, zero-initialised anonymous
        // memory owned exclusively by `self`.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

impl Drop for MmapGrower {
    fn drop(&mut self) {
        let code = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.reserved) };
        if code != 0 {
            log::warn!("munmap of {} bytes failed", self.reserved);
        }
    }
}

use crate::error::AllocError;
use crate::grower::{grown_len, ArenaGrower};
use crate::units::Bytes;

const DEFAULT_LIMIT_BYTES: usize =
    include!(concat!(env!("OUT_DIR"), "/segalloc_arena_limit_bytes.txt"));

/// An arena backed by a `Vec<u8>` that refuses to grow past a fixed limit.
///
/// The default limit comes from the `SEGALLOC_ARENA_LIMIT_BYTES`
/// environment variable at build time, or 20 MiB when it is unset.
#[derive(Debug, Clone, Default)]
pub struct VecGrower {
    bytes: Vec<u8>,
    limit: Option<usize>,
}

impl VecGrower {
    /// An empty arena with the build-time default limit.
    pub fn new() -> VecGrower {
        VecGrower::default()
    }

    /// An empty arena that may grow to at most `limit` bytes.
    pub fn with_limit(limit: Bytes) -> VecGrower {
        VecGrower {
            bytes: Vec::new(),
            limit: Some(limit.0),
        }
    }

    /// The most bytes this arena will ever hold.
    pub fn limit(&self) -> Bytes {
        Bytes(self.limit.unwrap_or(DEFAULT_LIMIT_BYTES))
    }
}

impl ArenaGrower for VecGrower {
    fn extend(&mut self, bytes: Bytes) -> Result<usize, AllocError> {
        let old_len = self.bytes.len();
        let new_len = grown_len(old_len, bytes, self.limit().0)?;
        self.bytes
            .try_reserve_exact(bytes.0)
            .map_err(|_| AllocError::OutOfMemory { requested: bytes.0 })?;
        self.bytes.resize(new_len, 0);
        Ok(old_len)
    }

    fn memory(&self) -> &[u8] {
        &self.bytes
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

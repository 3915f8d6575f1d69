use crate::block::MIN_BLOCK_SIZE;
use crate::units::{align_up, Bytes};

/// Which free block a request is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
    /// First block big enough, searching the request's size class and then
    /// each larger one. Fast.
    #[default]
    FirstFit,
    /// Smallest block big enough anywhere in the heap. Slower, slightly
    /// better utilization.
    BestFit,
}

/// Allocator tunables, fixed at `init`.
///
/// ```
/// use segalloc::{Bytes, Config, Fit};
///
/// let config = Config::default()
///     .chunk_size(Bytes(4096))
///     .fit(Fit::BestFit);
/// assert_eq!(config.get_chunk_size(), Bytes(4096));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    chunk_size: Bytes,
    fit: Fit,
}

impl Config {
    /// Default arena extension, in bytes.
    pub const DEFAULT_CHUNK_SIZE: Bytes = Bytes(1 << 11);

    /// The least the arena grows by when no free block fits. Rounded up to
    /// the alignment and to at least one minimum block.
    pub fn chunk_size(mut self, chunk_size: Bytes) -> Config {
        let size = align_up(chunk_size.0)
            .unwrap_or(usize::MAX & !7)
            .max(MIN_BLOCK_SIZE as usize);
        self.chunk_size = Bytes(size);
        self
    }

    /// The fit strategy.
    pub fn fit(mut self, fit: Fit) -> Config {
        self.fit = fit;
        self
    }

    /// The configured chunk size.
    pub fn get_chunk_size(&self) -> Bytes {
        self.chunk_size
    }

    /// The configured fit strategy.
    pub fn get_fit(&self) -> Fit {
        self.fit
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            chunk_size: Config::DEFAULT_CHUNK_SIZE,
            fit: Fit::default(),
        }
    }
}

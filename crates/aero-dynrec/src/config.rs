use thiserror::Error;

use crate::CACHE_ALIGN;

/// Smallest accepted `max_block_bytes`; the translator reserves room for one worst-case
/// instruction plus the block exit before decoding each instruction.
pub const MIN_BLOCK_BYTES: usize = 512;

/// Tunables for the code cache and translator.
///
/// The defaults match the classic dynrec constants: an 8MiB arena, 8KiB of guaranteed scratch
/// space per block, 128Ki block descriptors and 512 code page handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynrecConfig {
    /// Bytes of host code the block region of the arena can hold.
    pub cache_total: usize,
    /// Scratch space guaranteed to an open block. A block that writes more than this past the
    /// end of its region is a fatal overrun.
    pub max_block_bytes: usize,
    /// Number of `CacheBlock` descriptors, including the two link trampolines.
    pub cache_blocks: usize,
    /// Number of code page handlers that can be installed at once.
    pub code_pages: usize,
    /// Maximum number of guest instructions translated into one block.
    pub max_instructions: usize,
    /// Per-byte count of changing writes after which a start address is no longer compiled.
    pub smc_threshold: u8,
    /// Code-free writes a page with no blocks tolerates before its handler is released.
    pub page_release_delay: u32,
}

impl Default for DynrecConfig {
    fn default() -> Self {
        Self {
            cache_total: 8 * 1024 * 1024,
            max_block_bytes: 4096 * 2,
            cache_blocks: 128 * 1024,
            code_pages: 512,
            max_instructions: 32,
            smc_threshold: 4,
            page_release_delay: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_block_bytes {0} is below the minimum of {MIN_BLOCK_BYTES}")]
    BlockTooSmall(usize),

    #[error("cache_total {total} must be a multiple of {CACHE_ALIGN} and at least max_block_bytes {max_block}")]
    CacheTotal { total: usize, max_block: usize },

    #[error("cache_blocks {0} leaves no descriptor besides the two trampolines")]
    TooFewBlocks(usize),

    #[error("cache_blocks {0} exceeds the u32 id space")]
    TooManyBlocks(usize),

    #[error("code_pages must be between 1 and 65535, got {0}")]
    CodePages(usize),

    #[error("max_instructions must be non-zero")]
    NoInstructions,

    #[error("smc_threshold must be non-zero")]
    SmcThreshold,

    #[error("page_release_delay must be non-zero")]
    ReleaseDelay,
}

impl DynrecConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_bytes < MIN_BLOCK_BYTES {
            return Err(ConfigError::BlockTooSmall(self.max_block_bytes));
        }
        if self.cache_total < self.max_block_bytes || self.cache_total % CACHE_ALIGN != 0 {
            return Err(ConfigError::CacheTotal {
                total: self.cache_total,
                max_block: self.max_block_bytes,
            });
        }
        if self.cache_blocks < 3 {
            return Err(ConfigError::TooFewBlocks(self.cache_blocks));
        }
        if u32::try_from(self.cache_blocks).is_err() {
            return Err(ConfigError::TooManyBlocks(self.cache_blocks));
        }
        if self.code_pages == 0 || self.code_pages > usize::from(u16::MAX) {
            return Err(ConfigError::CodePages(self.code_pages));
        }
        if self.max_instructions == 0 {
            return Err(ConfigError::NoInstructions);
        }
        if self.smc_threshold == 0 {
            return Err(ConfigError::SmcThreshold);
        }
        if self.page_release_delay == 0 {
            return Err(ConfigError::ReleaseDelay);
        }
        Ok(())
    }
}

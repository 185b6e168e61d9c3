use thiserror::Error;

use crate::block::{CacheBlockId, LinkSlot};
use crate::config::ConfigError;

/// Errors surfaced while constructing a [`crate::JitEngine`].
#[derive(Debug, Error)]
pub enum DynrecError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to allocate {len} bytes of executable memory")]
    ExecMemory {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("guest memory size {0:#x} is not a non-zero multiple of the 4KiB page size")]
    GuestMemorySize(usize),
}

/// Internal invariant violations.
///
/// These are bugs in the recompiler or configurations far outside supported bounds. They are
/// never returned to callers of the dispatch API; [`fatal`] logs them and aborts the current
/// thread with the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("cache block pool exhausted ({capacity} descriptors)")]
    BlockPoolExhausted { capacity: usize },

    #[error("block overran scratch space: wrote {written} bytes into a {size} byte region")]
    BlockOverrun { written: usize, size: usize },

    #[error("cache arena corrupted: {0}")]
    ArenaCorrupted(&'static str),

    #[error("block {from} {slot:?} links to freed block {to}")]
    DanglingLink {
        from: CacheBlockId,
        slot: LinkSlot,
        to: CacheBlockId,
    },

    #[error("block {from} {slot:?} links to {to} but is missing from its back-reference ring")]
    MissingBackReference {
        from: CacheBlockId,
        slot: LinkSlot,
        to: CacheBlockId,
    },

    #[error("back-reference ring of block {to} names {from} {slot:?}, which does not link there")]
    StaleBackReference {
        from: CacheBlockId,
        slot: LinkSlot,
        to: CacheBlockId,
    },

    #[error("free block {0} still carries links or a code page")]
    FreeBlockNotClean(CacheBlockId),

    #[error("code page {page:#x} bucket {bucket} write_map is {recorded}, blocks cover it {actual} times")]
    WriteMapMismatch {
        page: u32,
        bucket: usize,
        recorded: u32,
        actual: u32,
    },

    #[error("code page pool exhausted ({capacity} handlers)")]
    CodePagePoolExhausted { capacity: usize },

    #[error("compiled code returned invalid block return code {0}")]
    InvalidReturnCode(u32),

    #[error("failed to make the code cache arena {mode} (os error {errno})")]
    ArenaProtection { mode: &'static str, errno: i32 },

    #[error("native execution of compiled blocks requires an x86-64 host")]
    UnsupportedHost,
}

/// Log `err` and abort.
#[cold]
#[track_caller]
pub fn fatal(err: FatalError) -> ! {
    tracing::error!(error = %err, "dynrec internal error");
    panic!("dynrec fatal: {err}");
}

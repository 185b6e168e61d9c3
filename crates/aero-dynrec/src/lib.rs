//! Dynamic recompiler ("dynrec") for 32-bit x86 guests.
//!
//! The crate translates runs of guest instructions into host machine code and keeps that code
//! coherent with guest memory:
//! - [`cache`]: the code cache arena. Variable-length [`CacheBlock`]s are carved out of one
//!   executable buffer, merged again when the write cursor wraps, and evicted oldest-first.
//! - [`link`]: direct block-to-block links with a bounded back-reference ring per block.
//! - [`page`]: per-guest-page write interception that invalidates compiled code overlapping
//!   a changed byte range.
//! - [`translate`] + [`emit`]: the decode loop and the narrow host code emission interface,
//!   with one x86-64 target.
//! - [`engine`]: [`JitEngine`], the single owner of all of the above plus the dispatch loop.
//!
//! Everything runs on one logical CPU thread; none of the structures lock internally.

pub mod block;
pub mod cache;
pub mod config;
pub mod context;
pub mod emit;
pub mod engine;
pub mod error;
pub mod link;
pub mod memory;
pub mod page;
pub mod translate;

mod exec_mem;
#[cfg(target_arch = "x86_64")]
mod helpers;

pub use block::{BlockType, CacheBlock, CacheBlockId, LinkRef, LinkSlot};
pub use cache::{CodeCache, DynrecStats};
pub use config::{ConfigError, DynrecConfig};
pub use context::{CpuState, DynContext, Gpr};
pub use emit::{BlockReturn, HostEmitter};
pub use engine::{CodeBus, Interpreter, JitEngine, RunExit, StepOutcome};
pub use error::{DynrecError, FatalError};
pub use memory::{GuestBus, GuestMemory, PageFlags};
pub use page::{CodePageHandler, CodePageId, CodePages, WriteOutcome};

// ---- Shared dynrec constants ------------------------------------------------------------------

/// 4KiB guest page shift. Blocks never span two guest pages.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_OFFSET_MASK: u32 = (PAGE_SIZE as u32) - 1;

/// A page is split into `PAGE_SIZE >> DYN_HASH_SHIFT` buckets for the block index.
pub const DYN_HASH_SHIFT: u32 = 4;
pub const DYN_PAGE_HASH: usize = PAGE_SIZE >> DYN_HASH_SHIFT;

/// Capacity of each block's back-reference ring.
pub const DYN_LINKS: usize = 16;

/// Host code alignment of split cache blocks.
pub const CACHE_ALIGN: usize = 16;

/// Guest arithmetic flags tracked by compiled code (CF PF AF ZF SF OF).
pub const FLAGS_ARITH_MASK: u32 = 0x0000_08D5;

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(DYN_PAGE_HASH > 0);
    assert!(DYN_PAGE_HASH.is_power_of_two());
    // Bucket indices are stored as `u16`.
    assert!(DYN_PAGE_HASH <= u16::MAX as usize + 1);

    assert!(DYN_LINKS > 0);
    assert!(CACHE_ALIGN.is_power_of_two());

    // CF | PF | AF | ZF | SF | OF.
    assert!(FLAGS_ARITH_MASK == (1 | (1 << 2) | (1 << 4) | (1 << 6) | (1 << 7) | (1 << 11)));
};

/// Bucket index of a page offset.
#[inline]
pub const fn page_bucket(offset: u32) -> usize {
    ((offset & PAGE_OFFSET_MASK) >> DYN_HASH_SHIFT) as usize
}

//! The code cache arena.
//!
//! One executable buffer holds everything compiled code needs:
//!
//! ```text
//! | stub area (run_code, link trampolines) | block region (cache_total) | overflow (max_block) |
//! ```
//!
//! The block region is carved into variable-length [`CacheBlock`]s threaded in host address
//! order. Exactly one of them is *active*: [`CodeCache::open_block`] grows it to at least
//! `max_block_bytes` by absorbing (and evicting) the regions that follow it, code is emitted
//! through the [`CodeSink`] impl, and [`CodeCache::close_block`] trims it, splitting off the
//! unused tail as a new free region. When the next region starts too close to the end of the
//! block region, the active pointer wraps back to the first block and the oldest code is
//! overwritten.
//!
//! Descriptors come from a fixed pool. Running out of them is fatal.
//!
//! The arena is executable except between `open_block` and `close_block`, when it is writable
//! instead.

use core::mem;

use tracing::debug;

use crate::block::{BlockLinks, BlockType, CacheBlock, CacheBlockId, LinkSlot};
use crate::config::DynrecConfig;
use crate::emit::{BlockReturn, CodeSink, HostEmitter};
use crate::error::{fatal, DynrecError, FatalError};
use crate::exec_mem::ExecBuffer;
use crate::page::CodePages;
use crate::CACHE_ALIGN;

/// Bytes reserved at the start of the arena for the fixed stubs.
pub const STUB_AREA: usize = 4096;
const LINK1_STUB: usize = 64;
const LINK2_STUB: usize = 96;
const TRAMPOLINE_SIZE: usize = 32;

/// Counters maintained by the cache and the dispatch loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynrecStats {
    pub blocks_compiled: u64,
    pub cache_hits: u64,
    pub links: u64,
    /// Predecessors force-unlinked because a back-reference ring was full.
    pub ring_evictions: u64,
    /// Blocks invalidated by guest writes.
    pub invalidations: u64,
    pub running_block_hits: u64,
    pub arena_wraps: u64,
    /// Live blocks overwritten by [`CodeCache::open_block`].
    pub evicted_blocks: u64,
    pub interpreter_steps: u64,
}

/// Block descriptors, the executable arena and its write cursor.
#[derive(Debug)]
pub struct CodeCache {
    buf: ExecBuffer,
    pub(crate) blocks: Vec<CacheBlock>,
    /// Host jump target of each outgoing link slot, indexed `id * 2 + slot`. Compiled exits jump
    /// indirectly through these, so linking never patches code.
    link_slots: Box<[usize]>,
    first: CacheBlockId,
    active: CacheBlockId,
    free: Option<CacheBlockId>,
    open: Option<CacheBlockId>,
    pos: usize,
    total: usize,
    max_block: usize,
    pub(crate) stats: DynrecStats,
}

impl CodeCache {
    pub fn new(config: &DynrecConfig, emitter: &dyn HostEmitter) -> Result<Self, DynrecError> {
        config.validate()?;
        let len = STUB_AREA + config.cache_total + config.max_block_bytes;
        let buf = ExecBuffer::new(len).map_err(|source| DynrecError::ExecMemory { len, source })?;

        let capacity = config.cache_blocks;
        let mut blocks = vec![CacheBlock::empty(); capacity];
        for (id, start) in [(CacheBlockId::LINK1, LINK1_STUB), (CacheBlockId::LINK2, LINK2_STUB)] {
            let tramp = &mut blocks[id.index()];
            tramp.cache_start = start;
            tramp.cache_size = TRAMPOLINE_SIZE;
        }

        let first = CacheBlockId::from_index(CacheBlockId::FIRST_POOLED as usize);
        blocks[first.index()].cache_start = STUB_AREA;
        blocks[first.index()].cache_size = config.cache_total;

        let mut free = None;
        for index in (first.index() + 1..capacity).rev() {
            blocks[index].next_free = free;
            free = Some(CacheBlockId::from_index(index));
        }

        let mut cache = Self {
            buf,
            blocks,
            link_slots: vec![0; capacity * 2].into_boxed_slice(),
            first,
            active: first,
            free,
            open: None,
            pos: 0,
            total: config.cache_total,
            max_block: config.max_block_bytes,
            stats: DynrecStats::default(),
        };

        emitter.run_code(&mut cache);
        cache.pos = LINK1_STUB;
        emitter.return_with(&mut cache, BlockReturn::Link1);
        cache.pos = LINK2_STUB;
        emitter.return_with(&mut cache, BlockReturn::Link2);
        cache.pos = STUB_AREA;
        cache
            .buf
            .make_executable()
            .map_err(|source| DynrecError::ExecMemory { len, source })?;

        for index in 0..capacity {
            cache.reset_link_slots(CacheBlockId::from_index(index));
        }
        Ok(cache)
    }

    /// Number of descriptors, including the two trampolines.
    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: CacheBlockId) -> &CacheBlock {
        &self.blocks[id.index()]
    }

    pub(crate) fn block_mut(&mut self, id: CacheBlockId) -> &mut CacheBlock {
        &mut self.blocks[id.index()]
    }

    /// Host address of the `run_code` entry stub.
    pub fn run_code_addr(&self) -> usize {
        self.buf.base_addr()
    }

    /// Host address of a block's first instruction.
    pub fn entry_addr(&self, id: CacheBlockId) -> usize {
        self.buf.base_addr() + self.block(id).cache_start
    }

    /// Host address of the link slot `id` exits through.
    pub fn link_slot_addr(&self, id: CacheBlockId, slot: LinkSlot) -> usize {
        &self.link_slots[id.index() * 2 + slot.index()] as *const usize as usize
    }

    /// Current jump target of `id`'s `slot` exit.
    pub fn link_slot_target(&self, id: CacheBlockId, slot: LinkSlot) -> usize {
        self.link_slots[id.index() * 2 + slot.index()]
    }

    pub(crate) fn set_link_slot(&mut self, id: CacheBlockId, slot: LinkSlot, to: CacheBlockId) {
        let target = self.entry_addr(to);
        self.link_slots[id.index() * 2 + slot.index()] = target;
    }

    fn reset_link_slots(&mut self, id: CacheBlockId) {
        for slot in LinkSlot::ALL {
            self.set_link_slot(id, slot, CacheBlockId::trampoline(slot));
        }
    }

    /// Host code of a block.
    pub fn code(&self, id: CacheBlockId) -> &[u8] {
        let block = self.block(id);
        &self.buf.as_slice()[block.cache_start..block.cache_start + block.cache_size]
    }

    /// Arena offset of the next emitted byte.
    pub fn write_cursor(&self) -> usize {
        self.pos
    }

    /// The block [`Self::open_block`] will hand out next.
    pub fn active(&self) -> CacheBlockId {
        self.active
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Arena blocks in host address order.
    pub fn arena(&self) -> impl Iterator<Item = CacheBlockId> + '_ {
        core::iter::successors(Some(self.first), move |&id| self.block(id).next)
    }

    /// Live blocks in host address order.
    pub fn live_blocks(&self) -> impl Iterator<Item = CacheBlockId> + '_ {
        self.arena().filter(move |&id| self.block(id).is_live())
    }

    /// Unused descriptors left in the pool.
    pub fn free_descriptors(&self) -> usize {
        core::iter::successors(self.free, |&id| self.block(id).next_free).count()
    }

    pub fn stats(&self) -> &DynrecStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut DynrecStats {
        &mut self.stats
    }

    fn get_block(&mut self) -> CacheBlockId {
        let Some(id) = self.free else {
            fatal(FatalError::BlockPoolExhausted {
                capacity: self.capacity(),
            });
        };
        let block = self.block_mut(id);
        let next = block.next_free.take();
        self.free = next;
        id
    }

    fn add_unused_block(&mut self, id: CacheBlockId) {
        let free = self.free;
        let block = self.block_mut(id);
        let generation = block.generation;
        *block = CacheBlock {
            generation,
            next_free: free,
            ..CacheBlock::empty()
        };
        self.free = Some(id);
    }

    /// Open the active block for emission and return it.
    ///
    /// Any compiled code in the active region and in the regions absorbed to reach
    /// `max_block_bytes` is reset first.
    pub fn open_block(&mut self, pages: &mut CodePages) -> CacheBlockId {
        if self.open.is_some() {
            fatal(FatalError::ArenaCorrupted("open_block while a block is open"));
        }
        if let Err(err) = self.buf.make_writable() {
            fatal(FatalError::ArenaProtection {
                mode: "writable",
                errno: err.raw_os_error().unwrap_or(0),
            });
        }
        let id = self.active;
        if self.block(id).is_live() {
            self.reset(pages, id);
            self.stats.evicted_blocks += 1;
        }

        let mut size = self.block(id).cache_size;
        let mut next = self.block(id).next;
        while size < self.max_block {
            let Some(absorbed) = next else {
                break;
            };
            size += self.block(absorbed).cache_size;
            next = self.block(absorbed).next;
            if self.block(absorbed).is_live() {
                self.reset(pages, absorbed);
                self.stats.evicted_blocks += 1;
            }
            self.add_unused_block(absorbed);
        }

        let block = self.block_mut(id);
        block.cache_size = size;
        block.next = next;
        self.pos = block.cache_start;
        self.open = Some(id);
        id
    }

    /// Close the open block as `block_type` with every exit unlinked, and advance the active
    /// pointer.
    pub fn close_block(&mut self, block_type: BlockType) -> CacheBlockId {
        let Some(id) = self.open.take() else {
            fatal(FatalError::ArenaCorrupted("close_block without an open block"));
        };
        let (start, size, next) = {
            let block = self.block(id);
            (block.cache_start, block.cache_size, block.next)
        };
        let written = self.pos - start;

        let block = self.block_mut(id);
        block.block_type = block_type;
        block.links = BlockLinks::unlinked();
        block.generation = block.generation.wrapping_add(1);
        self.reset_link_slots(id);

        if written > size {
            // Only the last region may spill into the overflow area.
            if next.is_some() || written > size + self.max_block {
                fatal(FatalError::BlockOverrun { written, size });
            }
            self.block_mut(id).cache_size = written;
        } else if size - written > CACHE_ALIGN {
            let new_size = ((written.max(1) - 1) | (CACHE_ALIGN - 1)) + 1;
            let tail = self.get_block();
            let tail_block = self.block_mut(tail);
            tail_block.cache_start = start + new_size;
            tail_block.cache_size = size - new_size;
            tail_block.next = next;
            let block = self.block_mut(id);
            block.next = Some(tail);
            block.cache_size = new_size;
        }

        let next = self.block(id).next;
        let wrap_at = STUB_AREA + self.total - self.max_block;
        match next {
            Some(n) if self.block(n).cache_start <= wrap_at => self.active = n,
            _ => {
                self.active = self.first;
                self.stats.arena_wraps += 1;
                debug!(block = %id, "code cache wrapped");
            }
        }
        self.stats.blocks_compiled += 1;

        if let Err(err) = self.buf.make_executable() {
            fatal(FatalError::ArenaProtection {
                mode: "executable",
                errno: err.raw_os_error().unwrap_or(0),
            });
        }
        id
    }

    /// Tear down a block: drop it from its code page, unlink it in both directions and mark
    /// it free. The arena region stays in place.
    pub fn reset(&mut self, pages: &mut CodePages, id: CacheBlockId) {
        if id.is_trampoline() {
            return;
        }
        pages.del_cache_block(self, id);
        self.reset_detached(id);
    }

    /// [`Self::reset`] for a block already removed from its code page.
    pub(crate) fn reset_detached(&mut self, id: CacheBlockId) {
        let links = mem::replace(&mut self.block_mut(id).links, BlockLinks::unlinked());
        for slot in LinkSlot::ALL {
            let target = links.to[slot.index()];
            if !target.is_trampoline() {
                self.clear_link_from(target, id);
            }
        }
        for source in links.from.iter().flatten() {
            self.clear_link_to(source.block, id);
        }
        self.reset_link_slots(id);

        let block = self.block_mut(id);
        block.block_type = BlockType::Free;
        block.code_page = None;
    }

    fn overrun(&self) -> ! {
        let (written, size) = match self.open {
            Some(id) => {
                let block = self.block(id);
                (self.pos - block.cache_start, block.cache_size)
            }
            None => (self.pos, STUB_AREA),
        };
        fatal(FatalError::BlockOverrun { written, size })
    }

    /// Check the arena list and descriptor accounting.
    pub fn check_arena(&self) -> Result<(), FatalError> {
        let mut expected = STUB_AREA;
        let mut count = 0;
        for id in self.arena() {
            let block = self.block(id);
            if block.cache_start != expected {
                return Err(FatalError::ArenaCorrupted("arena regions are not contiguous"));
            }
            expected += block.cache_size;
            count += 1;
            if !block.is_live() {
                let clean = block.code_page.is_none()
                    && block.link_from().next().is_none()
                    && LinkSlot::ALL
                        .iter()
                        .all(|&s| block.link_to(s) == CacheBlockId::trampoline(s));
                if !clean {
                    return Err(FatalError::FreeBlockNotClean(id));
                }
            }
        }
        if count + self.free_descriptors() + CacheBlockId::FIRST_POOLED as usize != self.capacity()
        {
            return Err(FatalError::ArenaCorrupted("descriptors leaked from the pool"));
        }
        Ok(())
    }
}

impl CodeSink for CodeCache {
    fn pos(&self) -> usize {
        self.pos
    }

    fn host_addr(&self, pos: usize) -> usize {
        self.buf.base_addr() + pos
    }

    fn add_u8(&mut self, value: u8) {
        if self.pos >= self.buf.len() {
            self.overrun();
        }
        let pos = self.pos;
        self.buf.as_mut_slice()[pos] = value;
        self.pos += 1;
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        self.buf.as_mut_slice()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::X64Emitter;

    fn small() -> DynrecConfig {
        DynrecConfig {
            cache_total: 4096,
            max_block_bytes: 1024,
            cache_blocks: 64,
            code_pages: 4,
            ..DynrecConfig::default()
        }
    }

    fn fill(cache: &mut CodeCache, bytes: usize) {
        for _ in 0..bytes {
            cache.add_u8(0x90);
        }
    }

    #[test]
    fn fresh_arena_is_one_free_region() {
        let cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let regions: Vec<_> = cache.arena().collect();
        assert_eq!(regions.len(), 1);
        assert_eq!(cache.block(regions[0]).cache_size(), 4096);
        assert_eq!(cache.free_descriptors(), 64 - 3);
        assert_eq!(cache.write_cursor(), STUB_AREA);
        cache.check_arena().unwrap();

        // Unlinked slots point at the trampolines.
        let id = regions[0];
        assert_eq!(
            cache.link_slot_target(id, LinkSlot::Link2),
            cache.entry_addr(CacheBlockId::LINK2)
        );
        assert_eq!(cache.code(CacheBlockId::LINK1)[..6], [0xB8, 2, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn close_splits_off_an_aligned_tail() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        let id = cache.open_block(&mut pages);
        assert_eq!(cache.block(id).cache_size(), 4096);
        fill(&mut cache, 37);
        assert_eq!(cache.close_block(BlockType::Normal), id);

        let block = cache.block(id);
        assert_eq!(block.cache_size(), 48);
        let tail = block.next.unwrap();
        assert_eq!(cache.block(tail).cache_start(), STUB_AREA + 48);
        assert_eq!(cache.block(tail).cache_size(), 4096 - 48);
        assert_eq!(cache.active(), tail);
        assert_eq!(block.generation(), 1);
        cache.check_arena().unwrap();
    }

    #[test]
    fn small_leftovers_are_not_split() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        let id = cache.open_block(&mut pages);
        fill(&mut cache, 4096 - CACHE_ALIGN);
        cache.close_block(BlockType::Normal);
        assert_eq!(cache.block(id).cache_size(), 4096);
        assert!(cache.block(id).next.is_none());
        // Nothing left to hand out: wrap.
        assert_eq!(cache.active(), id);
        assert_eq!(cache.stats().arena_wraps, 1);
    }

    #[test]
    fn arena_is_only_writable_while_a_block_is_open() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        assert!(!cache.buf.is_writable());
        assert!(!cache.is_open());

        let id = cache.open_block(&mut pages);
        assert!(cache.is_open());
        assert!(cache.buf.is_writable());
        fill(&mut cache, 16);
        cache.close_block(BlockType::Normal);
        assert!(!cache.is_open());
        assert!(!cache.buf.is_writable());
        assert!(cache.code(id).iter().all(|&b| b == 0x90));
    }

    #[test]
    fn last_region_may_spill_into_the_overflow() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        let id = cache.open_block(&mut pages);
        let size = cache.block(id).cache_size();
        assert!(cache.block(id).next.is_none());

        fill(&mut cache, size + 500);
        cache.close_block(BlockType::Normal);
        assert_eq!(cache.block(id).cache_size(), size + 500);
        assert_eq!(cache.active(), id);
        cache.check_arena().unwrap();
    }

    #[test]
    #[should_panic(expected = "block overran scratch space")]
    fn spilling_past_the_overflow_is_fatal() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        let id = cache.open_block(&mut pages);
        let size = cache.block(id).cache_size();
        fill(&mut cache, size + 1024 + 1);
        cache.close_block(BlockType::Normal);
    }

    #[test]
    #[should_panic(expected = "block overran scratch space")]
    fn overrunning_a_middle_region_is_fatal() {
        let mut cache = CodeCache::new(&small(), &X64Emitter).unwrap();
        let mut pages = CodePages::new(4, 16);
        cache.open_block(&mut pages);
        fill(&mut cache, 1024);
        cache.close_block(BlockType::Normal);

        // Carve the rest of the arena into 1024 byte blocks until the cursor wraps.
        let second = cache.open_block(&mut pages);
        fill(&mut cache, 1024);
        cache.close_block(BlockType::Normal);
        assert!(cache.block(second).next.is_some());

        while cache.active() != cache.first {
            let _ = cache.open_block(&mut pages);
            fill(&mut cache, 1024);
            cache.close_block(BlockType::Normal);
        }
        let first = cache.open_block(&mut pages);
        assert_eq!(first, cache.first);
        // Already max_block long, so nothing is absorbed and `second` still follows it.
        let size = cache.block(first).cache_size();
        fill(&mut cache, size + 1);
        cache.close_block(BlockType::Normal);
    }
}

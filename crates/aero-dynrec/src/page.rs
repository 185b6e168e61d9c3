//! Code page handlers: per-page block indices and write interception.
//!
//! Every guest page that compiled code was read from gets a [`CodePageHandler`] from the
//! [`CodePages`] pool. The handler indexes the page's blocks by the bucket their source range
//! starts in and counts, per bucket, how many blocks cover it (`write_map`). A write that changes
//! memory in a covered bucket invalidates every block whose source range overlaps the written
//! bytes before the new value is stored.

use std::collections::VecDeque;

use tracing::debug;

use crate::block::CacheBlockId;
use crate::cache::CodeCache;
use crate::error::{fatal, FatalError};
use crate::memory::{GuestMemory, PageFlags};
use crate::{page_bucket, DYN_PAGE_HASH, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Index of a [`CodePageHandler`] in the [`CodePages`] pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePageId(u16);

impl CodePageId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a guest write did to memory and the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The page is ROM (or outside guest memory); nothing was stored.
    Ignored,
    /// Memory already held the value; nothing was stored or invalidated.
    Unchanged,
    /// The value was stored; no compiled code covers the written bytes.
    Written,
    /// The value was stored and the page's handler, idle for long enough, was released.
    Released,
    /// Compiled code covered the written bytes: `blocks` overlapping blocks were invalidated
    /// before the value was stored.
    Invalidated { blocks: usize, hit_running: bool },
}

impl WriteOutcome {
    fn merge(self, other: WriteOutcome) -> WriteOutcome {
        use WriteOutcome::*;
        match (self, other) {
            (
                Invalidated {
                    blocks: a,
                    hit_running: ra,
                },
                Invalidated {
                    blocks: b,
                    hit_running: rb,
                },
            ) => Invalidated {
                blocks: a + b,
                hit_running: ra || rb,
            },
            (inv @ Invalidated { .. }, _) | (_, inv @ Invalidated { .. }) => inv,
            (Released, _) | (_, Released) => Released,
            (Written, _) | (_, Written) => Written,
            (Unchanged, _) | (_, Unchanged) => Unchanged,
            (Ignored, Ignored) => Ignored,
        }
    }

    /// `true` if the block that was running when the write happened has been invalidated.
    pub fn hit_running(self) -> bool {
        matches!(
            self,
            WriteOutcome::Invalidated {
                hit_running: true,
                ..
            }
        )
    }
}

/// Block index and write interceptor of one guest page.
#[derive(Debug)]
pub struct CodePageHandler {
    guest_page: u32,
    /// Blocks by the bucket their source range starts in, oldest first.
    hash_map: Vec<Vec<CacheBlockId>>,
    /// Number of indexed blocks whose source range covers each bucket.
    write_map: Box<[u32; DYN_PAGE_HASH]>,
    /// Saturating per-byte count of changing writes to covered bytes.
    invalidation_map: Option<Box<[u8; PAGE_SIZE]>>,
    active_blocks: u32,
    /// Writes left before an idle handler is released.
    active_count: u32,
    release_delay: u32,
}

impl CodePageHandler {
    fn new(release_delay: u32) -> Self {
        Self {
            guest_page: 0,
            hash_map: vec![Vec::new(); DYN_PAGE_HASH],
            write_map: Box::new([0; DYN_PAGE_HASH]),
            invalidation_map: None,
            active_blocks: 0,
            active_count: release_delay,
            release_delay,
        }
    }

    fn setup(&mut self, guest_page: u32) {
        self.guest_page = guest_page;
        self.hash_map.iter_mut().for_each(Vec::clear);
        self.write_map.fill(0);
        self.invalidation_map = None;
        self.active_blocks = 0;
        self.active_count = self.release_delay;
    }

    pub fn guest_page(&self) -> u32 {
        self.guest_page
    }

    /// Number of blocks currently indexed.
    pub fn active_blocks(&self) -> u32 {
        self.active_blocks
    }

    pub fn write_map(&self, bucket: usize) -> u32 {
        self.write_map[bucket]
    }

    /// Blocks whose source range starts in `bucket`, oldest first.
    pub fn bucket_blocks(&self, bucket: usize) -> &[CacheBlockId] {
        &self.hash_map[bucket]
    }

    /// Changing writes seen at page offset `offset`.
    pub fn invalidation_count(&self, offset: u32) -> u8 {
        self.invalidation_map
            .as_ref()
            .map_or(0, |map| map[(offset & PAGE_OFFSET_MASK) as usize])
    }

    fn covered(&self, first: usize, last: usize) -> u32 {
        self.write_map[first..=last].iter().sum()
    }

    /// Index `id` under the page-relative source range `[start, end]`.
    pub(crate) fn add_cache_block(
        &mut self,
        cache: &mut CodeCache,
        self_id: CodePageId,
        id: CacheBlockId,
        start: u16,
        end: u16,
    ) {
        let end = end.min(PAGE_OFFSET_MASK as u16);
        let first = page_bucket(u32::from(start));
        let last = page_bucket(u32::from(end));

        self.hash_map[first].push(id);
        for count in &mut self.write_map[first..=last] {
            *count += 1;
        }
        self.active_blocks += 1;

        let block = cache.block_mut(id);
        block.page_start = start;
        block.page_end = end;
        block.page_first = first as u16;
        block.page_last = last as u16;
        block.guest_page = self.guest_page;
        block.code_page = Some(self_id);
    }

    /// Drop `id` from the index.
    pub(crate) fn del_cache_block(&mut self, cache: &mut CodeCache, id: CacheBlockId) {
        let block = cache.block_mut(id);
        let (first, last) = (block.page_first as usize, block.page_last as usize);
        block.code_page = None;

        let bucket = &mut self.hash_map[first];
        match bucket.iter().position(|&b| b == id) {
            Some(pos) => {
                bucket.remove(pos);
            }
            None => fatal(FatalError::ArenaCorrupted(
                "block missing from its code page bucket",
            )),
        }
        self.uncover(first, last);
    }

    fn uncover(&mut self, first: usize, last: usize) {
        for count in &mut self.write_map[first..=last] {
            *count = count.saturating_sub(1);
        }
        self.active_blocks = self.active_blocks.saturating_sub(1);
        self.active_count = self.release_delay;
    }

    /// Most recently indexed live block starting exactly at page offset `start`.
    pub fn find_cache_block(&self, cache: &CodeCache, start: u16) -> Option<CacheBlockId> {
        self.hash_map[page_bucket(u32::from(start))]
            .iter()
            .rev()
            .copied()
            .find(|&id| cache.block(id).page_start == start)
    }

    /// Invalidate every indexed block whose source range overlaps `[start, end]`.
    ///
    /// Returns the number of blocks invalidated and whether `running` was among them.
    pub(crate) fn invalidate_range(
        &mut self,
        cache: &mut CodeCache,
        start: u16,
        end: u16,
        running: Option<CacheBlockId>,
    ) -> (usize, bool) {
        let end = end.min(PAGE_OFFSET_MASK as u16);
        let (first, last) = (
            page_bucket(u32::from(start)),
            page_bucket(u32::from(end)),
        );
        let mut invalidated = 0;
        let mut hit_running = false;

        // Blocks are indexed by their start bucket, so any overlapping block starts at or
        // below `last`.
        for bucket in (0..=last).rev() {
            if self.covered(first, last) == 0 {
                break;
            }
            let hits: Vec<CacheBlockId> = self.hash_map[bucket]
                .iter()
                .copied()
                .filter(|&id| cache.block(id).overlaps(start, end))
                .collect();
            if hits.is_empty() {
                continue;
            }
            self.hash_map[bucket].retain(|id| !hits.contains(id));

            for id in hits {
                let block = cache.block_mut(id);
                let (b_first, b_last) = (block.page_first as usize, block.page_last as usize);
                block.code_page = None;
                self.uncover(b_first, b_last);

                if Some(id) == running {
                    hit_running = true;
                    debug!(
                        block = %id,
                        page = format_args!("{:#x}", self.guest_page),
                        start,
                        end,
                        "write invalidated the running block"
                    );
                }
                cache.reset_detached(id);
                invalidated += 1;
            }
        }

        let stats = cache.stats_mut();
        stats.invalidations += invalidated as u64;
        if hit_running {
            stats.running_block_hits += 1;
        }
        (invalidated, hit_running)
    }

    /// Apply a changing write of `len` bytes at page offset `offset`, before it is stored.
    fn on_write(
        &mut self,
        cache: &mut CodeCache,
        offset: u16,
        len: u16,
        running: Option<CacheBlockId>,
    ) -> WriteOutcome {
        let end = offset + len - 1;
        let (first, last) = (
            page_bucket(u32::from(offset)),
            page_bucket(u32::from(end)),
        );
        if self.covered(first, last) == 0 {
            if self.active_blocks > 0 {
                return WriteOutcome::Written;
            }
            self.active_count = self.active_count.saturating_sub(1);
            return if self.active_count == 0 {
                WriteOutcome::Released
            } else {
                WriteOutcome::Written
            };
        }

        let map = self
            .invalidation_map
            .get_or_insert_with(|| Box::new([0; PAGE_SIZE]));
        for count in &mut map[usize::from(offset)..=usize::from(end)] {
            *count = count.saturating_add(1);
        }

        let (blocks, hit_running) = self.invalidate_range(cache, offset, end, running);
        WriteOutcome::Invalidated {
            blocks,
            hit_running,
        }
    }

    /// Unhook every indexed block and return them.
    fn detach_all(&mut self, cache: &mut CodeCache) -> Vec<CacheBlockId> {
        let blocks: Vec<CacheBlockId> = self.hash_map.iter_mut().flat_map(|b| b.drain(..)).collect();
        for &id in &blocks {
            cache.block_mut(id).code_page = None;
        }
        self.write_map.fill(0);
        self.active_blocks = 0;
        blocks
    }

    fn check_write_map(&self, cache: &CodeCache, self_id: CodePageId) -> Result<(), FatalError> {
        let mut actual = [0u32; DYN_PAGE_HASH];
        for (bucket, ids) in self.hash_map.iter().enumerate() {
            for &id in ids {
                let block = cache.block(id);
                if !block.is_live()
                    || block.code_page != Some(self_id)
                    || block.page_first as usize != bucket
                {
                    return Err(FatalError::ArenaCorrupted(
                        "code page indexes a block it does not own",
                    ));
                }
                for count in &mut actual[block.page_first as usize..=block.page_last as usize] {
                    *count += 1;
                }
            }
        }
        for (bucket, (&recorded, &actual)) in self.write_map.iter().zip(&actual).enumerate() {
            if recorded != actual {
                return Err(FatalError::WriteMapMismatch {
                    page: self.guest_page,
                    bucket,
                    recorded,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Fixed pool of [`CodePageHandler`]s.
#[derive(Debug)]
pub struct CodePages {
    handlers: Vec<CodePageHandler>,
    free: Vec<CodePageId>,
    /// Installed handlers, oldest first.
    used: VecDeque<CodePageId>,
}

impl CodePages {
    pub fn new(capacity: usize, release_delay: u32) -> Self {
        Self {
            handlers: (0..capacity)
                .map(|_| CodePageHandler::new(release_delay))
                .collect(),
            free: (0..capacity as u16).rev().map(CodePageId).collect(),
            used: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.handlers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Installed handlers, oldest first.
    pub fn used(&self) -> impl Iterator<Item = CodePageId> + '_ {
        self.used.iter().copied()
    }

    pub fn handler(&self, id: CodePageId) -> &CodePageHandler {
        &self.handlers[id.index()]
    }

    /// Handler of `page`, installing one if needed. `None` if the page may not hold code.
    pub(crate) fn make_code_page(
        &mut self,
        mem: &mut GuestMemory,
        cache: &mut CodeCache,
        page: u32,
    ) -> Option<CodePageId> {
        if let Some(id) = mem.code_page(page) {
            return Some(id);
        }
        if page as usize >= mem.page_count() {
            return None;
        }
        if mem.flags(page).contains(PageFlags::NO_CODE) {
            return None;
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let Some(&oldest) = self.used.front() else {
                    fatal(FatalError::CodePagePoolExhausted {
                        capacity: self.capacity(),
                    });
                };
                self.clear_release(mem, cache, oldest);
                match self.free.pop() {
                    Some(id) => id,
                    None => fatal(FatalError::CodePagePoolExhausted {
                        capacity: self.capacity(),
                    }),
                }
            }
        };

        self.handlers[id.index()].setup(page);
        self.used.push_back(id);
        mem.attach_code_page(page, id);
        debug!(page = format_args!("{page:#x}"), handler = id.index(), "installed code page");
        Some(id)
    }

    /// Uninstall an idle handler and clear the page's HAS_CODE flag.
    pub(crate) fn release(&mut self, mem: &mut GuestMemory, id: CodePageId) {
        let handler = &mut self.handlers[id.index()];
        if handler.active_blocks != 0 {
            fatal(FatalError::ArenaCorrupted("released a code page that still has blocks"));
        }
        let page = handler.guest_page;
        handler.setup(0);
        mem.detach_code_page(page);
        self.used.retain(|&u| u != id);
        self.free.push(id);
        debug!(page = format_args!("{page:#x}"), "released code page");
    }

    /// Invalidate all of a handler's blocks, then release it.
    pub(crate) fn clear_release(
        &mut self,
        mem: &mut GuestMemory,
        cache: &mut CodeCache,
        id: CodePageId,
    ) {
        for block in self.handlers[id.index()].detach_all(cache) {
            cache.reset_detached(block);
        }
        self.release(mem, id);
    }

    /// Clear-release every installed handler.
    pub(crate) fn clear_all(&mut self, mem: &mut GuestMemory, cache: &mut CodeCache) {
        while let Some(&id) = self.used.front() {
            self.clear_release(mem, cache, id);
        }
    }

    pub(crate) fn add_cache_block(
        &mut self,
        cache: &mut CodeCache,
        page: CodePageId,
        id: CacheBlockId,
        start: u16,
        end: u16,
    ) {
        self.handlers[page.index()].add_cache_block(cache, page, id, start, end);
    }

    /// Drop `id` from the index of the handler it is registered with, if any.
    pub(crate) fn del_cache_block(&mut self, cache: &mut CodeCache, id: CacheBlockId) {
        if let Some(page) = cache.block(id).code_page {
            self.handlers[page.index()].del_cache_block(cache, id);
        }
    }

    pub fn find_cache_block(
        &self,
        mem: &GuestMemory,
        cache: &CodeCache,
        addr: u32,
    ) -> Option<CacheBlockId> {
        let page = mem.code_page(addr >> PAGE_SHIFT)?;
        self.handler(page)
            .find_cache_block(cache, (addr & PAGE_OFFSET_MASK) as u16)
    }

    /// Invalidate blocks overlapping the guest range `[start, end]`, which may span pages.
    pub(crate) fn invalidate_range(
        &mut self,
        mem: &GuestMemory,
        cache: &mut CodeCache,
        start: u32,
        end: u32,
        running: Option<CacheBlockId>,
    ) -> (usize, bool) {
        let mut total = 0;
        let mut hit_running = false;
        if end < start {
            return (0, false);
        }
        for page in (start >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            let Some(id) = mem.code_page(page) else {
                continue;
            };
            let page_base = page << PAGE_SHIFT;
            let lo = start.max(page_base) - page_base;
            let hi = end.min(page_base | PAGE_OFFSET_MASK) - page_base;
            let (n, hit) =
                self.handlers[id.index()].invalidate_range(cache, lo as u16, hi as u16, running);
            total += n;
            hit_running |= hit;
        }
        (total, hit_running)
    }

    /// Store `len` bytes of `value` at `addr`, invalidating overlapping compiled code first.
    ///
    /// Writes whose value equals the bytes already in memory take no action at all.
    pub(crate) fn write(
        &mut self,
        mem: &mut GuestMemory,
        cache: &mut CodeCache,
        addr: u32,
        len: usize,
        value: u32,
        running: Option<CacheBlockId>,
    ) -> WriteOutcome {
        debug_assert!(matches!(len, 1 | 2 | 4));
        let last = addr.wrapping_add(len as u32 - 1);
        if last < addr || last >> PAGE_SHIFT != addr >> PAGE_SHIFT {
            // Page-crossing: handle each byte against its own page.
            return (0..len).fold(WriteOutcome::Ignored, |acc, i| {
                let byte = (value >> (8 * i)) & 0xFF;
                acc.merge(self.write(mem, cache, addr.wrapping_add(i as u32), 1, byte, running))
            });
        }

        let page = addr >> PAGE_SHIFT;
        if !mem.contains(addr) || mem.flags(page).contains(PageFlags::HAS_ROM) {
            return WriteOutcome::Ignored;
        }
        let value = if len == 4 {
            value
        } else {
            value & ((1u32 << (8 * len)) - 1)
        };
        if mem.read_sized(addr, len) == value {
            return WriteOutcome::Unchanged;
        }

        let outcome = match mem.code_page(page) {
            Some(id) => self.handlers[id.index()].on_write(
                cache,
                (addr & PAGE_OFFSET_MASK) as u16,
                len as u16,
                running,
            ),
            None => WriteOutcome::Written,
        };

        for (i, b) in value.to_le_bytes().into_iter().take(len).enumerate() {
            mem.store_u8(addr + i as u32, b);
        }

        if outcome == WriteOutcome::Released {
            if let Some(id) = mem.code_page(page) {
                self.release(mem, id);
            }
        }
        outcome
    }

    pub(crate) fn check_write_maps(&self, cache: &CodeCache) -> Result<(), FatalError> {
        for &id in &self.used {
            self.handler(id).check_write_map(cache, id)?;
        }
        Ok(())
    }
}

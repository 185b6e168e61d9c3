//! Direct block-to-block links.
//!
//! `from.link_to(slot) == to` means `from`'s `slot` exit jumps straight into `to`. Each target
//! remembers its predecessors in a ring of [`DYN_LINKS`] back-references so that resetting it
//! can restore every predecessor's exit to the trampoline. The ring is overwritten in insertion
//! order; the predecessor whose entry is overwritten is unlinked.

use tracing::debug;

use crate::block::{BlockType, CacheBlockId, LinkRef, LinkSlot};
use crate::cache::CodeCache;
use crate::error::{fatal, FatalError};
use crate::DYN_LINKS;

impl CodeCache {
    /// Make `from`'s `slot` exit jump directly to `to`.
    pub fn link(&mut self, from: CacheBlockId, slot: LinkSlot, to: CacheBlockId) {
        if !to.is_trampoline() && !self.block(to).is_live() {
            fatal(FatalError::DanglingLink { from, slot, to });
        }
        if self.block(from).block_type().link_count() <= slot.index() {
            fatal(FatalError::ArenaCorrupted("linked an exit the block does not have"));
        }

        let current = self.block(from).link_to(slot);
        if current == to {
            return;
        }
        if !current.is_trampoline() {
            self.drop_back_reference(current, LinkRef { block: from, slot });
        }

        if !to.is_trampoline() {
            let ring = &mut self.block_mut(to).links;
            let index = ring.from_index;
            let evicted = ring.from[index].replace(LinkRef { block: from, slot });
            ring.from_index = (index + 1) % DYN_LINKS;

            if let Some(old) = evicted {
                if self.block(old.block).link_to(old.slot) == to {
                    self.unlink_slot(old.block, old.slot);
                    self.stats.ring_evictions += 1;
                    debug!(target_block = %to, evicted = %old.block, slot = ?old.slot, "back-reference ring full");
                }
            }
        }

        self.block_mut(from).links.to[slot.index()] = to;
        self.set_link_slot(from, slot, to);
        self.stats.links += 1;
        debug!(%from, ?slot, %to, "linked blocks");
    }

    /// Point every exit of `block` that targets `target` back at its trampoline.
    pub fn clear_link_to(&mut self, block: CacheBlockId, target: CacheBlockId) {
        for slot in LinkSlot::ALL {
            if self.block(block).link_to(slot) == target {
                self.unlink_slot(block, slot);
            }
        }
    }

    /// Remove every back-reference to `source` from `block`'s ring.
    pub fn clear_link_from(&mut self, block: CacheBlockId, source: CacheBlockId) {
        for entry in &mut self.block_mut(block).links.from {
            if entry.is_some_and(|r| r.block == source) {
                *entry = None;
            }
        }
    }

    fn unlink_slot(&mut self, block: CacheBlockId, slot: LinkSlot) {
        self.block_mut(block).links.to[slot.index()] = CacheBlockId::trampoline(slot);
        self.set_link_slot(block, slot, CacheBlockId::trampoline(slot));
    }

    fn drop_back_reference(&mut self, block: CacheBlockId, link: LinkRef) {
        for entry in &mut self.block_mut(block).links.from {
            if *entry == Some(link) {
                *entry = None;
            }
        }
    }

    /// Verify link symmetry: every non-trampoline link has a back-reference in its target's
    /// ring, every ring entry names a live link, and link slots hold their target's address.
    pub fn check_links(&self) -> Result<(), FatalError> {
        for index in CacheBlockId::FIRST_POOLED as usize..self.capacity() {
            let id = CacheBlockId::from_index(index);
            let block = self.block(id);
            for slot in LinkSlot::ALL {
                let to = block.link_to(slot);
                if self.link_slot_target(id, slot) != self.entry_addr(to) {
                    return Err(FatalError::ArenaCorrupted("link slot disagrees with link target"));
                }
                if to.is_trampoline() {
                    continue;
                }
                if !self.block(to).is_live() {
                    return Err(FatalError::DanglingLink { from: id, slot, to });
                }
                if block.block_type() == BlockType::Free {
                    return Err(FatalError::FreeBlockNotClean(id));
                }
                let link = LinkRef { block: id, slot };
                if !self.block(to).link_from().any(|r| r == link) {
                    return Err(FatalError::MissingBackReference { from: id, slot, to });
                }
            }
            for r in block.link_from() {
                if self.block(r.block).link_to(r.slot) != id {
                    return Err(FatalError::StaleBackReference {
                        from: r.block,
                        slot: r.slot,
                        to: id,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynrecConfig;
    use crate::emit::{CodeSink, X64Emitter};
    use crate::page::CodePages;

    fn compiled(cache: &mut CodeCache, pages: &mut CodePages, ty: BlockType) -> CacheBlockId {
        cache.open_block(pages);
        cache.add_u8(0xC3);
        cache.close_block(ty)
    }

    fn setup() -> (CodeCache, CodePages) {
        let config = DynrecConfig {
            cache_total: 64 * 1024,
            max_block_bytes: 512,
            cache_blocks: 256,
            ..DynrecConfig::default()
        };
        (
            CodeCache::new(&config, &X64Emitter).unwrap(),
            CodePages::new(4, 16),
        )
    }

    #[test]
    fn relinking_moves_the_back_reference() {
        let (mut cache, mut pages) = setup();
        let a = compiled(&mut cache, &mut pages, BlockType::SingleLink);
        let b = compiled(&mut cache, &mut pages, BlockType::Normal);
        let c = compiled(&mut cache, &mut pages, BlockType::Normal);

        cache.link(a, LinkSlot::Link1, b);
        cache.link(a, LinkSlot::Link1, c);
        assert_eq!(cache.block(a).link_to(LinkSlot::Link1), c);
        assert_eq!(cache.block(b).link_from().count(), 0);
        assert_eq!(cache.block(c).link_from().count(), 1);
        assert_eq!(cache.link_slot_target(a, LinkSlot::Link1), cache.entry_addr(c));
        cache.check_links().unwrap();
    }

    #[test]
    fn dual_link_to_the_same_target_records_both_slots() {
        let (mut cache, mut pages) = setup();
        let a = compiled(&mut cache, &mut pages, BlockType::DualLink);
        let b = compiled(&mut cache, &mut pages, BlockType::Normal);
        cache.link(a, LinkSlot::Link1, b);
        cache.link(a, LinkSlot::Link2, b);
        assert_eq!(cache.block(b).link_from().count(), 2);

        cache.clear_link_to(a, b);
        assert_eq!(cache.block(a).link_to(LinkSlot::Link1), CacheBlockId::LINK1);
        assert_eq!(cache.block(a).link_to(LinkSlot::Link2), CacheBlockId::LINK2);
        cache.clear_link_from(b, a);
        assert_eq!(cache.block(b).link_from().count(), 0);
        cache.check_links().unwrap();
    }

    #[test]
    fn self_links_survive_reset() {
        let (mut cache, mut pages) = setup();
        let a = compiled(&mut cache, &mut pages, BlockType::SingleLink);
        cache.link(a, LinkSlot::Link1, a);
        cache.check_links().unwrap();
        cache.reset(&mut pages, a);
        assert_eq!(cache.block(a).block_type(), BlockType::Free);
        assert_eq!(cache.block(a).link_from().count(), 0);
        cache.check_links().unwrap();
    }

    #[test]
    #[should_panic(expected = "links to freed block")]
    fn linking_to_a_free_block_is_fatal() {
        let (mut cache, mut pages) = setup();
        let a = compiled(&mut cache, &mut pages, BlockType::SingleLink);
        let b = compiled(&mut cache, &mut pages, BlockType::Normal);
        cache.reset(&mut pages, b);
        cache.link(a, LinkSlot::Link1, b);
    }
}

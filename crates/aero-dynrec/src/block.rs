//! Cache block descriptors.
//!
//! Blocks live in a fixed pool owned by [`crate::CodeCache`] and are addressed by
//! [`CacheBlockId`]. Ids `0` and `1` are the two permanent link trampolines; every other id is
//! either on the descriptor free list or threaded through the arena list in host address order.

use core::fmt;

use crate::page::CodePageId;
use crate::DYN_LINKS;

/// Index of a [`CacheBlock`] in the descriptor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheBlockId(u32);

impl CacheBlockId {
    /// Trampoline targeted by unlinked [`LinkSlot::Link1`] exits.
    pub const LINK1: Self = Self(0);
    /// Trampoline targeted by unlinked [`LinkSlot::Link2`] exits.
    pub const LINK2: Self = Self(1);

    /// First id handed out by the descriptor pool.
    pub(crate) const FIRST_POOLED: u32 = 2;

    pub const fn trampoline(slot: LinkSlot) -> Self {
        match slot {
            LinkSlot::Link1 => Self::LINK1,
            LinkSlot::Link2 => Self::LINK2,
        }
    }

    pub const fn is_trampoline(self) -> bool {
        self.0 < Self::FIRST_POOLED
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Rebuild an id written into the context by compiled code.
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CacheBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LINK1 => f.write_str("#link1"),
            Self::LINK2 => f.write_str("#link2"),
            Self(raw) => write!(f, "#{raw}"),
        }
    }
}

/// Control-flow shape of a compiled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockType {
    /// Not compiled code: a free arena region or a torn-down block.
    #[default]
    Free,
    /// Every exit returns to the dispatch loop.
    Normal,
    /// One statically known successor, reached through [`LinkSlot::Link1`].
    SingleLink,
    /// Two statically known successors (not taken through `Link1`, taken through `Link2`).
    DualLink,
}

impl BlockType {
    /// Number of meaningful outgoing link slots.
    pub const fn link_count(self) -> usize {
        match self {
            BlockType::Free | BlockType::Normal => 0,
            BlockType::SingleLink => 1,
            BlockType::DualLink => 2,
        }
    }

    pub const fn is_live(self) -> bool {
        !matches!(self, BlockType::Free)
    }
}

/// Outgoing link slot of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSlot {
    Link1 = 0,
    Link2 = 1,
}

impl LinkSlot {
    pub const ALL: [LinkSlot; 2] = [LinkSlot::Link1, LinkSlot::Link2];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One entry of a back-reference ring: `block` links here through `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkRef {
    pub block: CacheBlockId,
    pub slot: LinkSlot,
}

#[derive(Debug, Clone)]
pub(crate) struct BlockLinks {
    pub(crate) to: [CacheBlockId; 2],
    pub(crate) from: [Option<LinkRef>; DYN_LINKS],
    /// Next ring position to overwrite.
    pub(crate) from_index: usize,
}

impl BlockLinks {
    pub(crate) const fn unlinked() -> Self {
        Self {
            to: [CacheBlockId::LINK1, CacheBlockId::LINK2],
            from: [None; DYN_LINKS],
            from_index: 0,
        }
    }
}

/// A compiled unit of guest code and the arena region holding it.
#[derive(Debug, Clone)]
pub struct CacheBlock {
    pub(crate) block_type: BlockType,
    /// Page-relative byte range `[start, end]` of the guest source.
    pub(crate) page_start: u16,
    pub(crate) page_end: u16,
    /// Bucket range the source touches.
    pub(crate) page_first: u16,
    pub(crate) page_last: u16,
    /// Guest page number the source was read from.
    pub(crate) guest_page: u32,
    pub(crate) code_page: Option<CodePageId>,
    /// Arena offset and length of the region.
    pub(crate) cache_start: usize,
    pub(crate) cache_size: usize,
    /// Arena list successor (host address order).
    pub(crate) next: Option<CacheBlockId>,
    /// Descriptor free list successor.
    pub(crate) next_free: Option<CacheBlockId>,
    pub(crate) links: BlockLinks,
    /// Bumped each time the descriptor is closed around newly emitted code.
    pub(crate) generation: u32,
}

impl CacheBlock {
    pub(crate) const fn empty() -> Self {
        Self {
            block_type: BlockType::Free,
            page_start: 0,
            page_end: 0,
            page_first: 0,
            page_last: 0,
            guest_page: 0,
            code_page: None,
            cache_start: 0,
            cache_size: 0,
            next: None,
            next_free: None,
            links: BlockLinks::unlinked(),
            generation: 0,
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn is_live(&self) -> bool {
        self.block_type.is_live()
    }

    /// Page-relative source byte range, inclusive.
    pub fn page_range(&self) -> (u16, u16) {
        (self.page_start, self.page_end)
    }

    /// Hash bucket range, inclusive.
    pub fn bucket_range(&self) -> (u16, u16) {
        (self.page_first, self.page_last)
    }

    /// Linear guest address of the first source byte.
    pub fn guest_start(&self) -> u32 {
        (self.guest_page << crate::PAGE_SHIFT) | u32::from(self.page_start)
    }

    /// Linear guest address of the last source byte.
    pub fn guest_end(&self) -> u32 {
        (self.guest_page << crate::PAGE_SHIFT) | u32::from(self.page_end)
    }

    pub fn code_page(&self) -> Option<CodePageId> {
        self.code_page
    }

    /// Arena offset of the block's host code.
    pub fn cache_start(&self) -> usize {
        self.cache_start
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn link_to(&self, slot: LinkSlot) -> CacheBlockId {
        self.links.to[slot.index()]
    }

    /// Occupied back-reference ring entries in ring order.
    pub fn link_from(&self) -> impl Iterator<Item = LinkRef> + '_ {
        self.links.from.iter().flatten().copied()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn overlaps(&self, start: u16, end: u16) -> bool {
        start <= self.page_end && end >= self.page_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trampolines_are_reserved_ids() {
        assert!(CacheBlockId::LINK1.is_trampoline());
        assert!(CacheBlockId::LINK2.is_trampoline());
        assert!(!CacheBlockId::from_index(2).is_trampoline());
        assert_eq!(CacheBlockId::trampoline(LinkSlot::Link2), CacheBlockId::LINK2);
    }

    #[test]
    fn link_counts_follow_block_type() {
        assert_eq!(BlockType::Free.link_count(), 0);
        assert_eq!(BlockType::Normal.link_count(), 0);
        assert_eq!(BlockType::SingleLink.link_count(), 1);
        assert_eq!(BlockType::DualLink.link_count(), 2);
    }

    #[test]
    fn overlap_is_inclusive() {
        let mut block = CacheBlock::empty();
        block.page_start = 0x10;
        block.page_end = 0x1f;
        assert!(block.overlaps(0x1f, 0x1f));
        assert!(block.overlaps(0x00, 0x10));
        assert!(!block.overlaps(0x20, 0x30));
        assert!(!block.overlaps(0x00, 0x0f));
    }

    #[test]
    fn ring_entries_stay_small() {
        // `LinkSlot` gives `Option<LinkRef>` a niche.
        assert_eq!(
            core::mem::size_of::<Option<LinkRef>>(),
            core::mem::size_of::<LinkRef>()
        );
    }
}

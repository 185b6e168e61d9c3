use aero_dynrec::emit::{CodeSink, X64Emitter};
use aero_dynrec::{
    BlockType, CacheBlockId, CodeCache, CodePages, DynrecConfig, LinkRef, LinkSlot, DYN_LINKS,
};
use proptest::prelude::*;

fn setup() -> (CodeCache, CodePages) {
    let config = DynrecConfig {
        cache_total: 256 * 1024,
        max_block_bytes: 512,
        cache_blocks: 4096,
        ..DynrecConfig::default()
    };
    (
        CodeCache::new(&config, &X64Emitter::new()).unwrap(),
        CodePages::new(4, 16),
    )
}

fn compiled(cache: &mut CodeCache, pages: &mut CodePages, ty: BlockType) -> CacheBlockId {
    cache.open_block(pages);
    cache.add_u8(0xC3);
    cache.close_block(ty)
}

#[test]
fn reset_successor_restores_predecessor_trampolines() {
    let (mut cache, mut pages) = setup();
    let a = compiled(&mut cache, &mut pages, BlockType::DualLink);
    let b = compiled(&mut cache, &mut pages, BlockType::Normal);
    let c = compiled(&mut cache, &mut pages, BlockType::Normal);

    cache.link(a, LinkSlot::Link1, b);
    cache.link(a, LinkSlot::Link2, c);
    assert!(cache
        .block(b)
        .link_from()
        .any(|r| r == LinkRef { block: a, slot: LinkSlot::Link1 }));
    assert_eq!(cache.link_slot_target(a, LinkSlot::Link1), cache.entry_addr(b));
    cache.check_links().unwrap();

    cache.reset(&mut pages, b);
    assert_eq!(cache.block(b).block_type(), BlockType::Free);
    assert_eq!(cache.block(a).link_to(LinkSlot::Link1), CacheBlockId::LINK1);
    assert_eq!(
        cache.link_slot_target(a, LinkSlot::Link1),
        cache.entry_addr(CacheBlockId::LINK1)
    );
    // The other exit is untouched.
    assert_eq!(cache.block(a).link_to(LinkSlot::Link2), c);
    cache.check_links().unwrap();
}

#[test]
fn reset_predecessor_clears_its_back_references() {
    let (mut cache, mut pages) = setup();
    let a = compiled(&mut cache, &mut pages, BlockType::SingleLink);
    let b = compiled(&mut cache, &mut pages, BlockType::Normal);
    cache.link(a, LinkSlot::Link1, b);

    cache.reset(&mut pages, a);
    assert_eq!(cache.block(b).link_from().count(), 0);
    assert!(cache.block(b).is_live());
    cache.check_links().unwrap();
}

#[test]
fn seventeenth_predecessor_evicts_the_first() {
    let (mut cache, mut pages) = setup();
    let target = compiled(&mut cache, &mut pages, BlockType::Normal);
    let preds: Vec<CacheBlockId> = (0..=DYN_LINKS)
        .map(|_| compiled(&mut cache, &mut pages, BlockType::SingleLink))
        .collect();

    for &p in &preds[..DYN_LINKS] {
        cache.link(p, LinkSlot::Link1, target);
    }
    assert_eq!(cache.block(target).link_from().count(), DYN_LINKS);
    assert_eq!(cache.stats().ring_evictions, 0);

    cache.link(preds[DYN_LINKS], LinkSlot::Link1, target);
    assert_eq!(cache.block(target).link_from().count(), DYN_LINKS);
    assert_eq!(cache.block(preds[0]).link_to(LinkSlot::Link1), CacheBlockId::LINK1);
    assert_eq!(
        cache.link_slot_target(preds[0], LinkSlot::Link1),
        cache.entry_addr(CacheBlockId::LINK1)
    );
    for &p in &preds[1..] {
        assert_eq!(cache.block(p).link_to(LinkSlot::Link1), target);
    }
    assert_eq!(cache.stats().ring_evictions, 1);
    cache.check_links().unwrap();

    // Resetting the target now unlinks exactly the sixteen remaining predecessors.
    cache.reset(&mut pages, target);
    for &p in &preds {
        assert_eq!(cache.block(p).link_to(LinkSlot::Link1), CacheBlockId::LINK1);
    }
    cache.check_links().unwrap();
}

#[test]
fn linking_to_a_trampoline_unlinks() {
    let (mut cache, mut pages) = setup();
    let a = compiled(&mut cache, &mut pages, BlockType::SingleLink);
    let b = compiled(&mut cache, &mut pages, BlockType::Normal);
    cache.link(a, LinkSlot::Link1, b);
    cache.link(a, LinkSlot::Link1, CacheBlockId::LINK1);
    assert_eq!(cache.block(b).link_from().count(), 0);
    cache.check_links().unwrap();
}

#[derive(Debug, Clone)]
enum LinkOp {
    Link { from: usize, slot: bool, to: usize },
    Reset(usize),
}

fn link_op(blocks: usize) -> impl Strategy<Value = LinkOp> {
    prop_oneof![
        4 => (0..blocks, any::<bool>(), 0..blocks)
            .prop_map(|(from, slot, to)| LinkOp::Link { from, slot, to }),
        1 => (0..blocks).prop_map(LinkOp::Reset),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn links_stay_symmetric(ops in proptest::collection::vec(link_op(24), 1..200)) {
        let (mut cache, mut pages) = setup();
        let mut blocks: Vec<CacheBlockId> = (0..24)
            .map(|_| compiled(&mut cache, &mut pages, BlockType::DualLink))
            .collect();

        for op in ops {
            match op {
                LinkOp::Link { from, slot, to } => {
                    let slot = if slot { LinkSlot::Link2 } else { LinkSlot::Link1 };
                    cache.link(blocks[from], slot, blocks[to]);
                }
                LinkOp::Reset(i) => {
                    cache.reset(&mut pages, blocks[i]);
                    // Reuse the slot for a fresh block so later links stay valid.
                    blocks[i] = compiled(&mut cache, &mut pages, BlockType::DualLink);
                }
            }
            prop_assert!(cache.check_links().is_ok());
        }
        for &b in &blocks {
            prop_assert!(cache.block(b).link_from().count() <= DYN_LINKS);
        }
        prop_assert!(cache.check_arena().is_ok());
    }
}

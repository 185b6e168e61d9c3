use aero_dynrec::{
    BlockType, CodePageHandler, DynrecConfig, GuestBus, GuestMemory, JitEngine, LinkSlot,
    PageFlags, WriteOutcome,
};
use proptest::prelude::*;

/// Five NOPs followed by `jmp 0x2000`.
const BLOCK_1000: [u8; 10] = [0x90, 0x90, 0x90, 0x90, 0x90, 0xE9, 0xF6, 0x0F, 0x00, 0x00];

fn memory() -> GuestMemory {
    let mut mem = GuestMemory::new(64 * 1024).unwrap();
    mem.load(0x1000, &BLOCK_1000);
    // hlt
    mem.load(0x2000, &[0xF4]);
    mem
}

fn handler(engine: &JitEngine, page: u32) -> &CodePageHandler {
    let id = engine
        .memory()
        .code_page(page)
        .expect("page has no code page handler");
    engine.code_pages().handler(id)
}

#[test]
fn unchanged_write_keeps_the_block() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();
    let b = engine.compile_or_fetch(0x2000).unwrap();
    engine.link(a, LinkSlot::Link1, b);

    let write_map: Vec<u32> = (0..4).map(|i| handler(&engine, 1).write_map(i)).collect();
    let bucket = handler(&engine, 1).bucket_blocks(0).to_vec();

    assert_eq!(engine.write_u8(0x1004, 0x90), WriteOutcome::Unchanged);
    assert_eq!(engine.write_u32(0x1000, 0x9090_9090), WriteOutcome::Unchanged);

    let after: Vec<u32> = (0..4).map(|i| handler(&engine, 1).write_map(i)).collect();
    assert_eq!(after, write_map);
    assert_eq!(handler(&engine, 1).bucket_blocks(0), bucket.as_slice());
    assert!(engine.block(a).is_live());
    assert_eq!(engine.block(a).link_to(LinkSlot::Link1), b);
    assert_eq!(handler(&engine, 1).invalidation_count(4), 0);
    assert_eq!(engine.stats().invalidations, 0);
}

#[test]
fn changed_write_invalidates_before_the_store() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();
    let b = engine.compile_or_fetch(0x2000).unwrap();
    engine.link(a, LinkSlot::Link1, b);
    assert_eq!(engine.block(a).page_range(), (0, 9));
    assert_eq!(handler(&engine, 1).write_map(0), 1);

    let outcome = engine.write_u8(0x1004, 0xC3);
    assert_eq!(
        outcome,
        WriteOutcome::Invalidated {
            blocks: 1,
            hit_running: false
        }
    );
    assert_eq!(engine.block(a).block_type(), BlockType::Free);
    assert!(handler(&engine, 1).bucket_blocks(0).is_empty());
    assert_eq!(handler(&engine, 1).write_map(0), 0);
    assert_eq!(handler(&engine, 1).active_blocks(), 0);
    assert_eq!(handler(&engine, 1).invalidation_count(4), 1);
    assert_eq!(engine.block(b).link_from().count(), 0);
    assert!(engine.block(b).is_live());
    assert_eq!(engine.read_u8(0x1004), 0xC3);
    assert_eq!(engine.find_block(0x1000), None);

    // Recompiling sees the new byte: four NOPs and `ret`.
    let again = engine.compile_or_fetch(0x1000).unwrap();
    assert_eq!(engine.block(again).block_type(), BlockType::Normal);
    assert_eq!(engine.block(again).page_range(), (0, 4));
    engine.check_invariants().unwrap();
}

#[test]
fn writes_outside_covered_buckets_leave_blocks_alone() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();

    assert_eq!(engine.write_u8(0x1010, 0x55), WriteOutcome::Written);
    assert_eq!(engine.write_u32(0x1800, 0xDEAD_BEEF), WriteOutcome::Written);
    assert!(engine.block(a).is_live());
    assert_eq!(engine.read_u32(0x1800), 0xDEAD_BEEF);
}

#[test]
fn wide_write_over_the_block_end_invalidates() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();

    // Touches the last jump displacement byte and the byte after it.
    let outcome = engine.write_u16(0x1009, 0x1234);
    assert!(matches!(outcome, WriteOutcome::Invalidated { blocks: 1, .. }));
    assert!(!engine.block(a).is_live());
}

#[test]
fn page_crossing_write_invalidates_both_pages() {
    let mut mem = memory();
    mem.load(0x1FF0, &[0x90; 16]);
    let mut engine = JitEngine::new(DynrecConfig::default(), mem).unwrap();
    let tail = engine.compile_or_fetch(0x1FF0).unwrap();
    let head = engine.compile_or_fetch(0x2000).unwrap();
    // The NOP run stops at the page end.
    assert_eq!(engine.block(tail).page_range(), (0xFF0, 0xFFF));

    let outcome = engine.write_u32(0x1FFE, 0x4141_4141);
    assert_eq!(
        outcome,
        WriteOutcome::Invalidated {
            blocks: 2,
            hit_running: false
        }
    );
    assert!(!engine.block(tail).is_live());
    assert!(!engine.block(head).is_live());
    assert_eq!(engine.read_u32(0x1FFE), 0x4141_4141);
    engine.check_invariants().unwrap();
}

#[test]
fn frequently_rewritten_code_is_interpreted() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();

    for value in [0x40, 0x90, 0x40, 0x90] {
        assert!(engine.compile_or_fetch(0x1000).is_some());
        assert!(matches!(
            engine.write_u8(0x1000, value),
            WriteOutcome::Invalidated { blocks: 1, .. }
        ));
    }
    assert_eq!(handler(&engine, 1).invalidation_count(0), 4);
    assert_eq!(engine.compile_or_fetch(0x1000), None);
    // Only the rewritten byte is affected.
    assert!(engine.compile_or_fetch(0x1001).is_some());
}

#[test]
fn idle_code_page_is_released() {
    let config = DynrecConfig {
        page_release_delay: 4,
        ..DynrecConfig::default()
    };
    let mut engine = JitEngine::new(config, memory()).unwrap();
    engine.compile_or_fetch(0x1000).unwrap();
    assert!(engine.memory().flags(1).contains(PageFlags::HAS_CODE));
    let free = engine.code_pages().free_count();

    engine.write_u8(0x1000, 0x40);
    assert_eq!(handler(&engine, 1).active_blocks(), 0);

    for i in 0..3 {
        assert_eq!(engine.write_u8(0x1800 + i, 1), WriteOutcome::Written);
    }
    // Unchanged writes do not count.
    assert_eq!(engine.write_u8(0x1800, 1), WriteOutcome::Unchanged);
    assert_eq!(engine.write_u8(0x1803, 1), WriteOutcome::Released);

    assert_eq!(engine.memory().code_page(1), None);
    assert!(!engine.memory().flags(1).contains(PageFlags::HAS_CODE));
    assert_eq!(engine.code_pages().free_count(), free + 1);
    engine.check_invariants().unwrap();
}

#[test]
fn rom_writes_are_dropped() {
    let mut mem = memory();
    mem.set_rom(1, true);
    let mut engine = JitEngine::new(DynrecConfig::default(), mem).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();

    assert_eq!(engine.write_u8(0x1004, 0xC3), WriteOutcome::Ignored);
    assert_eq!(engine.read_u8(0x1004), 0x90);
    assert!(engine.block(a).is_live());
}

#[test]
fn no_code_pages_are_never_compiled() {
    let mut mem = memory();
    mem.set_no_code(2, true);
    let mut engine = JitEngine::new(DynrecConfig::default(), mem).unwrap();
    assert_eq!(engine.compile_or_fetch(0x2000), None);
    assert_eq!(engine.memory().code_page(2), None);
    assert_eq!(engine.compile_or_fetch(0x10_0000), None);
}

#[test]
fn invalidate_range_spans_pages() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();
    let b = engine.compile_or_fetch(0x2000).unwrap();
    engine.link(a, LinkSlot::Link1, b);

    assert_eq!(engine.invalidate_range(0x1005, 0x2000), 2);
    assert!(!engine.block(a).is_live());
    assert!(!engine.block(b).is_live());
    assert_eq!(engine.invalidate_range(0x1005, 0x2000), 0);
    engine.check_invariants().unwrap();
}

#[test]
fn flush_discards_everything() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();
    let b = engine.compile_or_fetch(0x2000).unwrap();
    engine.link(a, LinkSlot::Link1, b);
    let capacity = engine.code_pages().capacity();

    engine.flush();
    assert!(!engine.block(a).is_live());
    assert!(!engine.block(b).is_live());
    assert_eq!(engine.code_pages().free_count(), capacity);
    assert_eq!(engine.memory().code_page(1), None);
    engine.check_invariants().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn writes_invalidate_exactly_when_covered_bytes_change(
        writes in proptest::collection::vec((0u32..24, prop_oneof![Just(0x90u8), any::<u8>()]), 1..48)
    ) {
        let config = DynrecConfig { smc_threshold: u8::MAX, ..DynrecConfig::default() };
        let mut engine = JitEngine::new(config, memory()).unwrap();

        for (offset, value) in writes {
            let id = engine.compile_or_fetch(0x1000).unwrap();
            let (start, end) = engine.block(id).page_range();
            let addr = 0x1000 + offset;
            let old = engine.read_u8(addr);

            let outcome = engine.write_u8(addr, value);
            let covered = u32::from(start) <= offset && offset <= u32::from(end);
            if old == value {
                prop_assert_eq!(outcome, WriteOutcome::Unchanged);
                prop_assert!(engine.block(id).is_live());
            } else if covered {
                prop_assert!(!engine.block(id).is_live());
                prop_assert_eq!(engine.find_block(0x1000), None);
            } else {
                prop_assert!(engine.block(id).is_live());
            }
            prop_assert_eq!(engine.read_u8(addr), value);
            prop_assert!(engine.check_invariants().is_ok());
        }
    }
}

#[test]
fn bus_writes_keep_the_cache_coherent() {
    let mut engine = JitEngine::new(DynrecConfig::default(), memory()).unwrap();
    let a = engine.compile_or_fetch(0x1000).unwrap();

    {
        let mut bus = engine.bus();
        assert_eq!(bus.read_u8(0x1004), 0x90);
        bus.write_u8(0x1004, 0x90);
    }
    assert!(engine.block(a).is_live());

    engine.bus().write_u32(0x1002, 0xC3C3_C3C3);
    assert!(!engine.block(a).is_live());
    assert_eq!(engine.read_u32(0x1002), 0xC3C3_C3C3);
    engine.check_invariants().unwrap();
}

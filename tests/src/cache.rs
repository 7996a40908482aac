//! Code cache, page index, IBTC, and linker
//! coverage that doesn't need a running dispatch loop.

use lib86_backend::CodeBuffer;
use lib86_cache::{link, tc_invalidate, CodeCache, InvalidateMode};
use lib86_core::{BlockFlags, Fingerprint, LinkMode, TakenKind, TranslatedBlock};

use crate::mocks::MockEmitter;

fn new_block(fingerprint: Fingerprint, virt_pc: u32, ptr_code: usize, page: u32) -> TranslatedBlock {
    TranslatedBlock::new(fingerprint, virt_pc, ptr_code, page)
}

#[test]
fn find_matches_only_the_exact_fingerprint() {
    let mut cache = CodeCache::new();
    let fp_a = Fingerprint::new(0, 0x1000, 0);
    let fp_b = Fingerprint::new(0, 0x1000, 1); // same pc, different cpu_flags_const
    let id_a = cache.insert(new_block(fp_a, 0x1000, 0x10, 1));

    assert_eq!(cache.find(fp_a), Some(id_a));
    assert_eq!(cache.find(fp_b), None);
    assert_eq!(cache.get(id_a).unwrap().fingerprint, fp_a);
}

#[test]
fn num_tc_tracks_insert_and_remove() {
    let mut cache = CodeCache::new();
    assert_eq!(cache.len(), 0);
    let fp = Fingerprint::new(0, 0x2000, 0);
    let id = cache.insert(new_block(fp, 0x2000, 0x20, 2));
    assert_eq!(cache.len(), 1);
    cache.remove(id, |_| {});
    assert_eq!(cache.len(), 0);
    assert!(cache.is_empty());
}

#[test]
fn clear_empties_bucket_page_and_ibtc_state() {
    let mut cache = CodeCache::new();
    let fp = Fingerprint::new(0, 0x3000, 0);
    cache.insert(new_block(fp, 0x3000, 0x30, 3));
    assert_eq!(cache.len(), 1);

    cache.clear();

    assert_eq!(cache.len(), 0);
    assert!(cache.is_empty());
    assert_eq!(cache.find(fp), None);
    assert_eq!(cache.ibtc_lookup(0x3000, 0, 0, 3), None);
}

#[test]
fn removing_a_block_reverts_its_incoming_patch() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let fp_pred = Fingerprint::new(0, 0x1000, 0);
    let mut pred = new_block(fp_pred, 0x1000, 0x100, 1);
    let patch_site = buf.offset();
    buf.emit_u32(0);
    pred.patch_site_offset[0] = Some(patch_site);
    pred.flags = BlockFlags {
        link_mode: LinkMode::DirectOnly,
        num_patch_sites: 1,
        taken_kind: TakenKind::DstPc,
    };
    let pred_id = cache.insert(pred);

    let fp_succ = Fingerprint::new(0, 0x1100, 0);
    let succ = new_block(fp_succ, 0x1100, 0x200, 1);
    let succ_id = cache.insert(succ);

    link(&mut cache, &emitter, &buf, pred_id, succ_id);
    assert_eq!(cache.get(pred_id).unwrap().jmp_offset[0], Some(0x200));
    assert_eq!(buf.read_u32(patch_site), 0x200);

    cache.remove(succ_id, |site| {
        emitter.patch_jump(&buf, site, emitter.dispatcher_stub_offset());
    });

    assert_eq!(cache.get(pred_id).unwrap().jmp_offset[0], None);
    assert_eq!(buf.read_u32(patch_site), emitter.dispatcher_stub_offset() as u32);
}

#[test]
fn conditional_block_links_only_the_taken_slot() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let mut pred = new_block(Fingerprint::new(0, 0x1000, 0), 0x1000, 0x100, 1);
    let taken_site = buf.offset();
    buf.emit_u32(0);
    let not_taken_site = buf.offset();
    buf.emit_u32(0);
    pred.patch_site_offset[0] = Some(taken_site);
    pred.patch_site_offset[1] = Some(not_taken_site);
    pred.flags = BlockFlags {
        link_mode: LinkMode::ConditionalDirect,
        num_patch_sites: 2,
        taken_kind: TakenKind::DstPc,
    };
    let pred_id = cache.insert(pred);
    let succ_id = cache.insert(new_block(Fingerprint::new(0, 0x2000, 0), 0x2000, 0x300, 2));

    link(&mut cache, &emitter, &buf, pred_id, succ_id);

    assert_eq!(cache.get(pred_id).unwrap().jmp_offset[0], Some(0x300));
    assert_eq!(cache.get(pred_id).unwrap().jmp_offset[1], None);
    assert_eq!(buf.read_u32(not_taken_site), 0);
}

#[test]
fn indirect_block_populates_ibtc_instead_of_patching() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let mut pred = new_block(Fingerprint::new(0, 0x1000, 0), 0x1000, 0x100, 1);
    pred.flags = BlockFlags {
        link_mode: LinkMode::Indirect,
        num_patch_sites: 0,
        taken_kind: TakenKind::DstPc,
    };
    let pred_id = cache.insert(pred);
    let succ_id = cache.insert(new_block(Fingerprint::new(0, 0x2000, 0), 0x2000, 0x300, 2));

    link(&mut cache, &emitter, &buf, pred_id, succ_id);

    assert_eq!(cache.ibtc_lookup(0x2000, 0, 0, 2), Some(succ_id));
    // Wrong caller page must miss even though pc/cs_base/flags match.
    assert_eq!(cache.ibtc_lookup(0x2000, 0, 0, 99), None);
}

#[test]
fn tc_invalidate_removes_overlapping_blocks_and_flags_self_overwrite() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let fp = Fingerprint::new(0, 0x1000, 0);
    let mut block = new_block(fp, 0x1000, 0x100, 0);
    block.guest_len = 4;
    let id = cache.insert(block);

    // A write at 0x1002 overlaps [0x1000, 0x1004).
    let outcome = tc_invalidate(&mut cache, &emitter, &buf, 0x1002, 1, InvalidateMode::Overlap, Some(fp));

    assert!(outcome.halt_current);
    assert!(outcome.force_one_shot_rewrite);
    assert_eq!(cache.get(id), None);
    assert_eq!(cache.len(), 0);
}

#[test]
fn tc_invalidate_ignores_writes_on_an_untracked_page() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let outcome = tc_invalidate(&mut cache, &emitter, &buf, 0x9000, 4, InvalidateMode::Overlap, None);
    assert!(!outcome.halt_current);
    assert!(!outcome.force_one_shot_rewrite);
}

#[test]
fn tc_invalidate_exact_hook_mode_skips_ordinary_blocks() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    let emitter = MockEmitter::new(&mut buf);
    let mut cache = CodeCache::new();

    let fp = Fingerprint::new(0, 0x1000, 0);
    let mut block = new_block(fp, 0x1000, 0x100, 0);
    block.guest_len = 4;
    let id = cache.insert(block);

    let outcome = tc_invalidate(&mut cache, &emitter, &buf, 0x1000, 1, InvalidateMode::ExactHook, None);
    assert!(!outcome.halt_current);
    assert!(cache.get(id).is_some());
}

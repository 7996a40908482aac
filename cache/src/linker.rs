use log::trace;

use lib86_backend::{CodeBuffer, Emitter};
use lib86_core::{BlockId, LinkMode, TakenKind};

use crate::code_cache::CodeCache;

/// After block B executes and declares a link intention in
/// `B.flags`, patch B into its successor S. Direct
/// link modes rewrite a patch site in B's emitted code to jump
/// straight at S's entry; indirect/ret modes instead populate the
/// IBTC so the *next* execution from this guest PC can skip the
/// bucket scan.
pub fn link<E: Emitter>(
    cache: &mut CodeCache,
    emitter: &E,
    buf: &CodeBuffer,
    predecessor: BlockId,
    successor: BlockId,
) {
    let (link_mode, taken_kind, num_patch_sites) = {
        let Some(pred) = cache.get(predecessor) else {
            return;
        };
        (
            pred.flags.link_mode,
            pred.flags.taken_kind,
            pred.flags.num_patch_sites,
        )
    };
    let Some(succ) = cache.get(successor) else {
        return;
    };
    let succ_entry = succ.ptr_code;
    let succ_virt_pc = succ.virt_pc;
    let succ_cs_base = succ.fingerprint.cs_base;
    let succ_cpu_flags = succ.fingerprint.cpu_flags_const;
    let succ_page = succ.page;

    match link_mode {
        LinkMode::None => {}
        LinkMode::DirectOnly => {
            if patch_slot(cache, emitter, buf, predecessor, 0, succ_entry) {
                add_patcher(cache, successor, predecessor);
            }
        }
        LinkMode::ConditionalDirect => {
            let slot = match taken_kind {
                TakenKind::DstPc => 0,
                TakenKind::NextPc => 1,
                TakenKind::Ret => {
                    if num_patch_sites == 1 {
                        0
                    } else {
                        return;
                    }
                }
            };
            if patch_slot(cache, emitter, buf, predecessor, slot, succ_entry) {
                add_patcher(cache, successor, predecessor);
            }
        }
        LinkMode::Indirect | LinkMode::Ret => {
            cache
                .ibtc
                .insert(succ_virt_pc, succ_cs_base, succ_cpu_flags, succ_page, successor);
        }
    }
}

/// Patch `predecessor`'s `slot` to `target`. Returns whether a patch
/// site was actually present: on success the caller
/// records `predecessor` in the successor's `linked_tc` so eviction
/// can find and revert it.
fn patch_slot<E: Emitter>(
    cache: &mut CodeCache,
    emitter: &E,
    buf: &CodeBuffer,
    predecessor: BlockId,
    slot: usize,
    target: usize,
) -> bool {
    let Some(pred) = cache.get_mut(predecessor) else {
        return false;
    };
    let Some(site) = pred.patch_site_offset[slot] else {
        return false;
    };
    emitter.patch_jump(buf, site, target);
    pred.jmp_offset[slot] = Some(target);
    trace!(target: "lib86_cache", "linked {:?} slot {} -> {:#x}", predecessor, slot, target);
    true
}

/// Record that `patcher` now holds a live patch pointing at
/// `successor`, so removing
/// `successor` later knows to revert it.
fn add_patcher(cache: &mut CodeCache, successor: BlockId, patcher: BlockId) {
    if let Some(succ) = cache.get_mut(successor) {
        if !succ.linked_tc.contains(&patcher) {
            succ.linked_tc.push(patcher);
        }
    }
}

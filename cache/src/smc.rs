use log::debug;

use lib86_backend::{CodeBuffer, Emitter};
use lib86_core::{page_of, CpuFlags, Fingerprint};

use crate::code_cache::CodeCache;

/// Which SMC protocol governs this invalidation: a guest store widens the match to any byte
/// overlap, while detaching a hook must hit that hook's block
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    Overlap,
    ExactHook,
}

/// What the caller (the dispatch loop) needs to do after
/// `tc_invalidate` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidateOutcome {
    /// The block currently executing was among those removed; the
    /// dispatcher must halt it and re-enter from the current guest
    /// IP.
    pub halt_current: bool,
    /// Arm `DISAS_ONE | ALLOW_CODE_WRITE` for the next translation,
    /// so the single instruction performing the write is translated
    /// in isolation and permitted to write the page it reads from.
    pub force_one_shot_rewrite: bool,
    /// The written page's block-set became empty as a result of this
    /// call; the caller must clear the `CODE` TLB attribute for it
    ///. `None` if the page still holds blocks,
    /// had none removed, or never had any blocks to begin with.
    pub page_now_empty: Option<u32>,
}

/// `tc_invalidate(addr, size)`: the SMC hook called
/// from the guest write path whenever the TLB entry for `addr` has
/// the `CODE` attribute set.
///
/// `addr`/`size` describe the guest-physical write range; `page`
/// is `page_of(addr)`, already translated by the caller (this
/// function never faults). `current` is the fingerprint the
/// currently-executing block would have if recomputed right now,
/// used for self-overwrite detection.
pub fn tc_invalidate<E: Emitter>(
    cache: &mut CodeCache,
    emitter: &E,
    buf: &CodeBuffer,
    addr: u32,
    size: u32,
    mode: InvalidateMode,
    current: Option<Fingerprint>,
) -> InvalidateOutcome {
    let page = page_of(addr);
    let mut outcome = InvalidateOutcome::default();

    let candidates: Vec<_> = cache.page_index.blocks_on(page).to_vec();
    if candidates.is_empty() {
        return outcome;
    }

    let write_start = addr;
    let write_end = addr + size;

    for id in candidates {
        let Some(block) = cache.get(id) else { continue };
        let overlaps = match mode {
            InvalidateMode::Overlap => {
                if block.is_hook {
                    false
                } else {
                    let block_start = block.fingerprint.pc_phys;
                    let block_end = block_start.wrapping_add(block.guest_len);
                    block_start < write_end && write_start < block_end
                }
            }
            InvalidateMode::ExactHook => block.is_hook && block.fingerprint.pc_phys == addr,
        };
        if !overlaps {
            continue;
        }

        let removed_fingerprint = block.fingerprint;
        let removed_ptr_code = block.ptr_code;
        cache.remove(id, |site| {
            emitter.patch_jump(buf, site, emitter.dispatcher_stub_offset());
        });
        debug!(target: "lib86_cache", "tc_invalidate removed block at {:#x}", removed_ptr_code);

        if let Some(cur) = current {
            if cur == removed_fingerprint {
                outcome.halt_current = true;
                if mode == InvalidateMode::Overlap {
                    outcome.force_one_shot_rewrite = true;
                }
            }
        }
    }

    if cache.page_index.is_empty_page(page) {
        outcome.page_now_empty = Some(page);
    }

    outcome
}

/// Config flags to arm on the next translation after a self-overwrite.
pub fn rewrite_flags() -> CpuFlags {
    CpuFlags::DISAS_ONE | CpuFlags::ALLOW_CODE_WRITE
}

//! Glue between the guest memory subsystem's write path (an external
//! collaborator) and the code cache's SMC protocol:
//! applying [`InvalidateOutcome`] to the running CPU's flags and
//! reporting whether the dispatcher must halt the block currently
//! executing.

use lib86_backend::{CodeBuffer, Emitter};
use lib86_cache::{tc_invalidate, CodeCache, InvalidateMode};
use lib86_core::{CpuCtx, CpuFlags, Fingerprint, TlbAttrs};

/// Called by the (out-of-scope) guest memory subsystem whenever a
/// write lands on a guest-physical page whose TLB entry has the
/// `CODE` attribute set. `running` is the fingerprint of the block
/// currently executing, recomputed by the caller for the
/// self-overwrite check; `None` when no block
/// is currently running (e.g. the write happened during translation
/// itself).
///
/// Returns whether the dispatcher must treat this as
/// [`lib86_core::HostEvent::HaltTc`] and re-enter from the current
/// guest IP.
pub fn handle_guest_write<E: Emitter>(
    cpu: &mut CpuCtx,
    cache: &mut CodeCache,
    emitter: &E,
    buf: &CodeBuffer,
    addr: u32,
    size: u32,
    mode: InvalidateMode,
    running: Option<Fingerprint>,
) -> bool {
    let outcome = tc_invalidate(cache, emitter, buf, addr, size, mode, running);
    if outcome.force_one_shot_rewrite {
        cpu.flags.insert(CpuFlags::DISAS_ONE | CpuFlags::ALLOW_CODE_WRITE);
    }
    if let Some(page) = outcome.page_now_empty {
        cpu.tlb.get_mut(page).remove_attrs(TlbAttrs::CODE);
    }
    outcome.halt_current
}

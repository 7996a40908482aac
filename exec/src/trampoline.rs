//! The trampoline harness: lets host code "call" a
//! guest function that is otherwise hooked, by temporarily suppressing
//! the hook for exactly the outermost cache search.

use lib86_backend::{CodeBuffer, Emitter};
use lib86_cache::CodeCache;
use lib86_core::{CpuCtx, CpuResult, GuestMemory, HFlags};
use lib86_frontend::{Decoder, HookMap};

use crate::dispatch::{run_mode, DispatchMode};

/// Set `cpu.eip` to `target_eip` and run the dispatch loop in
/// [`DispatchMode::Trampoline`] until it returns to `return_eip`
///. `HFLG_TRAMP` is set for the duration of the call so
/// the *first* cache search resolves to the guest's own
/// implementation rather than a host hook thunk; the dispatcher clears
/// the flag again right before running that first block, so anything
/// the guest function itself calls is hooked normally.
///
/// The flag is restored to its pre-call state on every exit path,
/// including host-level aborts, so a failed trampoline call never
/// leaves `HFLG_TRAMP` stuck set.
pub fn call_trampoline<G, D, E>(
    cpu: &mut CpuCtx,
    mem: &mut G,
    cache: &mut CodeCache,
    decoder: &mut D,
    emitter: &mut E,
    buf: &mut CodeBuffer,
    hooks: &HookMap,
    target_eip: u32,
    return_eip: u32,
) -> CpuResult<()>
where
    G: GuestMemory,
    D: Decoder,
    E: Emitter,
{
    let was_set = cpu.hflags.contains(HFlags::TRAMP);
    cpu.eip = target_eip;
    cpu.hflags.insert(HFlags::TRAMP);

    let result = run_mode(
        cpu,
        mem,
        cache,
        decoder,
        emitter,
        buf,
        hooks,
        DispatchMode::Trampoline { return_eip },
    );

    if was_set {
        cpu.hflags.insert(HFlags::TRAMP);
    } else {
        cpu.hflags.remove(HFlags::TRAMP);
    }

    result
}

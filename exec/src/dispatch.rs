//! The outermost dispatch loop: resolve the
//! current guest PC to a cached (or freshly translated) block, link
//! it to whatever ran before it, run it, and react to whatever the
//! block reports back.

use log::trace;

use lib86_backend::{CodeBuffer, Emitter};
use lib86_cache::{link, CodeCache};
use lib86_core::{
    page_of, BlockExit, BlockId, CpuCtx, CpuFlags, CpuResult, ExpData, Fingerprint, GuestMemory,
    HFlags, HostEvent,
};
use lib86_frontend::{translate_block, Decoder, HookMap};

/// Which of the three dispatcher entry points this run is. A plain
/// enum parameter rather than separate functions per mode — the
/// dispatcher is not on the per-instruction hot path, so the enum
/// costs nothing observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The ordinary outer loop: runs until the guest halts or the
    /// host caller otherwise stops calling it.
    Normal,
    /// A trampoline call is in flight; the loop exits
    /// as soon as `cpu.eip == return_eip`.
    Trampoline { return_eip: u32 },
    /// A single debug-trap instruction: translate exactly one instruction, never consult
    /// the cache, run it once, then return regardless of outcome.
    Trap,
}

/// Fully purge the cache: drop all bookkeeping and instruct the
/// emitter to release every host code page, then reset the buffer's
/// write cursor.
pub fn purge<E: Emitter>(cache: &mut CodeCache, emitter: &mut E, buf: &mut CodeBuffer) {
    cache.clear();
    emitter.destroy_all_code();
    buf.reset();
}

/// Run the dispatch loop until `mode`'s exit predicate is satisfied.
/// Host-level aborts (triple fault, unimplemented instruction)
/// propagate out as `Err`; guest-architectural faults are handled
/// internally via [`lib86_except::raise_exception`] and never escape
/// this function.
pub fn run<G, D, E>(
    cpu: &mut CpuCtx,
    mem: &mut G,
    cache: &mut CodeCache,
    decoder: &mut D,
    emitter: &mut E,
    buf: &mut CodeBuffer,
    hooks: &HookMap,
) -> CpuResult<()>
where
    G: GuestMemory,
    D: Decoder,
    E: Emitter,
{
    run_mode(cpu, mem, cache, decoder, emitter, buf, hooks, DispatchMode::Normal)
}

/// As [`run`], but taking an explicit [`DispatchMode`] — the entry
/// point [`crate::trampoline::call_trampoline`] and the debug harness
/// use directly.
pub fn run_mode<G, D, E>(
    cpu: &mut CpuCtx,
    mem: &mut G,
    cache: &mut CodeCache,
    decoder: &mut D,
    emitter: &mut E,
    buf: &mut CodeBuffer,
    hooks: &HookMap,
    mode: DispatchMode,
) -> CpuResult<()>
where
    G: GuestMemory,
    D: Decoder,
    E: Emitter,
{
    let mut prev_tc: Option<BlockId> = None;

    loop {
        if let DispatchMode::Trampoline { return_eip } = mode {
            if cpu.eip == return_eip {
                return Ok(());
            }
        }

        // Step 1.
        let virt_pc = cpu.segs.cs.hidden.base.wrapping_add(cpu.eip);

        // Step 2.
        let pc = match mem.get_code_addr(virt_pc, cpu.eip) {
            Ok(pc) => pc,
            Err(ev) => {
                // Step 3: retry from a fresh guest IP, never linking
                // `prev_tc` across an exception.
                suppress_trampoline(cpu, mode);
                deliver_fault(cpu, mem, ev)?;
                prev_tc = None;
                continue;
            }
        };

        let cs_base = cpu.segs.cs.hidden.base;
        let cpu_flags_const = cpu.cpu_flags_const();
        let fingerprint = Fingerprint::new(cs_base, pc, cpu_flags_const);

        // Step 4: cache lookup, skipped entirely in trap mode. The
        // IBTC is tried first: a hit there skips the bucket scan that
        // `CodeCache::find` would otherwise do.
        let mut block_id = if matches!(mode, DispatchMode::Trap) {
            None
        } else {
            let caller_page = page_of(pc);
            cache
                .ibtc_lookup(virt_pc, cs_base, cpu_flags_const, caller_page)
                .or_else(|| cache.find(fingerprint))
        };

        if block_id.is_none() {
            let single_step = matches!(mode, DispatchMode::Trap);
            let translated = translate_block(cpu, mem, decoder, emitter, buf, hooks, single_step);
            let block = match translated {
                Ok(block) => block,
                Err(ev) => {
                    suppress_trampoline(cpu, mode);
                    deliver_fault(cpu, mem, ev)?;
                    prev_tc = None;
                    continue;
                }
            };

            // A page-crossing or one-shot (single-step / forced
            // disas-one) block is executed once and discarded by
            // default; `CPU_FORCE_INSERT` overrides this. Trap mode's
            // single-instruction block is discarded unconditionally —
            // it is never looked up in or inserted into the cache,
            // regardless of `CPU_FORCE_INSERT`.
            let natural_one_shot = block.crosses_page || cpu.flags.contains(CpuFlags::DISAS_ONE);
            let force_insert = cpu.flags.contains(CpuFlags::FORCE_INSERT);
            let discard = single_step || (natural_one_shot && !force_insert);

            if discard {
                let ptr_code = block.ptr_code;
                suppress_trampoline(cpu, mode);
                // SAFETY: ptr_code is the offset `translate_block`
                // just emitted into `buf`, still resident.
                let exit = unsafe { emitter.run_block(buf, ptr_code, cpu) };
                cpu.flags
                    .remove(CpuFlags::DISAS_ONE | CpuFlags::ALLOW_CODE_WRITE | CpuFlags::FORCE_INSERT);
                prev_tc = None;
                if matches!(mode, DispatchMode::Trap) {
                    if let BlockExit::Event(ev) = exit {
                        handle_event(cpu, mem, cache, emitter, buf, ev)?;
                    }
                    return Ok(());
                }
                match exit {
                    BlockExit::ToDispatcher => continue,
                    BlockExit::Event(ev) => {
                        handle_event(cpu, mem, cache, emitter, buf, ev)?;
                        continue;
                    }
                }
            }

            if cache.is_full() {
                purge(cache, emitter, buf);
                prev_tc = None;
            }
            block_id = Some(cache.insert(block));
        }

        let id = block_id.expect("resolved above");

        // Step 5.
        if let Some(predecessor) = prev_tc {
            link(cache, emitter, buf, predecessor, id);
        }

        // Step 6.
        suppress_trampoline(cpu, mode);
        let ptr_code = cache.get(id).expect("id just resolved").ptr_code;
        // SAFETY: `id` is either a bucket-cache hit (its code is
        // resident for as long as it's reachable from the cache) or
        // was just inserted above.
        let exit = unsafe { emitter.run_block(buf, ptr_code, cpu) };

        if matches!(mode, DispatchMode::Trap) {
            if let BlockExit::Event(ev) = exit {
                handle_event(cpu, mem, cache, emitter, buf, ev)?;
            }
            return Ok(());
        }

        match exit {
            BlockExit::ToDispatcher => {
                trace!(target: "lib86_exec", "block {:?} fell through to dispatcher", id);
                prev_tc = Some(id);
            }
            BlockExit::Event(ev) => {
                handle_event(cpu, mem, cache, emitter, buf, ev)?;
                prev_tc = None;
            }
        }
    }
}

/// React to a [`HostEvent`] observed from a block's exit.
fn handle_event<G, E>(
    cpu: &mut CpuCtx,
    mem: &mut G,
    cache: &mut CodeCache,
    emitter: &mut E,
    buf: &mut CodeBuffer,
    ev: HostEvent,
) -> CpuResult<()>
where
    G: GuestMemory,
    E: Emitter,
{
    match ev {
        HostEvent::PfExp | HostEvent::DeExp => deliver_fault(cpu, mem, ev),
        HostEvent::CpuModeChanged => {
            purge(cache, emitter, buf);
            Ok(())
        }
        HostEvent::HaltTc => Ok(()),
    }
}

/// Convert a caught `pf_exp`/`de_exp` into an architectural exception
/// delivery. The vector/fault data is expected to already be staged
/// in `cpu.exp.data` by whatever raised the event (the memory
/// subsystem on a faulting fetch, or the translator/emitter on a
/// decode-time fault); this is never a software `int n`, since those
/// are raised from inside emitted code via `raise_exp_inline`, not
/// observed here as a `HostEvent`.
fn deliver_fault<G: GuestMemory>(cpu: &mut CpuCtx, mem: &mut G, ev: HostEvent) -> CpuResult<()> {
    debug_assert!(matches!(ev, HostEvent::PfExp | HostEvent::DeExp));
    let data: ExpData = cpu.exp.data;
    lib86_except::raise_exception(cpu, mem, data, false)
}

/// Clear `HFLG_TRAMP` after the cache search but before execution, so
/// nested calls into other hooked functions still take their hooks.
fn suppress_trampoline(cpu: &mut CpuCtx, mode: DispatchMode) {
    if matches!(mode, DispatchMode::Trampoline { .. }) {
        cpu.hflags.remove(HFlags::TRAMP);
    }
}

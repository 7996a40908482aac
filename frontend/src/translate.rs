//! The translator loop: per-block fetch, decode,
//! and emit, driven by the generic `Decoder`/`Emitter`/`GuestMemory`
//! collaborators. Mirrors the shape of a `TranslatorOps`-style
//! decode/translate cycle, generalized from a fixed op-at-a-time IR
//! loop to x86's variable-length, page-crossing-aware fetch.

use log::{debug, trace};

use lib86_backend::{CodeBuffer, Emitter};
use lib86_core::{
    page_of, ControlEffect, CpuCtx, DecodeCtx, DecodeError, Fingerprint, HostEvent, TranslatedBlock,
    Vector,
};

use crate::decoder::Decoder;
use crate::guest_memory::GuestMemory;
use crate::hooks::HookMap;

/// Architectural limit on an x86 instruction's encoded length.
const MAX_INSN_LEN: usize = 15;

/// Per-block translation state.
struct TranslationCtx {
    cs_base: u32,
    virt_pc_start: u32,
    virt_pc: u32,
    /// Guest-physical address the block starts at — the cache's SMC
    /// key. Distinct from `virt_pc_start` whenever paging remaps the
    /// guest's linear address space.
    pc_phys_start: u32,
    code_size_32: bool,
    stack_size_32: bool,
    one_shot: bool,
    page_crossing: bool,
    /// Guest-virtual page the block starts on; compared against the
    /// current fetch position to detect the block crossing into a
    /// new page.
    start_page_virt: u32,
    /// Guest-physical page the block starts on, used for the
    /// page->block SMC index.
    start_page_phys: u32,
}

impl TranslationCtx {
    fn decode_ctx(&self, cpl: u8) -> DecodeCtx {
        DecodeCtx {
            code_size_32: self.code_size_32,
            stack_size_32: self.stack_size_32,
            cpl,
        }
    }
}

/// Fetch up to `MAX_INSN_LEN` guest bytes starting at `virt_pc`,
/// crossing into the following page if the instruction might. Stops
/// early (returning fewer bytes) at the first fetch that faults,
/// unless at least one byte was already fetched, in which case the
/// short window is handed to the decoder as a truncated encoding.
fn fetch_window<G: GuestMemory>(
    mem: &mut G,
    virt_pc: u32,
    eip: u32,
) -> Result<[u8; MAX_INSN_LEN], HostEvent> {
    let mut window = [0u8; MAX_INSN_LEN];
    let mut filled = 0usize;
    let mut page = page_of(virt_pc);
    let mut addr = virt_pc;
    while filled < MAX_INSN_LEN {
        let phys = match mem.get_code_addr(addr, eip) {
            Ok(p) => p,
            Err(ev) => {
                if filled == 0 {
                    return Err(ev);
                }
                break;
            }
        };
        let remaining_on_page = lib86_core::PAGE_SIZE - (addr & lib86_core::PAGE_MASK);
        let take = remaining_on_page.min((MAX_INSN_LEN - filled) as u32) as usize;
        for i in 0..take {
            window[filled + i] = mem.mem_read(phys + i as u32, 1) as u8;
        }
        filled += take;
        addr = addr.wrapping_add(take as u32);
        let next_page = page_of(addr);
        if next_page == page {
            break;
        }
        page = next_page;
    }
    Ok(window)
}

/// Translate one block starting at the guest-virtual PC implied by
/// `cpu`'s current CS/EIP, returning the finished block or the
/// architectural fault that interrupted fetch before any instruction
/// was committed.
pub fn translate_block<D, G, E>(
    cpu: &mut CpuCtx,
    mem: &mut G,
    decoder: &mut D,
    emitter: &mut E,
    buf: &mut CodeBuffer,
    hooks: &HookMap,
    single_step: bool,
) -> Result<TranslatedBlock, HostEvent>
where
    D: Decoder,
    G: GuestMemory,
    E: Emitter,
{
    let cs_base = cpu.segs.cs.hidden.base;
    let virt_pc_start = cs_base.wrapping_add(cpu.eip);
    let pc_phys_start = mem.get_code_addr(virt_pc_start, cpu.eip)?;
    let mut ctx = TranslationCtx {
        cs_base,
        virt_pc_start,
        virt_pc: virt_pc_start,
        pc_phys_start,
        code_size_32: cpu.hflags.contains(lib86_core::HFlags::CS32),
        stack_size_32: cpu.hflags.contains(lib86_core::HFlags::SS32),
        one_shot: single_step,
        page_crossing: false,
        start_page_virt: page_of(virt_pc_start),
        start_page_phys: page_of(pc_phys_start),
    };

    let entry_offset = buf.offset();
    emitter.gen_tc_prologue(buf);

    if !cpu.hflags.contains(lib86_core::HFlags::TRAMP) {
        if let Some(hook_id) = hooks.lookup(virt_pc_start) {
            trace!(target: "lib86_frontend", "hook hit at {:#x}", virt_pc_start);
            let result = emitter.gen_hook_thunk(buf, hook_id);
            emitter.gen_tc_epilogue(buf);
            return Ok(finish_block(cpu, &ctx, entry_offset, result, true));
        }
    }

    let mut insns = Vec::new();
    loop {
        let instr_eip = ctx.virt_pc.wrapping_sub(ctx.cs_base);
        let window = fetch_window(mem, ctx.virt_pc, instr_eip)?;

        let decode_ctx = ctx.decode_ctx(cpu.hflags.cpl());
        match decoder.decode_one(&window, &decode_ctx) {
            Ok(insn) => {
                ctx.virt_pc = ctx.virt_pc.wrapping_add(insn.len as u32);
                let crossed = page_of(ctx.virt_pc.wrapping_sub(1)) != ctx.start_page_virt;
                ctx.page_crossing |= crossed;
                let stop = !matches!(insn.effect, ControlEffect::Sequential)
                    || ctx.page_crossing
                    || ctx.one_shot;
                insns.push(insn);
                if stop {
                    break;
                }
            }
            Err(DecodeError::Truncated) => {
                debug!(target: "lib86_frontend", "instruction exceeds 15 bytes at {:#x}", ctx.virt_pc);
                emitter.raise_exp_inline(buf, Vector::Gp.as_u16(), 0, 0, instr_eip);
                break;
            }
            Err(DecodeError::InvalidOpcode) => {
                trace!(target: "lib86_frontend", "#UD at {:#x}", ctx.virt_pc);
                emitter.raise_exp_inline(buf, Vector::Ud.as_u16(), 0, 0, instr_eip);
                break;
            }
        }
    }

    let result = emitter.gen_code_block(cpu, &insns, buf);
    emitter.gen_tc_epilogue(buf);
    Ok(finish_block(cpu, &ctx, entry_offset, result, false))
}

fn finish_block(
    cpu: &CpuCtx,
    ctx: &TranslationCtx,
    entry_offset: usize,
    result: lib86_backend::BlockEmitResult,
    is_hook: bool,
) -> TranslatedBlock {
    let fingerprint = Fingerprint::new(ctx.cs_base, ctx.pc_phys_start, cpu.cpu_flags_const());
    let mut block = TranslatedBlock::new(fingerprint, ctx.virt_pc_start, entry_offset, ctx.start_page_phys);
    block.flags = result.flags;
    block.crosses_page = ctx.page_crossing;
    block.guest_len = ctx.virt_pc.wrapping_sub(ctx.virt_pc_start).max(result.guest_len);
    block.is_hook = is_hook;
    for (slot, site) in result.patch_site_offsets.iter().enumerate().take(2) {
        block.patch_site_offset[slot] = Some(*site);
    }
    block
}

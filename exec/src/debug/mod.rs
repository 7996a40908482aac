//! The debug-breakpoint harness: software `INT3` insertion/removal,
//! resolving and hooking the guest `#BP` handler, and the watchpoint
//! attribute in the TLB.
//!
//! The debugger UI and the emulation thread share exactly two
//! primitives: [`DebugGate`], and
//! the breakpoint list inside [`DebugState`]. Nothing else crosses the
//! thread boundary.

pub mod persist;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use lib86_core::{page_of, CpuCtx, GuestMemory, HFlags, TlbAttrs, CR0_WP};
use lib86_except::descriptor::{read_raw, GateDescriptor, GateKind, SegDescriptor};
use lib86_frontend::HookMap;

/// The `#BP` exception vector.
pub const EXP_BP: u16 = 3;

/// Sentinel hook id the emitter maps to a call into
/// [`DebugState::sw_breakpoint_handler`] rather than a guest hook
/// registered by the host embedder.
pub const DBG_BP_HOOK_ID: u32 = u32::MAX;

pub const MAX_WATCHPOINTS: usize = 4;

/// One active software breakpoint: the address and the guest byte it
/// overwrote with `0xCC`.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub addr: u32,
    pub original_byte: u8,
}

/// One active data watchpoint; up to [`MAX_WATCHPOINTS`] are retained.
#[derive(Debug, Clone, Copy)]
pub struct Watchpoint {
    pub addr: u32,
    pub size: u8,
}

/// The handshake between the debugger UI (possibly on another host
/// thread) and the emulation thread: a single gate flag, nothing more.
#[derive(Default)]
pub struct DebugGate {
    paused: AtomicBool,
}

impl DebugGate {
    pub fn new() -> Self {
        Self { paused: AtomicBool::new(false) }
    }

    /// Called by the emulation thread on hitting a breakpoint: marks
    /// itself paused and parks until the UI clears the flag.
    pub fn pause_and_wait(&self) {
        self.paused.store(true, Ordering::SeqCst);
        while self.paused.load(Ordering::SeqCst) {
            std::thread::park();
        }
    }

    /// Called by the UI thread to let the emulation thread continue.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// All debug-harness state: the UI handshake gate, the
/// breakpoint/watchpoint lists, the resolved `#BP`-handler hook
/// address, and the guest PC the emulation thread is currently paused
/// at.
pub struct DebugState {
    pub gate: DebugGate,
    pub breakpoints: Mutex<Vec<Breakpoint>>,
    pub watchpoints: Vec<Watchpoint>,
    bp_hook_addr: Option<u32>,
    pub break_pc: Option<u32>,
}

impl DebugState {
    pub fn new() -> Self {
        Self {
            gate: DebugGate::new(),
            breakpoints: Mutex::new(Vec::new()),
            watchpoints: Vec::new(),
            bp_hook_addr: None,
            break_pc: None,
        }
    }

    /// Register `addr` as a pending breakpoint if it resolves to guest
    /// RAM; returns whether it was accepted. Temporarily drops CPL to 0 and
    /// clears `CR0.WP` so the address check isn't itself blocked by
    /// guest page protection.
    pub fn insert_sw_breakpoint<M: GuestMemory>(&mut self, cpu: &mut CpuCtx, mem: &mut M, addr: u32) -> bool {
        let (old_cpl, old_wp) = lower_privilege(cpu);

        let inserted = match mem.get_write_addr(addr, 1, cpu.eip) {
            Ok(_) => cpu.tlb.get(page_of(addr)).attrs().contains(TlbAttrs::RAM),
            Err(_) => false,
        };

        restore_privilege(cpu, old_cpl, old_wp);

        if inserted {
            self.breakpoints.lock().unwrap().push(Breakpoint { addr, original_byte: 0 });
        }
        inserted
    }

    /// Patch every pending breakpoint's guest byte to `0xCC`, saving
    /// the original for later removal. The page's
    /// `WATCH` attribute is suppressed for the duration of the patch
    /// so the write doesn't itself re-trap a data watchpoint.
    pub fn apply_sw_breakpoints<M: GuestMemory>(&mut self, cpu: &mut CpuCtx, mem: &mut M) {
        let (old_cpl, old_wp) = lower_privilege(cpu);

        for bp in self.breakpoints.lock().unwrap().iter_mut() {
            let page = page_of(bp.addr);
            let saved = cpu.tlb.get(page);
            cpu.tlb.get_mut(page).remove_attrs(TlbAttrs::WATCH);

            if let Ok(phys) = mem.get_read_addr(bp.addr, 1, cpu.eip) {
                bp.original_byte = mem.mem_read(phys, 1) as u8;
            }
            if let Ok((phys, _)) = mem.get_write_addr(bp.addr, 1, cpu.eip) {
                mem.mem_write(phys, 1, 0xCC);
            }

            *cpu.tlb.get_mut(page) = saved;
        }

        restore_privilege(cpu, old_cpl, old_wp);
    }

    /// Restore every patched breakpoint's original byte.
    pub fn remove_sw_breakpoints<M: GuestMemory>(&mut self, cpu: &mut CpuCtx, mem: &mut M) {
        let (old_cpl, old_wp) = lower_privilege(cpu);

        for bp in self.breakpoints.lock().unwrap().iter() {
            let page = page_of(bp.addr);
            let saved = cpu.tlb.get(page);
            cpu.tlb.get_mut(page).remove_attrs(TlbAttrs::WATCH);

            if let Ok((phys, _)) = mem.get_write_addr(bp.addr, 1, cpu.eip) {
                mem.mem_write(phys, 1, bp.original_byte as u32);
            }

            *cpu.tlb.get_mut(page) = saved;
        }

        restore_privilege(cpu, old_cpl, old_wp);
    }

    /// Resolve the guest `#BP` handler's entry point and install a
    /// hook there. A failure (bad IDT/GDT state, or a
    /// guest exception while walking the tables) is logged and leaves
    /// no hook installed — mirroring `dbg_add_bp_hook`'s behavior of
    /// silently giving up rather than propagating a host-level abort.
    pub fn add_bp_hook<M: GuestMemory>(&mut self, cpu: &mut CpuCtx, mem: &mut M, hooks: &mut HookMap) {
        if let Some(addr) = resolve_bp_handler(cpu, mem) {
            self.bp_hook_addr = Some(addr);
            hooks.install(addr, DBG_BP_HOOK_ID);
        }
    }

    /// Re-resolve and re-install the `#BP` hook after guest state that
    /// affects the walk (IDT/GDT/LDT, CR0.PE) has changed.
    pub fn update_bp_hook<M: GuestMemory>(&mut self, cpu: &mut CpuCtx, mem: &mut M, hooks: &mut HookMap) {
        if let Some(addr) = self.bp_hook_addr.take() {
            hooks.remove(addr);
        }
        self.add_bp_hook(cpu, mem, hooks);
    }
}

impl Default for DebugState {
    fn default() -> Self {
        Self::new()
    }
}

fn lower_privilege(cpu: &mut CpuCtx) -> (u8, u32) {
    let old_cpl = cpu.hflags.cpl();
    cpu.hflags = cpu.hflags.with_cpl(0);
    let old_wp = cpu.ctrl.cr0 & CR0_WP;
    cpu.ctrl.cr0 &= !CR0_WP;
    (old_cpl, old_wp)
}

fn restore_privilege(cpu: &mut CpuCtx, old_cpl: u8, old_wp: u32) {
    cpu.hflags = cpu.hflags.with_cpl(old_cpl);
    cpu.ctrl.cr0 = (cpu.ctrl.cr0 & !CR0_WP) | old_wp;
}

fn read_idt_gate<M: GuestMemory>(mem: &mut M, idtr_base: u32, vector: u16, eip: u32) -> Result<[u8; 8], ()> {
    let virt = idtr_base.wrapping_add((vector as u32) * 8);
    let lo_phys = mem.get_read_addr(virt, 4, eip).map_err(|_| ())?;
    let lo = mem.mem_read(lo_phys, 4);
    let hi_phys = mem.get_read_addr(virt + 4, 4, eip).map_err(|_| ())?;
    let hi = mem.mem_read(hi_phys, 4);
    let mut bytes = [0u8; 8];
    bytes[0..4].copy_from_slice(&lo.to_le_bytes());
    bytes[4..8].copy_from_slice(&hi.to_le_bytes());
    Ok(bytes)
}

/// Walk IDT -> GDT/LDT to find the first instruction address of the
/// guest `#BP` handler. Returns `None` and logs a
/// warning on any failure.
fn resolve_bp_handler<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M) -> Option<u32> {
    if !cpu.hflags.is_protected_mode() {
        let limit = cpu.segs.idtr.limit;
        if (EXP_BP as u32) * 4 + 3 > limit {
            warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: IDT limit exceeded");
            return None;
        }
        let virt = cpu.segs.idtr.base.wrapping_add((EXP_BP as u32) * 4);
        let phys = mem.get_read_addr(virt, 4, cpu.eip).ok()?;
        let entry = mem.mem_read(phys, 4);
        let new_base = (entry >> 16) << 4;
        let new_eip = entry & 0xFFFF;
        return Some(new_base.wrapping_add(new_eip));
    }

    let idtr = cpu.segs.idtr;
    if (EXP_BP as u32) * 8 + 7 > idtr.limit {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: IDT limit exceeded");
        return None;
    }
    let Ok(raw) = read_idt_gate(mem, idtr.base, EXP_BP, cpu.eip) else {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: a guest exception was raised");
        return None;
    };
    let gate = GateDescriptor::parse(raw);
    if !matches!(
        gate.kind,
        GateKind::Interrupt16 | GateKind::Interrupt32 | GateKind::Trap16 | GateKind::Trap32
    ) {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: unknown IDT descriptor type");
        return None;
    }
    if !gate.present {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: IDT descriptor not present");
        return None;
    }
    if gate.selector & 0xFFFC == 0 {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: selector specified by the IDT descriptor points to the null GDT descriptor");
        return None;
    }

    let seg_raw = match read_raw(
        mem,
        cpu.segs.gdtr.base,
        cpu.segs.gdtr.limit,
        cpu.segs.ldtr.base,
        cpu.segs.ldtr.limit,
        gate.selector,
        cpu.eip,
    ) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: GDT or LDT limit exceeded");
            return None;
        }
    };
    let seg = SegDescriptor::parse(seg_raw);
    if !seg.present() {
        warn!(target: "lib86_exec", "failed to install hook for the breakpoint exception handler: GDT or LDT descriptor not present");
        return None;
    }

    Some(seg.base.wrapping_add(gate.offset))
}

/// Pop EIP/CS/EFLAGS (and ESP/SS on an outer-privilege return) off the
/// guest stack, mirroring in reverse what `protected_mode::deliver`
/// and `real_mode::deliver` pushed. Used only by the debug stub's
/// synchronous return path, never by ordinary guest `iret` execution
/// (that belongs to the translator/emitter, out of scope here).
pub fn perform_iret<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M) -> Result<(), ()> {
    if !cpu.hflags.is_protected_mode() {
        let eip = pop16(cpu, mem)? as u32;
        let cs = pop16(cpu, mem)? as u16;
        let flags = pop16(cpu, mem)? as u32;
        cpu.eip = eip;
        cpu.segs.cs.selector = cs;
        cpu.segs.cs.hidden.base = (cs as u32) << 4;
        cpu.eflags_canonical = (cpu.eflags_canonical & !0xFFFF) | flags;
        return Ok(());
    }

    let is_32 = cpu.hflags.contains(HFlags::CS32);
    let eip = pop_word(cpu, mem, is_32)?;
    let cs = pop_word(cpu, mem, is_32)? as u16;
    let eflags = pop_word(cpu, mem, is_32)?;

    let old_cpl = cpu.hflags.cpl();
    let new_cpl = (cs & 0b11) as u8;

    cpu.eip = eip;
    cpu.segs.cs.selector = cs;
    cpu.eflags_canonical = eflags;

    if let Ok(raw) = read_raw(
        mem,
        cpu.segs.gdtr.base,
        cpu.segs.gdtr.limit,
        cpu.segs.ldtr.base,
        cpu.segs.ldtr.limit,
        cs,
        cpu.eip,
    ) {
        let desc = SegDescriptor::parse(raw);
        cpu.segs.cs.hidden.base = desc.base;
        cpu.segs.cs.hidden.limit = desc.limit;
        if desc.is_32bit() {
            cpu.hflags.insert(HFlags::CS32);
        } else {
            cpu.hflags.remove(HFlags::CS32);
        }
    }
    cpu.hflags = cpu.hflags.with_cpl(new_cpl);

    if new_cpl > old_cpl {
        let esp = pop_word(cpu, mem, is_32)?;
        let ss = pop_word(cpu, mem, is_32)? as u16;
        cpu.regs.esp = esp;
        cpu.segs.ss.selector = ss;
        if let Ok(raw) = read_raw(
            mem,
            cpu.segs.gdtr.base,
            cpu.segs.gdtr.limit,
            cpu.segs.ldtr.base,
            cpu.segs.ldtr.limit,
            ss,
            cpu.eip,
        ) {
            let desc = SegDescriptor::parse(raw);
            cpu.segs.ss.hidden.base = desc.base;
            cpu.segs.ss.hidden.limit = desc.limit;
        }
    }

    Ok(())
}

fn pop16<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M) -> Result<u16, ()> {
    let sp = cpu.regs.esp as u16;
    let virt = cpu.segs.ss.hidden.base.wrapping_add(sp as u32);
    let phys = mem.get_read_addr(virt, 2, cpu.eip).map_err(|_| ())?;
    let val = mem.mem_read(phys, 2) as u16;
    cpu.regs.esp = (cpu.regs.esp & !0xFFFF) | (sp.wrapping_add(2) as u32);
    Ok(val)
}

fn pop_word<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M, is_32: bool) -> Result<u32, ()> {
    let size = if is_32 { 4u32 } else { 2 };
    let mask = if cpu.segs.ss.hidden.flags & 0x4 != 0 { u32::MAX } else { 0xFFFF };
    let sp = cpu.regs.esp & mask;
    let virt = cpu.segs.ss.hidden.base.wrapping_add(sp);
    let phys = mem.get_read_addr(virt, size as u8, cpu.eip).map_err(|_| ())?;
    let val = mem.mem_read(phys, size as u8);
    let new_sp = sp.wrapping_add(size) & mask;
    cpu.regs.esp = (cpu.regs.esp & !mask) | new_sp;
    Ok(val)
}

/// Runs on the emulation thread when the guest vectors into the
/// installed `#BP` hook. `ret_eip` is the guest EIP
/// `#BP` delivery pushed, read by the caller from the top of the
/// guest stack before invoking this hook.
///
/// If `ret_eip - 1` (relative to the current `CS.base`) matches one of
/// our breakpoints, the handler restores original bytes, parks on
/// `self.gate` until the debugger UI resumes it, then performs the
/// equivalent of `iret` to continue the interrupted guest code.
/// Otherwise this `#BP` wasn't ours, and control re-enters the guest
/// handler itself via a trampoline call so nested host-hooked calls
/// still fire correctly.
#[allow(clippy::too_many_arguments)]
pub fn sw_breakpoint_handler<G, D, E>(
    state: &mut DebugState,
    cpu: &mut CpuCtx,
    mem: &mut G,
    cache: &mut lib86_cache::CodeCache,
    decoder: &mut D,
    emitter: &mut E,
    buf: &mut lib86_backend::CodeBuffer,
    hooks: &HookMap,
    ret_eip: u32,
) -> lib86_core::CpuResult<()>
where
    G: GuestMemory,
    D: lib86_frontend::Decoder,
    E: lib86_backend::Emitter,
{
    let pc = cpu.segs.cs.hidden.base.wrapping_add(ret_eip).wrapping_sub(1);
    let is_ours = state.breakpoints.lock().unwrap().iter().any(|bp| bp.addr == pc);

    if is_ours {
        state.remove_sw_breakpoints(cpu, mem);
        state.break_pc = Some(pc);
        state.gate.pause_and_wait();
        if perform_iret(cpu, mem).is_err() {
            return Err(lib86_core::CpuError::new(
                lib86_core::Lib86Status::InternalError,
                "unhandled exception while returning from a breakpoint",
            ));
        }
        Ok(())
    } else {
        crate::trampoline::call_trampoline(cpu, mem, cache, decoder, emitter, buf, hooks, cpu.eip, ret_eip)
    }
}

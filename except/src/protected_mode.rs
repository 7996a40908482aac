use lib86_core::{CpuCtx, ExpData, GuestMemory, HFlags, HostEvent, Vector};

use crate::descriptor::{self, DescError, GateDescriptor, GateKind, SegDescriptor};

/// Composite validity mask a target stack segment must satisfy on a
/// privilege switch: present, writable data
/// segment, DPL and RPL both equal to the target privilege level.
fn ss_valid_for_switch(desc: SegDescriptor, selector: u16, target_dpl: u8) -> bool {
    desc.present()
        && desc.is_writable_data()
        && desc.dpl() == target_dpl
        && (selector & descriptor::SEL_RPL_MASK) as u8 == target_dpl
}

fn selector_error(vector: u16) -> u16 {
    (vector) * 8 + 2
}

/// Deliver `exp` in protected mode. `is_software_int` distinguishes a guest `int n` from a
/// hardware/CPU-raised exception for rule 3's DPL check. On a fault
/// path inside delivery, returns the event the caller's bounded
/// re-delivery loop should apply the double-fault rules to next,
/// rather than recursing directly.
pub fn deliver<M: GuestMemory>(
    cpu: &mut CpuCtx,
    mem: &mut M,
    exp: &ExpData,
    is_software_int: bool,
    zero_context: bool,
) -> Result<(), (u16, u16)> {
    let vector = exp.vector;
    let idtr_limit = cpu.segs.idtr.limit;

    // Rule 1.
    if (vector as u32) * 8 + 7 > idtr_limit {
        return Err((Vector::Gp.as_u16(), selector_error(vector)));
    }

    // Rule 2.
    let gate_raw = descriptor::read_idt_gate(mem, cpu.segs.idtr.base, vector, exp.eip)
        .map_err(|e| fault_to_vector(e, vector))?;
    let gate = GateDescriptor::parse(gate_raw);

    match gate.kind {
        GateKind::Task => {
            // Task gates are unimplemented; the caller converts this
            // into a host-level abort rather than a guest-visible
            // vector.
            return Err((Vector::Gp.as_u16(), selector_error(vector)));
        }
        GateKind::Invalid => return Err((Vector::Gp.as_u16(), selector_error(vector))),
        _ => {}
    }

    // Rule 3.
    if is_software_int && gate.dpl < cpu.hflags.cpl() {
        return Err((Vector::Gp.as_u16(), selector_error(vector)));
    }

    // Rule 4.
    if !gate.present {
        return Err((Vector::Np.as_u16(), selector_error(vector)));
    }

    // Rule 5.
    if gate.selector & !descriptor::SEL_RPL_MASK == 0 {
        return Err((Vector::Gp.as_u16(), 0));
    }
    let cs_raw = descriptor::read_raw(
        mem,
        cpu.segs.gdtr.base,
        cpu.segs.gdtr.limit,
        cpu.segs.ldtr.base,
        cpu.segs.ldtr.limit,
        gate.selector,
        exp.eip,
    )
    .map_err(|e| fault_to_vector(e, vector))?;
    let cs_desc = SegDescriptor::parse(cs_raw);
    let cs_sel_error = gate.selector & !descriptor::SEL_RPL_MASK;
    if !cs_desc.is_code_or_data() || (cs_desc.access & 0x08) == 0 {
        return Err((Vector::Gp.as_u16(), cs_sel_error));
    }
    if !cs_desc.present() {
        return Err((Vector::Np.as_u16(), cs_sel_error));
    }
    descriptor::set_accessed(
        mem,
        cpu.segs.gdtr.base,
        cpu.segs.gdtr.limit,
        cpu.segs.ldtr.base,
        cpu.segs.ldtr.limit,
        gate.selector,
        exp.eip,
    )
    .map_err(|e| fault_to_vector(e, vector))?;

    // A conforming code segment always runs at the caller's CPL: no
    // privilege switch even if its DPL is numerically lower.
    let conforming = cs_desc.access & 0x04 != 0;
    let cpl = cpu.hflags.cpl();
    let target_dpl = if conforming { cpl } else { cs_desc.dpl() };
    let has_error_code = Vector::has_error_code(vector);
    let gate_is_32 = gate.is_32bit();

    if target_dpl > cpl {
        return Err((Vector::Gp.as_u16(), cs_sel_error));
    }

    if target_dpl < cpl {
        // Rule 6: privilege switch.
        let (new_ss_sel, new_esp) =
            read_tss_stack(cpu, mem, target_dpl, exp.eip).map_err(|e| fault_to_vector(e, vector))?;
        let ss_raw = descriptor::read_raw(
            mem,
            cpu.segs.gdtr.base,
            cpu.segs.gdtr.limit,
            cpu.segs.ldtr.base,
            cpu.segs.ldtr.limit,
            new_ss_sel,
            exp.eip,
        )
        .map_err(|e| fault_to_vector(e, vector))?;
        let ss_desc = SegDescriptor::parse(ss_raw);
        if !ss_valid_for_switch(ss_desc, new_ss_sel, target_dpl) {
            return Err((Vector::Ts.as_u16(), selector_error(vector)));
        }
        descriptor::set_accessed(
            mem,
            cpu.segs.gdtr.base,
            cpu.segs.gdtr.limit,
            cpu.segs.ldtr.base,
            cpu.segs.ldtr.limit,
            new_ss_sel,
            exp.eip,
        )
        .map_err(|e| fault_to_vector(e, vector))?;

        let old_ss = cpu.segs.ss.selector;
        let old_esp = cpu.regs.esp;

        cpu.segs.ss.selector = new_ss_sel;
        cpu.segs.ss.hidden.base = ss_desc.base;
        cpu.segs.ss.hidden.limit = ss_desc.limit;
        cpu.regs.esp = new_esp;
        cpu.hflags = cpu.hflags.with_cpl(target_dpl);
        if ss_desc.is_32bit() {
            cpu.hflags.insert(HFlags::SS32);
        } else {
            cpu.hflags.remove(HFlags::SS32);
        }

        push_frame(
            cpu,
            mem,
            exp,
            gate_is_32,
            has_error_code,
            zero_context,
            Some((old_ss, old_esp)),
        )
        .map_err(|e| fault_to_vector(e, vector))?;
    } else {
        // Rule 7: same privilege.
        push_frame(cpu, mem, exp, gate_is_32, has_error_code, zero_context, None)
            .map_err(|e| fault_to_vector(e, vector))?;
    }

    // Rule 10: commit.
    cpu.segs.cs.selector = gate.selector;
    cpu.segs.cs.hidden.base = cs_desc.base;
    cpu.segs.cs.hidden.limit = cs_desc.limit;
    cpu.eip = if zero_context { 0 } else { gate.offset };
    cpu.eflags_canonical &= !((1 << 17) | (1 << 16) | (1 << 14) | (1 << 8));
    if gate.masks_if() {
        cpu.eflags_canonical &= !(1 << 9);
    }
    cpu.hflags = cpu.hflags.with_cpl(target_dpl);
    if cs_desc.is_32bit() {
        cpu.hflags.insert(HFlags::CS32);
    } else {
        cpu.hflags.remove(HFlags::CS32);
    }
    cpu.hflags.remove(HFlags::DBG_TRAP);
    if vector == Vector::Pf.as_u16() {
        cpu.ctrl.cr2 = exp.fault_addr;
    }
    if vector == Vector::Db.as_u16() {
        cpu.dbg.clear_gd();
    }

    Ok(())
}

fn fault_to_vector(e: DescError, _vector: u16) -> (u16, u16) {
    match e {
        DescError::Limit => (Vector::Gp.as_u16(), 0),
        DescError::Fault(HostEvent::PfExp) => (Vector::Pf.as_u16(), 0),
        DescError::Fault(_) => (Vector::Gp.as_u16(), 0),
    }
}

/// Read the target DPL's stack pointer from the 32-bit TSS addressed
/// by TR. Offsets follow the architectural
/// 32-bit TSS layout: `ESPn` at `4 + n*8`, `SSn` immediately after.
fn read_tss_stack<M: GuestMemory>(
    cpu: &CpuCtx,
    mem: &mut M,
    dpl: u8,
    eip: u32,
) -> Result<(u16, u32), DescError> {
    let tss_base = cpu.segs.tr.base;
    let esp_off = 4 + (dpl as u32) * 8;
    let ss_off = esp_off + 4;
    let esp_phys = mem
        .get_read_addr(tss_base + esp_off, 4, eip)
        .map_err(DescError::Fault)?;
    let esp = mem.mem_read(esp_phys, 4);
    let ss_phys = mem
        .get_read_addr(tss_base + ss_off, 2, eip)
        .map_err(DescError::Fault)?;
    let ss = mem.mem_read(ss_phys, 2) as u16;
    Ok((ss, esp))
}

fn push_word<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M, val: u32, is_32: bool) -> Result<(), HostEvent> {
    let size = if is_32 { 4 } else { 2 };
    let mask = if cpu.hflags.contains(HFlags::SS32) {
        u32::MAX
    } else {
        0xFFFF
    };
    let new_sp = (cpu.regs.esp & mask).wrapping_sub(size) & mask;
    cpu.regs.esp = (cpu.regs.esp & !mask) | new_sp;
    let virt = cpu.segs.ss.hidden.base.wrapping_add(new_sp);
    let phys = mem.get_write_addr(virt, size as u8, cpu.eip)?.0;
    mem.mem_write(phys, size as u8, val);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn push_frame<M: GuestMemory>(
    cpu: &mut CpuCtx,
    mem: &mut M,
    exp: &ExpData,
    is_32: bool,
    has_error_code: bool,
    zero_context: bool,
    old_stack: Option<(u16, u32)>,
) -> Result<(), HostEvent> {
    if let Some((old_ss, old_esp)) = old_stack {
        push_word(cpu, mem, old_ss as u32, is_32)?;
        push_word(cpu, mem, old_esp, is_32)?;
    }
    push_word(cpu, mem, cpu.eflags_canonical, is_32)?;
    push_word(cpu, mem, cpu.segs.cs.selector as u32, is_32)?;
    let eip = if zero_context { 0 } else { exp.eip };
    push_word(cpu, mem, eip, is_32)?;
    if has_error_code {
        let code = if zero_context { 0 } else { exp.code as u32 };
        push_word(cpu, mem, code, is_32)?;
    }
    Ok(())
}

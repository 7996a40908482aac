use lib86_core::{CpuCtx, ExpData, GuestMemory, HFlags, HostEvent, Vector};

/// EFLAGS bits cleared on real-mode exception delivery: AC, RF, IF, TF.
const CLEAR_ON_DELIVERY: u32 = (1 << 18) | (1 << 16) | (1 << 9) | (1 << 8);

fn push16<M: GuestMemory>(cpu: &mut CpuCtx, mem: &mut M, val: u16) -> Result<(), HostEvent> {
    let sp = (cpu.regs.esp as u16).wrapping_sub(2);
    cpu.regs.esp = (cpu.regs.esp & !0xFFFF) | sp as u32;
    let virt = cpu.segs.ss.hidden.base.wrapping_add(sp as u32);
    let phys = mem.get_write_addr(virt, 2, cpu.eip)?.0;
    mem.mem_write(phys, 2, val as u32);
    Ok(())
}

fn fault_to_vector(e: HostEvent) -> (u16, u16) {
    match e {
        HostEvent::PfExp => (Vector::Pf.as_u16(), 0),
        _ => (Vector::Gp.as_u16(), 0),
    }
}

/// Deliver `vector`/`code`/`eip` in real-address mode. On a fault raised by delivery itself
/// (rather than by the guest instruction), returns the vector/code
/// the caller's bounded re-delivery loop should retry with, rather
/// than recursing directly.
pub fn deliver<M: GuestMemory>(
    cpu: &mut CpuCtx,
    mem: &mut M,
    exp: &ExpData,
    zero_context: bool,
) -> Result<(), (u16, u16)> {
    let vector = exp.vector;
    let idtr_limit = cpu.segs.idtr.limit;
    if (vector as u32) * 4 + 3 > idtr_limit {
        return Err((Vector::Gp.as_u16(), vector * 8 + 2));
    }

    let entry_virt = cpu.segs.idtr.base.wrapping_add((vector as u32) * 4);
    let entry_phys = mem.get_read_addr(entry_virt, 4, exp.eip).map_err(fault_to_vector)?;
    let entry = mem.mem_read(entry_phys, 4);
    let new_cs = (entry >> 16) as u16;
    let new_ip = entry as u16;

    let eip = if zero_context { 0 } else { exp.eip };

    push16(cpu, mem, cpu.eflags_canonical as u16).map_err(fault_to_vector)?;
    push16(cpu, mem, cpu.segs.cs.selector).map_err(fault_to_vector)?;
    push16(cpu, mem, eip as u16).map_err(fault_to_vector)?;

    cpu.eflags_canonical &= !CLEAR_ON_DELIVERY;
    cpu.segs.cs.selector = new_cs;
    cpu.segs.cs.hidden.base = (new_cs as u32) << 4;
    cpu.eip = new_ip as u32;
    cpu.hflags.remove(HFlags::DBG_TRAP);
    if vector == Vector::Db.as_u16() {
        cpu.dbg.clear_gd();
    }

    Ok(())
}

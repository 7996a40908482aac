//! Coverage of the exception engine: real-mode and
//! protected-mode vectoring, and the double-fault
//! algebra that sits in front of both.

use lib86_core::{CpuCtx, CpuFlags, ExpData, HFlags, Lib86Status, Vector};
use lib86_except::{dbl_fault, descriptor, protected_mode, raise_exception, real_mode, Escalation};

use crate::mocks::MockMemory;

fn real_mode_cpu() -> CpuCtx {
    let mut cpu = CpuCtx::new(CpuFlags::empty());
    cpu.segs.ss.hidden.base = 0x8000;
    cpu.regs.esp = 0x1000;
    cpu.segs.idtr.base = 0;
    cpu.segs.idtr.limit = 0x3FF;
    cpu
}

fn write_idt16_entry(mem: &mut MockMemory, idtr_base: u32, vector: u16, cs: u16, ip: u16) {
    let addr = idtr_base + (vector as u32) * 4;
    mem.write_u16(addr, ip);
    mem.write_u16(addr + 2, cs);
}

fn write_seg_desc(mem: &mut MockMemory, addr: u32, base: u32, limit: u32, access: u8, flags4: u8) {
    let mut raw = [0u8; 8];
    raw[0..2].copy_from_slice(&(limit as u16).to_le_bytes());
    raw[2..4].copy_from_slice(&(base as u16).to_le_bytes());
    raw[4] = ((base >> 16) & 0xFF) as u8;
    raw[5] = access;
    raw[6] = (((limit >> 16) & 0x0F) as u8) | (flags4 << 4);
    raw[7] = ((base >> 24) & 0xFF) as u8;
    mem.write_bytes(addr, &raw);
}

fn write_gate_desc(mem: &mut MockMemory, addr: u32, offset: u32, selector: u16, type_attr: u8) {
    let mut raw = [0u8; 8];
    raw[0..2].copy_from_slice(&(offset as u16).to_le_bytes());
    raw[2..4].copy_from_slice(&selector.to_le_bytes());
    raw[4] = 0;
    raw[5] = type_attr;
    raw[6..8].copy_from_slice(&((offset >> 16) as u16).to_le_bytes());
    mem.write_bytes(addr, &raw);
}

const CODE_ACCESS_DPL0: u8 = 0x9A; // present, S=1, exec, readable, dpl=0
const CODE_ACCESS_DPL3: u8 = 0xFA; // present, S=1, exec, readable, dpl=3, non-conforming
const CODE_ACCESS_CONFORMING_DPL0: u8 = 0x9E; // present, S=1, exec, conforming, readable, dpl=0
const DATA_ACCESS_DPL0: u8 = 0x92; // present, S=1, writable data, dpl=0
const BIG_FLAGS: u8 = 0b0100; // D/B bit: 32-bit segment

#[test]
fn real_mode_idt_limit_violation_reports_gp_with_selector_style_error_code() {
    let mut cpu = real_mode_cpu();
    cpu.segs.idtr.limit = 10; // vector 6: 6*4+3 = 27 > 10
    let mut mem = MockMemory::new(0x10000);
    let exp = ExpData {
        vector: Vector::Ud.as_u16(),
        eip: 0x100,
        code: 0,
        fault_addr: 0,
    };

    let result = real_mode::deliver(&mut cpu, &mut mem, &exp, false);

    assert_eq!(result, Err((Vector::Gp.as_u16(), Vector::Ud.as_u16() * 8 + 2)));
}

#[test]
fn real_mode_delivery_pushes_flags_cs_ip_and_loads_the_gate() {
    let mut cpu = real_mode_cpu();
    cpu.segs.cs.selector = 0x1234;
    cpu.segs.cs.hidden.base = 0x12340;
    cpu.eflags_canonical = 0x0246;
    let mut mem = MockMemory::new(0x10000);
    write_idt16_entry(&mut mem, 0, Vector::Bp.as_u16(), 0x00F0, 0x0040);

    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x55,
        code: 0,
        fault_addr: 0,
    };
    let starting_esp = cpu.regs.esp;

    real_mode::deliver(&mut cpu, &mut mem, &exp, false).expect("idt entry is in range");

    assert_eq!(cpu.segs.cs.selector, 0x00F0);
    assert_eq!(cpu.eip, 0x0040);
    assert_eq!(cpu.regs.esp, starting_esp - 6, "three 16-bit pushes, no error code in real mode");

    let ip_word = mem.read_u32(0x8000 + (starting_esp - 6)) & 0xFFFF;
    let cs_word = mem.read_u32(0x8000 + (starting_esp - 4)) & 0xFFFF;
    let flags_word = mem.read_u32(0x8000 + (starting_esp - 2)) & 0xFFFF;
    assert_eq!(ip_word, 0x55);
    assert_eq!(cs_word, 0x1234);
    assert_eq!(flags_word, 0x0246);
}

#[test]
fn double_fault_algebra_escalates_two_contributory_faults_and_triple_faults_on_a_third() {
    use lib86_core::ExpInfo;

    let mut exp = ExpInfo::new();
    exp.previous_vector = Vector::Gp.as_u16();
    let escalation = dbl_fault::evaluate(&exp, Vector::Gp.as_u16());
    assert_eq!(
        escalation,
        Escalation::Deliver {
            vector: Vector::Df.as_u16(),
            zero_context: true,
        }
    );

    exp.previous_vector = Vector::Df.as_u16();
    let escalation = dbl_fault::evaluate(&exp, Vector::Ud.as_u16());
    assert_eq!(escalation, Escalation::TripleFault);
}

#[test]
fn raise_exception_escalates_a_second_page_fault_into_a_zero_context_double_fault() {
    let mut cpu = real_mode_cpu();
    cpu.exp.previous_vector = Vector::Pf.as_u16();
    cpu.segs.cs.selector = 0x2000;
    let mut mem = MockMemory::new(0x10000);
    write_idt16_entry(&mut mem, 0, Vector::Df.as_u16(), 0x00A0, 0x0070);

    let exp = ExpData {
        vector: Vector::Pf.as_u16(),
        eip: 0x900,
        code: 0x4,
        fault_addr: 0xdead0000,
    };
    raise_exception(&mut cpu, &mut mem, exp, false).expect("the #DF vector itself is in range");

    assert_eq!(cpu.segs.cs.selector, 0x00A0);
    assert_eq!(cpu.eip, 0x0070);
    assert_eq!(cpu.exp.previous_vector, lib86_core::INVALID_VECTOR, "a successful delivery resets it");

    let pushed_ip = mem.read_u32(0x8000 + cpu.regs.esp) & 0xFFFF;
    assert_eq!(pushed_ip, 0, "zero_context zeroes the pushed return eip");
}

#[test]
fn raise_exception_aborts_with_a_triple_fault_once_previous_was_already_a_double_fault() {
    let mut cpu = real_mode_cpu();
    cpu.exp.previous_vector = Vector::Df.as_u16();
    let mut mem = MockMemory::new(0x10000);

    let exp = ExpData {
        vector: Vector::Ud.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    let err = raise_exception(&mut cpu, &mut mem, exp, false).unwrap_err();

    assert_eq!(err.status, Lib86Status::Success);
    assert!(err.message.contains("triple fault"));
}

fn protected_mode_cpu(cpl: u8) -> CpuCtx {
    let mut cpu = CpuCtx::new(CpuFlags::empty());
    cpu.hflags = HFlags::PE_MODE | HFlags::CS32 | HFlags::SS32;
    cpu.hflags = cpu.hflags.with_cpl(cpl);
    cpu.segs.idtr.base = 0x1000;
    cpu.segs.idtr.limit = 0x7FF;
    cpu.segs.gdtr.base = 0x2000;
    cpu.segs.gdtr.limit = 0x7FF;
    cpu.segs.ss.hidden.base = 0x9000;
    cpu.regs.esp = 0x2000;
    cpu.eflags_canonical = 0x0246; // IF (bit9) and other bits set
    cpu
}

#[test]
fn protected_mode_interrupt_gate_masks_if_but_trap_gate_leaves_it_set() {
    let mut mem = MockMemory::new(0x20000);
    // CS descriptor at selector 0x08: dpl 0, present, 32-bit code.
    write_seg_desc(&mut mem, 0x2008, 0x4000, 0xFFFF, CODE_ACCESS_DPL0, BIG_FLAGS);

    // Vector 3 (#BP) as a 32-bit interrupt gate.
    write_gate_desc(&mut mem, 0x1000 + 3 * 8, 0x5000, 0x0008, 0x8E);
    let mut cpu = protected_mode_cpu(0);
    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).expect("gate and cs descriptor are valid");
    assert_eq!(cpu.eflags_canonical & (1 << 9), 0, "interrupt gate masks IF");

    // Same setup, vector 4, as a 32-bit trap gate this time.
    write_gate_desc(&mut mem, 0x1000 + 4 * 8, 0x5000, 0x0008, 0x8F);
    let mut cpu = protected_mode_cpu(0);
    let exp = ExpData {
        vector: Vector::Of.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).expect("gate and cs descriptor are valid");
    assert_ne!(cpu.eflags_canonical & (1 << 9), 0, "trap gate leaves IF alone");
}

#[test]
fn protected_mode_delivery_sets_the_accessed_bit_on_the_target_code_descriptor() {
    let mut mem = MockMemory::new(0x20000);
    write_seg_desc(&mut mem, 0x2008, 0x4000, 0xFFFF, CODE_ACCESS_DPL0, BIG_FLAGS);
    write_gate_desc(&mut mem, 0x1000 + 3 * 8, 0x5000, 0x0008, 0x8E);
    let mut cpu = protected_mode_cpu(0);
    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };

    let access_before = mem.read_u32(0x2008 + 5) & 0xFF;
    assert_eq!(access_before & 0x01, 0, "accessed bit starts clear");

    protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).unwrap();

    let access_after = mem.read_u32(0x2008 + 5) & 0xFF;
    assert_eq!(access_after & 0x01, 1, "delivery must set the code descriptor's accessed bit");
}

#[test]
fn protected_mode_privilege_switch_reads_the_new_stack_from_the_tss_and_drops_to_cpl0() {
    let mut mem = MockMemory::new(0x20000);
    // Target CS: dpl 0.
    write_seg_desc(&mut mem, 0x2008, 0x4000, 0xFFFF, CODE_ACCESS_DPL0, BIG_FLAGS);
    // SS0 descriptor at selector 0x10: dpl 0, writable data, 32-bit.
    write_seg_desc(&mut mem, 0x2010, 0x9000, 0xFFFF, DATA_ACCESS_DPL0, BIG_FLAGS);
    write_gate_desc(&mut mem, 0x1000 + 3 * 8, 0x5000, 0x0008, 0x8E);

    let mut cpu = protected_mode_cpu(3);
    cpu.segs.tr.base = 0x3000;
    // TSS layout: esp0 at offset 4, ss0 at offset 8.
    mem.write_bytes(0x3004, &0x6000u32.to_le_bytes());
    mem.write_u16(0x3008, 0x10);
    cpu.segs.ss.selector = 0x33; // some ring-3 stack selector
    cpu.regs.esp = 0x1234;

    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).expect("privilege switch is well formed");

    assert_eq!(cpu.hflags.cpl(), 0);
    assert_eq!(cpu.segs.ss.selector, 0x10);
    // The old SS/ESP were pushed onto the new stack below the standard
    // frame, then the usual flags/cs/ip frame.
    // Five 32-bit pushes onto the fresh TSS-supplied stack: old
    // ss/esp, then the usual eflags/cs/eip frame (#BP carries no
    // error code).
    assert_eq!(cpu.regs.esp, 0x6000 - 5 * 4);

    let ss_access = mem.read_u32(0x2010 + 5) & 0xFF;
    assert_eq!(ss_access & 0x01, 1, "the target SS descriptor's accessed bit is set too");
}

#[test]
fn protected_mode_less_privileged_handler_segment_faults_with_the_cs_selector_error_code() {
    let mut mem = MockMemory::new(0x20000);
    // Target CS: dpl 3, non-conforming — less privileged than a cpl-0 caller.
    write_seg_desc(&mut mem, 0x2008, 0x4000, 0xFFFF, CODE_ACCESS_DPL3, BIG_FLAGS);
    write_gate_desc(&mut mem, 0x1000 + 3 * 8, 0x5000, 0x0008, 0x8E);

    let mut cpu = protected_mode_cpu(0);
    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    let err = protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).unwrap_err();
    assert_eq!(
        err,
        (Vector::Gp.as_u16(), 0x0008),
        "a handler less privileged than the caller faults, keyed by the CS selector"
    );
}

#[test]
fn protected_mode_conforming_handler_segment_never_switches_privilege() {
    let mut mem = MockMemory::new(0x20000);
    // Target CS: dpl 0, conforming — runs at the caller's cpl regardless.
    write_seg_desc(&mut mem, 0x2008, 0x4000, 0xFFFF, CODE_ACCESS_CONFORMING_DPL0, BIG_FLAGS);
    write_gate_desc(&mut mem, 0x1000 + 3 * 8, 0x5000, 0x0008, 0x8E);

    let mut cpu = protected_mode_cpu(3);
    let starting_esp = cpu.regs.esp;
    let starting_ss = cpu.segs.ss.selector;

    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).expect("conforming handler is well formed");

    assert_eq!(cpu.hflags.cpl(), 3, "a conforming handler runs at the caller's cpl");
    assert_eq!(cpu.segs.ss.selector, starting_ss, "no stack switch happens for a conforming handler");
    // Only the ordinary eflags/cs/eip frame (#BP carries no error code) is
    // pushed onto the caller's own stack — no TSS-sourced stack swap.
    assert_eq!(cpu.regs.esp, starting_esp - 3 * 4);
}

#[test]
fn protected_mode_rule1_idt_limit_violation_reports_gp_with_selector_error_code() {
    let mut mem = MockMemory::new(0x20000);
    let mut cpu = protected_mode_cpu(0);
    cpu.segs.idtr.limit = 4; // vector 3: 3*8+7 = 31 > 4
    let exp = ExpData {
        vector: Vector::Bp.as_u16(),
        eip: 0x10,
        code: 0,
        fault_addr: 0,
    };
    let err = protected_mode::deliver(&mut cpu, &mut mem, &exp, false, false).unwrap_err();
    assert_eq!(err, (Vector::Gp.as_u16(), Vector::Bp.as_u16() * 8 + 2));
}

#[test]
fn descriptor_read_raw_honors_the_table_limit() {
    let mut mem = MockMemory::new(0x20000);
    let err = descriptor::read_raw(&mut mem, 0x2000, 0x4, 0, 0, 0x0008, 0x10).unwrap_err();
    assert!(matches!(err, descriptor::DescError::Limit));
}

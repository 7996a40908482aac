//! End-to-end coverage of the dispatch loop driving the translator and
//! linker together, against the mocks in [`crate::mocks`]. Covers
//! direct branch chaining, SMC invalidation, page-crossing blocks, and
//! the `cpu_mode_changed` event path; IBTC population and its
//! page-identity guard are exercised at the cache/linker level in
//! [`crate::cache`], which doesn't need a running dispatcher.

use lib86_backend::CodeBuffer;
use lib86_cache::CodeCache;
use lib86_core::{page_of, CpuCtx, CpuFlags, Fingerprint, TlbAttrs};
use lib86_exec::dispatch::run_mode;
use lib86_exec::DispatchMode;
use lib86_frontend::{translate_block, HookMap};

use crate::mocks::{MockDecoder, MockEmitter, MockMemory, OP_JMP, OP_MODE_CHANGE};

fn new_cpu() -> CpuCtx {
    CpuCtx::new(CpuFlags::empty())
}

/// Write a 5-byte `OP_JMP target` instruction at `addr`.
fn write_jmp(mem: &mut MockMemory, addr: u32, target: u32) {
    mem.write_bytes(addr, &[OP_JMP]);
    mem.write_u32(addr + 1, target);
}

#[test]
fn direct_branch_chaining_links_across_two_dispatcher_iterations() {
    // `jmp 0x1100` at 0x1000, and a second
    // direct jump at 0x1100 so the dispatcher's exit predicate has
    // somewhere else to land once B has run.
    let mut mem = MockMemory::new(0x3000);
    write_jmp(&mut mem, 0x1000, 0x1100);
    write_jmp(&mut mem, 0x1100, 0x2000);

    let mut cpu = new_cpu();
    cpu.eip = 0x1000;

    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    run_mode(
        &mut cpu,
        &mut mem,
        &mut cache,
        &mut decoder,
        &mut emitter,
        &mut buf,
        &hooks,
        DispatchMode::Trampoline { return_eip: 0x2000 },
    )
    .expect("no host-level abort");

    assert_eq!(cpu.eip, 0x2000);

    let fp_a = Fingerprint::new(0, 0x1000, 0);
    let fp_b = Fingerprint::new(0, 0x1100, 0);
    let a = cache.find(fp_a).expect("block A cached");
    let b = cache.find(fp_b).expect("block B cached");

    let block_a = cache.get(a).unwrap();
    let block_b = cache.get(b).unwrap();
    assert_eq!(block_a.jmp_offset[0], Some(block_b.ptr_code));
    // `linked_tc` lives on the *successor*, so it's B that records A as a patcher, not the
    // other way around.
    assert!(block_b.linked_tc.contains(&a));
}

#[test]
fn page_crossing_instruction_runs_once_and_is_never_cached() {
    // A 5-byte instruction straddling the
    // 0x1000 page boundary. Placed at 0xFFE so bytes [0xFFE, 0x1003)
    // cross into the next page.
    let mut mem = MockMemory::new(0x3000);
    write_jmp(&mut mem, 0xFFE, 0x2000);

    let mut cpu = new_cpu();
    cpu.eip = 0xFFE;

    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    run_mode(
        &mut cpu,
        &mut mem,
        &mut cache,
        &mut decoder,
        &mut emitter,
        &mut buf,
        &hooks,
        DispatchMode::Trampoline { return_eip: 0x2000 },
    )
    .expect("no host-level abort");

    assert_eq!(cpu.eip, 0x2000);
    assert!(cache.is_empty(), "page-crossing block must not be inserted by default");
    assert_eq!(emitter.block_count(), 1, "the block still had to be translated and run exactly once");
}

#[test]
fn page_crossing_instruction_is_cached_when_force_insert_is_set() {
    // `CPU_FORCE_INSERT` overrides the default discard of a
    // page-crossing block.
    let mut mem = MockMemory::new(0x3000);
    write_jmp(&mut mem, 0xFFE, 0x2000);

    let mut cpu = new_cpu();
    cpu.eip = 0xFFE;
    cpu.flags.insert(CpuFlags::FORCE_INSERT);

    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    run_mode(
        &mut cpu,
        &mut mem,
        &mut cache,
        &mut decoder,
        &mut emitter,
        &mut buf,
        &hooks,
        DispatchMode::Trampoline { return_eip: 0x2000 },
    )
    .expect("no host-level abort");

    assert_eq!(cache.len(), 1, "CPU_FORCE_INSERT keeps the page-crossing block cached");
    // The flag is a one-shot: it must not still be set afterwards,
    // else every later page-crossing block would wrongly be kept too.
    assert!(!cpu.flags.contains(CpuFlags::FORCE_INSERT));
}

#[test]
fn cpu_mode_changed_event_purges_the_whole_cache() {
    // `cpu_mode_changed` fully purges the cache (the fingerprint
    // space has shifted) and the dispatcher continues rather than
    // aborting.
    let mut mem = MockMemory::new(0x3000);
    // An unrelated block the purge must also drop.
    write_jmp(&mut mem, 0x500, 0x600);
    mem.write_bytes(0x1000, &[OP_MODE_CHANGE]);
    write_jmp(&mut mem, 0x1001, 0x2000);

    let mut cpu = new_cpu();
    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    // Seed the cache with a block unrelated to the mode-change site,
    // the way a long-running guest would have built up history.
    cpu.eip = 0x500;
    let seeded = translate_block(&mut cpu, &mut mem, &mut decoder, &mut emitter, &mut buf, &hooks, false)
        .expect("translation of the seed block cannot fault");
    cache.insert(seeded);
    assert_eq!(cache.len(), 1);

    cpu.eip = 0x1000;
    run_mode(
        &mut cpu,
        &mut mem,
        &mut cache,
        &mut decoder,
        &mut emitter,
        &mut buf,
        &hooks,
        DispatchMode::Trampoline { return_eip: 0x2000 },
    )
    .expect("no host-level abort");

    assert_eq!(cpu.eip, 0x2000);
    // The mode-change block itself and the unrelated seed are both
    // gone: `cpu_mode_changed` purges wholesale, not just the
    // triggering block's fingerprint.
    assert!(cache.is_empty());
}

#[test]
fn smc_self_overwrite_during_dispatch_clears_the_tlb_code_attribute() {
    // Driven through the exec-level wrapper rather than
    // `lib86_cache::tc_invalidate` directly, so the TLB attribute
    // clearing is exercised too.
    let mut mem = MockMemory::new(0x3000);
    write_jmp(&mut mem, 0x2000, 0x2100);

    let mut cpu = new_cpu();
    cpu.eip = 0x2000;
    cpu.tlb.get_mut(page_of(0x2000)).insert_attrs(TlbAttrs::CODE);

    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    let block = translate_block(&mut cpu, &mut mem, &mut decoder, &mut emitter, &mut buf, &hooks, false)
        .expect("translation cannot fault here");
    let fingerprint = block.fingerprint;
    cache.insert(block);
    assert_eq!(cache.len(), 1);

    let halt = lib86_exec::smc::handle_guest_write(
        &mut cpu,
        &mut cache,
        &emitter,
        &buf,
        0x2002,
        1,
        lib86_cache::InvalidateMode::Overlap,
        Some(fingerprint),
    );

    assert!(halt, "the write landed inside the block that is (hypothetically) running");
    assert!(cache.is_empty());
    assert!(!cpu.tlb.get(page_of(0x2000)).attrs().contains(TlbAttrs::CODE));
    assert!(cpu.flags.contains(CpuFlags::DISAS_ONE | CpuFlags::ALLOW_CODE_WRITE));
}

#[test]
fn smc_overlap_on_a_shared_page_keeps_the_code_attribute_if_other_blocks_remain() {
    let mut mem = MockMemory::new(0x3000);
    write_jmp(&mut mem, 0x2000, 0x2100);
    write_jmp(&mut mem, 0x2200, 0x2300);

    let mut cpu = new_cpu();
    let mut cache = CodeCache::new();
    let mut decoder = MockDecoder;
    let mut buf = CodeBuffer::new(1 << 16).unwrap();
    let mut emitter = MockEmitter::new(&mut buf);
    let hooks = HookMap::new();

    cpu.eip = 0x2000;
    let block1 = translate_block(&mut cpu, &mut mem, &mut decoder, &mut emitter, &mut buf, &hooks, false).unwrap();
    cache.insert(block1);
    cpu.eip = 0x2200;
    let block2 = translate_block(&mut cpu, &mut mem, &mut decoder, &mut emitter, &mut buf, &hooks, false).unwrap();
    cache.insert(block2);
    assert_eq!(cache.len(), 2);

    cpu.tlb.get_mut(page_of(0x2000)).insert_attrs(TlbAttrs::CODE);

    let halt = lib86_exec::smc::handle_guest_write(
        &mut cpu,
        &mut cache,
        &emitter,
        &buf,
        0x2002,
        1,
        lib86_cache::InvalidateMode::Overlap,
        None,
    );

    assert!(!halt);
    assert_eq!(cache.len(), 1, "only the overlapping block is removed");
    assert!(
        cpu.tlb.get(page_of(0x2000)).attrs().contains(TlbAttrs::CODE),
        "the page still holds block2's code, so CODE must stay set"
    );
}

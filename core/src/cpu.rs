//! The aggregate CPU context and the runtime configuration knobs
//! governing translation and debug behavior.

use bitflags::bitflags;

use crate::eflags::LazyEflags;
use crate::exception::ExpInfo;
use crate::hflags::HFlags;
use crate::regs::{ControlRegs, DebugRegs, GeneralRegs, SegmentState};
use crate::tlb::Tlb;

bitflags! {
    /// Per-instance configuration flags. A runtime bitflags value
    /// (rather than a cfg'd build) lets a single binary toggle IR
    /// printing, forced insertion, or the disassemble-one-instruction
    /// mode per call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        /// Run the backend's peephole/optimization passes.
        const CODEGEN_OPTIMIZE  = 1 << 0;
        /// Log the emitted IR for each translated block.
        const PRINT_IR          = 1 << 1;
        /// Insert the next translated block into the cache even if
        /// ordinarily it would be translated once and discarded (a
        /// page-crossing block).
        const FORCE_INSERT      = 1 << 2;
        /// Translate exactly one instruction and stop, without a
        /// cache lookup (used by the SMC self-write re-translation
        /// path and by trap-mode single-stepping).
        const DISAS_ONE         = 1 << 3;
        /// Permit the in-flight translation to write to the guest
        /// page it is itself being read from (the SMC self-write
        /// case).
        const ALLOW_CODE_WRITE  = 1 << 4;
        /// A debugger is attached; the dispatch loop runs in trap
        /// mode and honors INT3/DR7 breakpoints.
        const DBG_PRESENT       = 1 << 5;
    }
}

/// The full guest CPU state plus the config knobs above. `lib86-cache`,
/// `lib86-except`, and `lib86-frontend` all operate on a `&mut CpuCtx`.
#[derive(Debug, Clone)]
pub struct CpuCtx {
    pub regs: GeneralRegs,
    pub segs: SegmentState,
    pub ctrl: ControlRegs,
    pub dbg: DebugRegs,
    pub eflags: LazyEflags,
    /// Canonical EFLAGS value; `eflags` above reconstructs the
    /// arithmetic subset lazily from `result`/`auxbits`.
    pub eflags_canonical: u32,
    pub hflags: HFlags,
    pub tlb: Tlb,
    pub exp: ExpInfo,
    pub eip: u32,
    pub flags: CpuFlags,
}

impl CpuCtx {
    pub fn new(flags: CpuFlags) -> Self {
        Self {
            regs: GeneralRegs::default(),
            segs: SegmentState::default(),
            ctrl: ControlRegs::default(),
            dbg: DebugRegs::default(),
            eflags: LazyEflags::default(),
            eflags_canonical: 0,
            hflags: HFlags::empty(),
            tlb: Tlb::new(),
            exp: ExpInfo::new(),
            eip: 0,
            flags,
        }
    }

    /// The address-translation-independent part of the fingerprint:
    /// `HFLG_CONST | EFLAGS_CONST` bits latched at translation time.
    pub fn cpu_flags_const(&self) -> u32 {
        use crate::eflags::EFLAGS_CONST;
        use crate::hflags::HFLG_CONST;
        (self.hflags.bits() & HFLG_CONST) | (self.eflags_canonical & EFLAGS_CONST)
    }
}

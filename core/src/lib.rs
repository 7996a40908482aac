pub mod block;
pub mod cpu;
pub mod eflags;
pub mod event;
pub mod exception;
pub mod guest_memory;
pub mod hflags;
pub mod insn;
pub mod page;
pub mod regs;
pub mod status;
pub mod tlb;

pub use block::{
    BlockFlags, BlockId, Fingerprint, LinkMode, TakenKind, TranslatedBlock, NUM_JMP_OFFSETS,
};
pub use cpu::{CpuCtx, CpuFlags};
pub use eflags::{LazyEflags, EFLAGS_CONST};
pub use event::{BlockExit, HostEvent};
pub use exception::{is_contributory, ExpData, ExpInfo, Vector, INVALID_VECTOR};
pub use guest_memory::GuestMemory;
pub use hflags::{HFlags, CPL_MASK, HFLG_CONST};
pub use insn::{ControlEffect, DecodeCtx, DecodeError, DecodedInsn};
pub use page::{page_of, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, TLB_MAX_SIZE};
pub use regs::{
    ControlRegs, DebugRegs, DescTableReg, GeneralRegs, HiddenDesc, SegReg, SegmentState,
    CR0_PE, CR0_PG, CR0_WP, DR7_GD_MASK,
};
pub use status::{CpuError, CpuResult, Lib86Status};
pub use tlb::{Tlb, TlbAttrs, TlbEntry};

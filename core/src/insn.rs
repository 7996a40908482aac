//! The decoder/emitter trait boundary's shared vocabulary. Both
//! `lib86-frontend`'s `Decoder` implementations and `lib86-backend`'s
//! `Emitter` implementations trade in these types, so they live here
//! rather than in either leaf crate.

use crate::block::{LinkMode, TakenKind};

/// What a decoded instruction does to control flow, the minimum an
/// emitter needs to decide how to terminate the block it is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEffect {
    /// Falls through to the next instruction.
    Sequential,
    /// Unconditional transfer to a fixed guest PC.
    DirectJump(u32),
    /// Conditional transfer: taken goes to the given PC, not-taken
    /// falls through.
    ConditionalJump(u32),
    /// Transfer to a PC computed at runtime (register-indirect).
    IndirectJump,
    /// `ret`-style transfer: indirect, but additionally pops the
    /// return address off the guest stack.
    Return,
    /// Raises an architectural exception before completing.
    Trap,
}

impl ControlEffect {
    /// The link mode a block ending on this effect should be tagged
    /// with.
    pub fn link_mode(self) -> LinkMode {
        match self {
            Self::Sequential | Self::DirectJump(_) => LinkMode::DirectOnly,
            Self::ConditionalJump(_) => LinkMode::ConditionalDirect,
            Self::IndirectJump => LinkMode::Indirect,
            Self::Return => LinkMode::Ret,
            Self::Trap => LinkMode::None,
        }
    }

    pub fn taken_kind(self) -> TakenKind {
        match self {
            Self::ConditionalJump(_) => TakenKind::DstPc,
            Self::Sequential => TakenKind::NextPc,
            Self::Return => TakenKind::Ret,
            _ => TakenKind::DstPc,
        }
    }
}

/// One decoded guest instruction, as much as the translator needs to
/// drive emission and advance `virt_pc`; the operand encoding itself
/// is left to the decoder/emitter pair since neither's internals are
/// in scope here.
#[derive(Debug, Clone)]
pub struct DecodedInsn {
    /// Guest virtual PC this instruction starts at.
    pub virt_pc: u32,
    /// Length in bytes, used to advance `virt_pc` and to detect a
    /// page-crossing instruction.
    pub len: u8,
    pub effect: ControlEffect,
    /// Opaque tag identifying the instruction's opcode class to the
    /// emitter (decoder-defined, meaningless to the translator loop).
    pub opcode_tag: u32,
}

/// Context a decoder needs to disambiguate operand size/addressing
/// (the `CS32`/`SS32` bits).
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeCtx {
    pub code_size_32: bool,
    pub stack_size_32: bool,
    pub cpl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes were available than the encoding needed.
    Truncated,
    /// No valid opcode encoding matched.
    InvalidOpcode,
}

//! The translated-block record and its cache key.

/// The triple a block is uniquely keyed under: `cs_base` plus the
/// guest-physical PC and the `HFLG_CONST | EFLAGS_CONST` bits latched
/// at translation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub cs_base: u32,
    pub pc_phys: u32,
    pub cpu_flags_const: u32,
}

impl Fingerprint {
    pub fn new(cs_base: u32, pc_phys: u32, cpu_flags_const: u32) -> Self {
        Self {
            cs_base,
            pc_phys,
            cpu_flags_const,
        }
    }
}

/// What a block's patchable successor slots mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// No successor is known yet; both slots point at the dispatcher
    /// stub.
    None,
    /// A single unconditional successor in slot 0.
    DirectOnly,
    /// Two successors: slot 0 is the taken target, slot 1 is the
    /// fallthrough.
    ConditionalDirect,
    /// Successor resolved at runtime through the IBTC.
    Indirect,
    /// A `ret`-style transfer: resolved through the IBTC, never
    /// direct-linked.
    Ret,
}

/// What kind of destination the "taken" slot (`jmp_offset[0]`) holds,
/// for two-slot conditional blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakenKind {
    /// Slot holds the branch-taken destination PC.
    DstPc,
    /// Slot holds the fallthrough (branch-not-taken) PC.
    NextPc,
    /// Slot holds a `ret` target, patched only when the block has a
    /// single slot.
    Ret,
}

/// Bitfield companion to a block's link state: link mode, number of
/// patch sites in use, and the taken-slot's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFlags {
    pub link_mode: LinkMode,
    pub num_patch_sites: u8,
    pub taken_kind: TakenKind,
}

impl BlockFlags {
    pub fn unlinked() -> Self {
        Self {
            link_mode: LinkMode::None,
            num_patch_sites: 0,
            taken_kind: TakenKind::DstPc,
        }
    }
}

/// Generational handle to a `TranslatedBlock` stored in a
/// `lib86-cache` arena. A handle whose generation no longer matches
/// the arena slot's current generation refers to an evicted block;
/// resolving it is a no-op rather than a dangling reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub index: u32,
    pub generation: u32,
}

/// Number of patchable successor slots a block carries. Slots 0/1 are
/// the "taken"/"not-taken" link sites; slots 3/4 are the fixed
/// debug-close and interrupt-poll callouts.
pub const NUM_JMP_OFFSETS: usize = 5;

/// A unit of translated guest code.
/// `jmp_offset` holds raw host-code addresses, since the emitted
/// machine code reads them directly; `linked_tc` holds generational
/// handles back to the blocks that patched into this one, so eviction
/// never leaves a dangling reference for the arena to chase.
#[derive(Debug, Clone)]
pub struct TranslatedBlock {
    pub fingerprint: Fingerprint,
    /// Guest virtual PC at which the block starts.
    pub virt_pc: u32,
    /// Host address of the block's entry point.
    pub ptr_code: usize,
    /// Byte offset within the code buffer of each patchable word, as
    /// declared by the emitter when the block was built. Fixed for
    /// the block's lifetime; `None` for a slot the block doesn't use.
    pub patch_site_offset: [Option<usize>; NUM_JMP_OFFSETS],
    /// The host address each slot currently resolves to. `None` means
    /// the slot still points at the dispatcher stub.
    pub jmp_offset: [Option<usize>; NUM_JMP_OFFSETS],
    pub flags: BlockFlags,
    /// Blocks that have patched a successor slot to point at this
    /// block's entry. Used by eviction to revert those patches.
    pub linked_tc: Vec<BlockId>,
    /// Guest page this block's first byte lives on, used by the
    /// page->block SMC index.
    pub page: u32,
    /// True when this block straddles a page boundary; such blocks
    /// are run once and discarded rather than cached, by default.
    pub crosses_page: bool,
    /// Guest byte range covered, `[virt_pc, virt_pc + guest_len)`;
    /// used by the SMC overlap test.
    pub guest_len: u32,
    /// This block is a hook thunk rather than translated guest code;
    /// `tc_invalidate`'s overlap mode skips these, its exact-hook mode
    /// matches only these.
    pub is_hook: bool,
}

impl TranslatedBlock {
    pub fn new(fingerprint: Fingerprint, virt_pc: u32, ptr_code: usize, page: u32) -> Self {
        Self {
            fingerprint,
            virt_pc,
            ptr_code,
            patch_site_offset: [None; NUM_JMP_OFFSETS],
            jmp_offset: [None; NUM_JMP_OFFSETS],
            flags: BlockFlags::unlinked(),
            linked_tc: Vec::new(),
            page,
            crosses_page: false,
            guest_len: 0,
            is_hook: false,
        }
    }
}

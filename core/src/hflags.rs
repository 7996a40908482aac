use bitflags::bitflags;

bitflags! {
    /// Derived/cached CPU-state fields.
    ///
    /// CPL occupies the low two bits so it can be read as a small
    /// integer via [`HFlags::cpl`], the rest are single-bit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HFlags: u32 {
        const CPL0          = 0b0000_0001;
        const CPL1          = 0b0000_0010;
        const PE_MODE       = 0b0000_0100;
        const CS32          = 0b0000_1000;
        const SS32          = 0b0001_0000;
        /// A trampoline call is in progress.
        const TRAMP         = 0b0010_0000;
        /// A single-step debug trap is pending for the next block.
        const DBG_TRAP      = 0b0100_0000;
    }
}

/// Mask covering both bits of the current-privilege-level field.
pub const CPL_MASK: u32 = HFlags::CPL0.bits() | HFlags::CPL1.bits();

/// The fixed subset of `hflags` that is part of a block's fingerprint:
/// CPL, protected-mode, and the two segment-size bits.
/// `TRAMP` and `DBG_TRAP` are transient dispatch-mode signals, not
/// translation-affecting state, so they are excluded.
pub const HFLG_CONST: u32 =
    CPL_MASK | HFlags::PE_MODE.bits() | HFlags::CS32.bits() | HFlags::SS32.bits();

impl HFlags {
    pub fn cpl(self) -> u8 {
        (self.bits() & CPL_MASK) as u8
    }

    pub fn with_cpl(self, cpl: u8) -> Self {
        debug_assert!(cpl <= 3);
        Self::from_bits_truncate((self.bits() & !CPL_MASK) | (cpl as u32 & CPL_MASK))
    }

    pub fn is_protected_mode(self) -> bool {
        self.contains(Self::PE_MODE)
    }
}

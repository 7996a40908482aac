/// Internal control-flow events.
///
/// Rather than unwind out of emitted code and the translator as typed
/// throws, these are an ordinary sum type that emitted code and the
/// dispatch loop *return* — the dispatcher is an explicit state
/// machine, not an unwind target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Guest page fault; `raise_exception` must be invoked.
    PfExp,
    /// Debug-exception trap (instruction/data watchpoint hit).
    DeExp,
    /// A semantic CPU-mode change occurred (e.g. CR0.PE flipped);
    /// the fingerprint space has shifted and the whole cache must be
    /// purged before continuing.
    CpuModeChanged,
    /// The block that was executing destroyed itself via SMC
    /// self-overwrite; the dispatcher must re-enter from the
    /// (possibly updated) guest EIP.
    HaltTc,
}

/// What a translated block's entry function reports back to the
/// dispatcher when it returns control: either the block just executed
/// (so the dispatcher can use it as `prev_tc` for linking) or one of
/// the four `HostEvent`s, both as plain return values rather than an
/// unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Execution fell through to the block's dispatcher-stub slot
    /// (`jmp_offset[2]`) without a host event; the dispatcher should
    /// treat the block just run as `prev_tc` for the next iteration's
    /// linking decision.
    ToDispatcher,
    /// One of the four internal control-flow events occurred while
    /// running the block.
    Event(HostEvent),
}

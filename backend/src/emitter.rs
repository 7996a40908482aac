use lib86_core::{BlockExit, BlockFlags, CpuCtx, DecodedInsn};

use crate::CodeBuffer;

/// What `Emitter::gen_code_block` reports back about the block it
/// just finished emitting, so the translator can populate the
/// block's `flags`/`jmp_offset` without re-deriving them.
#[derive(Debug, Clone)]
pub struct BlockEmitResult {
    pub flags: BlockFlags,
    /// Byte offsets within the code buffer of the patch sites
    /// corresponding to `jmp_offset[0]`/`[1]`, in order.
    pub patch_site_offsets: Vec<usize>,
    /// Total guest bytes consumed by the block.
    pub guest_len: u32,
}

/// The JIT backend / host-code-emitter contract.
pub trait Emitter {
    /// Emit the fixed dispatcher-entry prologue shared by every
    /// block (env pointer setup, callee-saved register spill).
    fn gen_tc_prologue(&mut self, buf: &mut CodeBuffer);

    /// Emit the fixed epilogue that returns control to the
    /// dispatcher.
    fn gen_tc_epilogue(&mut self, buf: &mut CodeBuffer);

    /// Emit host code implementing `insns` in order, honoring
    /// `cpu`'s mode bits for operand/address size. Returns the patch
    /// sites and link metadata the cache needs to wire the block in.
    fn gen_code_block(
        &mut self,
        cpu: &CpuCtx,
        insns: &[DecodedInsn],
        buf: &mut CodeBuffer,
    ) -> BlockEmitResult;

    /// Emit a thunk that transfers control to a host-side hook
    /// instead of translating guest code.
    fn gen_hook_thunk(&mut self, buf: &mut CodeBuffer, hook_id: u32) -> BlockEmitResult;

    /// Emit a call into the exception-delivery routine inline,
    /// for instructions that can be statically known to always fault
    /// (e.g. a privileged instruction at CPL > 0).
    fn raise_exp_inline(
        &mut self,
        buf: &mut CodeBuffer,
        vector: u16,
        fault_addr: u32,
        code: u16,
        eip: u32,
    );

    /// Drop all host code this emitter has produced. Called when the
    /// cache is purged wholesale.
    fn destroy_all_code(&mut self);

    /// Patch a direct jump at `jump_offset` to point at
    /// `target_offset`, or back to the dispatcher stub. Used for
    /// block linking and for reverting patches on
    /// eviction.
    fn patch_jump(&self, buf: &CodeBuffer, jump_offset: usize, target_offset: usize);

    /// Byte offset of the dispatcher stub within the prologue/shared
    /// code region; the value every patch site reverts to when its
    /// target is evicted.
    fn dispatcher_stub_offset(&self) -> usize;

    /// Execute the block whose entry point is `ptr_code`, an offset
    /// within `buf` this same emitter produced. A real backend transmutes
    /// `buf.ptr_at(ptr_code)` into an ABI-matching `extern "C" fn(*mut
    /// CpuCtx)` and calls it, decoding its tagged return value into a
    /// [`BlockExit`]; a mock backend used for testing the dispatch
    /// loop is free to interpret `ptr_code` however is convenient.
    ///
    /// # Safety
    /// `ptr_code` must address code this emitter generated that is
    /// still resident in `buf` (not yet discarded by a purge/reset).
    unsafe fn run_block(&self, buf: &CodeBuffer, ptr_code: usize, cpu: &mut CpuCtx) -> BlockExit;
}

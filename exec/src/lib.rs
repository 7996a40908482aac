//! The dispatch loop, trampoline harness, and
//! debug-breakpoint harness — the outermost layer that composes
//! the code cache, exception engine, and translator loop into a
//! runnable CPU.

pub mod debug;
pub mod dispatch;
pub mod smc;
pub mod trampoline;

pub use debug::{Breakpoint, DebugGate, DebugState, Watchpoint};
pub use dispatch::{run, DispatchMode};
pub use smc::handle_guest_write;
pub use trampoline::call_trampoline;

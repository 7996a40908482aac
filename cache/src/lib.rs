//! The translated-block cache, page->block SMC index,
//! indirect-branch target cache, and linker.

pub mod arena;
pub mod code_cache;
pub mod ibtc;
pub mod linker;
pub mod page_index;
pub mod smc;

pub use arena::BlockArena;
pub use code_cache::{CodeCache, CAPACITY};
pub use ibtc::Ibtc;
pub use linker::link;
pub use page_index::PageIndex;
pub use smc::{tc_invalidate, InvalidateMode, InvalidateOutcome};

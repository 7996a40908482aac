use std::collections::HashMap;

use lib86_core::BlockId;

/// One indirect-branch-target-cache entry: the block plus the triple
/// it must still match for the entry to be trusted.
#[derive(Clone, Copy)]
struct IbtcEntry {
    block: BlockId,
    cs_base: u32,
    cpu_flags: u32,
    entry_page: u32,
}

/// Guest-virtual-PC -> block index populated at the conclusion of
/// indirect/`ret`-like transfers. A hit is only trusted after
/// revalidating `cs_base`/`cpu_flags`/page-identity, since the cache
/// can hold a stale entry from a page that was since evicted.
#[derive(Default)]
pub struct Ibtc {
    entries: HashMap<u32, IbtcEntry>,
}

impl Ibtc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, virt_pc: u32, cs_base: u32, cpu_flags: u32, entry_page: u32, block: BlockId) {
        self.entries.insert(
            virt_pc,
            IbtcEntry {
                block,
                cs_base,
                cpu_flags,
                entry_page,
            },
        );
    }

    /// Look up `virt_pc`, accepting the entry only if `cs_base`,
    /// `cpu_flags`, and the caller's current page match the entry's
    /// recorded state.
    pub fn lookup(&self, virt_pc: u32, cs_base: u32, cpu_flags: u32, caller_page: u32) -> Option<BlockId> {
        let entry = self.entries.get(&virt_pc)?;
        if entry.cs_base == cs_base && entry.cpu_flags == cpu_flags && entry.entry_page == caller_page {
            Some(entry.block)
        } else {
            None
        }
    }

    /// Drop every entry pointing at `id`, called when that block is
    /// evicted so a reused arena slot can't be hit through a stale
    /// key.
    pub fn remove_target(&mut self, id: BlockId) {
        self.entries.retain(|_, e| e.block != id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

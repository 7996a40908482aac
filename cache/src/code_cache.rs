use log::{debug, trace};

use lib86_core::{BlockId, Fingerprint, TranslatedBlock};

use crate::arena::BlockArena;
use crate::ibtc::Ibtc;
use crate::page_index::PageIndex;

/// Bucket count and block-count ceiling. Both values
/// are deliberately the same constant: the bucket index is `pc &
/// (CAPACITY - 1)`, and the cache purges wholesale once it holds this
/// many blocks.
pub const CAPACITY: usize = 1 << 15;

fn bucket_of(pc_phys: u32) -> usize {
    (pc_phys as usize) & (CAPACITY - 1)
}

/// The fixed-capacity translated-block cache, plus the
/// two indices that ride along with it: the page->block SMC index and
/// the indirect-branch target cache. All three are purged together
/// since they all hold references into the same arena of blocks.
pub struct CodeCache {
    buckets: Vec<Vec<BlockId>>,
    arena: BlockArena,
    pub(crate) page_index: PageIndex,
    pub(crate) ibtc: Ibtc,
    num_tc: usize,
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); CAPACITY],
            arena: BlockArena::new(),
            page_index: PageIndex::new(),
            ibtc: Ibtc::new(),
            num_tc: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.num_tc
    }

    pub fn is_empty(&self) -> bool {
        self.num_tc == 0
    }

    pub fn is_full(&self) -> bool {
        self.num_tc >= CAPACITY
    }

    /// `find(cs_base, pc, cpu_flags)`: the block in `bucket(pc)` whose
    /// triple matches, or none.
    pub fn find(&self, fingerprint: Fingerprint) -> Option<BlockId> {
        let bucket = &self.buckets[bucket_of(fingerprint.pc_phys)];
        bucket
            .iter()
            .find(|&&id| {
                self.arena
                    .get(id)
                    .map(|b| b.fingerprint == fingerprint)
                    .unwrap_or(false)
            })
            .copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&TranslatedBlock> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut TranslatedBlock> {
        self.arena.get_mut(id)
    }

    /// Indirect-branch fast path: look up `virt_pc` in
    /// the IBTC, trusting the hit only if `cs_base`/`cpu_flags`/the
    /// caller's current page all match the entry's recorded state.
    pub fn ibtc_lookup(&self, virt_pc: u32, cs_base: u32, cpu_flags: u32, caller_page: u32) -> Option<BlockId> {
        self.ibtc.lookup(virt_pc, cs_base, cpu_flags, caller_page)
    }

    /// Insert a freshly translated block: fingerprint->entry, page->
    /// block set, capacity counter, all atomically from the caller's
    /// point of view.
    pub fn insert(&mut self, block: TranslatedBlock) -> BlockId {
        debug_assert!(!self.is_full(), "insert called on a full cache");
        let bucket = bucket_of(block.fingerprint.pc_phys);
        let page = block.page;
        let id = self.arena.insert(block);
        self.buckets[bucket].push(id);
        self.page_index.insert(page, id);
        self.num_tc += 1;
        trace!(target: "lib86_cache", "inserted block {:?} (num_tc={})", id, self.num_tc);
        id
    }

    /// Remove a single block: unlink incoming patches, erase it from
    /// its bucket, the page index, and the IBTC. Returns the removed block so the caller (the SMC path) can
    /// still inspect it, e.g. to detect self-overwrite.
    pub fn remove<F>(&mut self, id: BlockId, mut revert_patch: F) -> Option<TranslatedBlock>
    where
        F: FnMut(usize),
    {
        let block = self.arena.remove(id)?;
        for patcher_id in &block.linked_tc {
            if let Some(patcher) = self.arena.get_mut(*patcher_id) {
                for slot_idx in 0..2 {
                    if patcher.jmp_offset[slot_idx] == Some(block.ptr_code) {
                        patcher.jmp_offset[slot_idx] = None;
                        if let Some(site) = patcher.patch_site_offset[slot_idx] {
                            revert_patch(site);
                        }
                    }
                }
            }
        }
        let bucket = &mut self.buckets[bucket_of(block.fingerprint.pc_phys)];
        bucket.retain(|&b| b != id);
        self.page_index.remove(block.page, id);
        self.ibtc.remove_target(id);
        self.num_tc -= 1;
        debug!(target: "lib86_cache", "removed block {:?} (num_tc={})", id, self.num_tc);
        Some(block)
    }

    /// Drop all bookkeeping but leave the emitted host code region
    /// alone — used when the caller is itself running inside emitted
    /// code.
    pub fn clear(&mut self) {
        self.arena.clear();
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.page_index.clear();
        self.ibtc.clear();
        self.num_tc = 0;
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

use lib86_core::{BlockId, TranslatedBlock};

/// Generational arena of translated blocks. `TranslatedBlock::linked_tc` and the cache's own
/// bucket/page/IBTC indices all refer to blocks through a [`BlockId`]
/// rather than a raw index, so an evicted slot's stale referents
/// resolve to `None` instead of aliasing whatever block is reinserted
/// there.
#[derive(Default)]
pub struct BlockArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

enum Slot {
    Occupied { block: TranslatedBlock, generation: u32 },
    Vacant { generation: u32 },
}

impl BlockArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, block: TranslatedBlock) -> BlockId {
        if let Some(index) = self.free.pop() {
            let generation = match &self.slots[index as usize] {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.slots[index as usize] = Slot::Occupied { block, generation };
            BlockId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied {
                block,
                generation: 0,
            });
            BlockId { index, generation: 0 }
        }
    }

    pub fn get(&self, id: BlockId) -> Option<&TranslatedBlock> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { block, generation } if *generation == id.generation => Some(block),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut TranslatedBlock> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { block, generation } if *generation == id.generation => Some(block),
            _ => None,
        }
    }

    /// Remove the block at `id`, bumping its slot's generation so any
    /// surviving `BlockId` copies become stale. Returns the block so
    /// the caller can still walk its `linked_tc`/fingerprint while
    /// unwinding patches.
    pub fn remove(&mut self, id: BlockId) -> Option<TranslatedBlock> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation == id.generation => {
                let generation = generation.wrapping_add(1);
                let old = std::mem::replace(&mut self.slots[id.index as usize], Slot::Vacant { generation });
                self.free.push(id.index);
                match old {
                    Slot::Occupied { block, .. } => Some(block),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    /// Drop every block without freeing the arena's own storage
    /// (reused by `CodeCache::clear`).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

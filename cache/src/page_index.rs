use std::collections::HashMap;

use lib86_core::BlockId;

/// Guest-physical-page -> block-set index driving `tc_invalidate`
///. A page with an empty set is removed entirely so
/// its TLB entry's `CODE` attribute can be cleared.
#[derive(Default)]
pub struct PageIndex {
    pages: HashMap<u32, Vec<BlockId>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page: u32, id: BlockId) {
        self.pages.entry(page).or_default().push(id);
    }

    pub fn remove(&mut self, page: u32, id: BlockId) {
        if let Some(set) = self.pages.get_mut(&page) {
            set.retain(|&b| b != id);
            if set.is_empty() {
                self.pages.remove(&page);
            }
        }
    }

    /// Blocks registered on `page`, or an empty slice if the page has
    /// none.
    pub fn blocks_on(&self, page: u32) -> &[BlockId] {
        self.pages.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `page` has no registered blocks left, i.e. its `CODE`
    /// TLB attribute should be cleared.
    pub fn is_empty_page(&self, page: u32) -> bool {
        !self.pages.contains_key(&page)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

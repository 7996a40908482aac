use std::collections::HashMap;

/// Guest-PC-keyed registry of host hooks.
/// A hook takes priority over translating the guest bytes at its
/// address, except while a trampoline call is in flight
/// (`HFlags::TRAMP`), so that calling into a hooked function from the
/// host still runs the guest's own implementation.
#[derive(Debug, Default)]
pub struct HookMap {
    hooks: HashMap<u32, u32>,
}

impl HookMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, virt_pc: u32, hook_id: u32) {
        self.hooks.insert(virt_pc, hook_id);
    }

    pub fn remove(&mut self, virt_pc: u32) -> Option<u32> {
        self.hooks.remove(&virt_pc)
    }

    pub fn lookup(&self, virt_pc: u32) -> Option<u32> {
        self.hooks.get(&virt_pc).copied()
    }
}

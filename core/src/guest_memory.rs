use crate::event::HostEvent;

/// The guest memory subsystem's contract: address
/// translation (TLB fill on miss) and the raw read/write primitives
/// used by the translator, the exception engine (descriptor table
/// walks), and the per-opcode emitter for guest loads/stores.
/// Explicitly out of scope as an implementation — only the boundary
/// is owned here, shared by `lib86-frontend` and `lib86-except`.
pub trait GuestMemory {
    /// Translate `virt` to a guest-physical code address, walking the
    /// page tables on a TLB miss. `eip` is carried through only to
    /// label the fault if one is raised.
    fn get_code_addr(&mut self, virt: u32, eip: u32) -> Result<u32, HostEvent>;

    /// Translate `virt` for a `size`-byte write, returning the
    /// physical address and whether the target page currently holds
    /// cached code (driving SMC detection).
    fn get_write_addr(&mut self, virt: u32, size: u8, eip: u32) -> Result<(u32, bool), HostEvent>;

    /// Translate `virt` for a `size`-byte data read (descriptor table
    /// walks, stack pushes during exception delivery). Distinct from
    /// `get_code_addr` since a data read never needs the SMC/CODE
    /// bookkeeping a fetch does.
    fn get_read_addr(&mut self, virt: u32, size: u8, eip: u32) -> Result<u32, HostEvent>;

    fn mem_read(&mut self, phys: u32, size: u8) -> u32;

    fn mem_write(&mut self, phys: u32, size: u8, val: u32);
}

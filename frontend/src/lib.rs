//! Fetch/decode/dispatch translator loop and the `Decoder` /
//! `GuestMemory` collaborator contracts (the `Emitter` contract itself
//! lives in `lib86-backend`, since it is paired with `CodeBuffer`).

pub mod decoder;
pub mod guest_memory;
pub mod hooks;
pub mod translate;

pub use decoder::Decoder;
pub use guest_memory::GuestMemory;
pub use hooks::HookMap;
pub use translate::translate_block;

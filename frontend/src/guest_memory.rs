pub use lib86_core::GuestMemory;

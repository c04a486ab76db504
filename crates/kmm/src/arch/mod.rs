//! Target constants for memory management.
//!
//! The hardware target is i386: 32-bit addresses, 4 KiB pages, physical
//! memory below 4 GiB. Host builds (tests and the `software-emulation`
//! feature) use the same constants against an emulated physical memory, so
//! the allocator arithmetic exercised on the host is the arithmetic that
//! runs on the target.

/// Size of a physical frame and a virtual page in bytes.
pub const PAGE_SIZE: usize = 4096;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::EmulatedMemory;

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kernel Memory Manager (kmm)
//!
//! Memory management core for a freestanding i386 kernel. It provides, in
//! dependency order:
//!
//! - A physical frame allocator ([`FrameAllocator`]) tracking every frame of
//!   RAM in a bitmap built from the bootloader's memory map.
//! - A buddy allocator ([`BuddyAllocator`]) managing the kernel heap region
//!   as power-of-two blocks of pages.
//! - Slab caches ([`SlabCache`]) for small fixed-size objects, carved from
//!   buddy pages.
//! - A general-purpose allocation façade ([`KernelHeap`]/[`LockedHeap`])
//!   routing requests between the slab caches and the buddy allocator, with
//!   a [`core::alloc::GlobalAlloc`] implementation.
//!
//! The crate is `no_std` on the kernel target. Under `cfg(test)` or the
//! `software-emulation` feature it builds as a normal hosted crate, with
//! physical memory backed by an in-process buffer, so the whole allocator
//! stack runs under `cargo test` on any host.

#[cfg(any(test, feature = "software-emulation"))]
extern crate alloc;

mod address;
mod arch;
mod bitmap;
mod buddy;
mod byte_size;
mod frame_allocator;
mod heap;
mod numbers;
mod slab;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use bitmap::FrameBitmap;
pub use buddy::{AllocError, BuddyAllocator, MAX_ORDER, PageInfo};
pub use byte_size::ByteSize;
pub use frame_allocator::{BootRegion, FrameAllocator, LockedFrameAllocator};
pub use heap::{HeapStats, KernelHeap, LockedHeap, SIZE_CLASSES};
pub use numbers::{FrameNumber, PageNumber};
pub use slab::SlabCache;

pub use arch::PAGE_SIZE;

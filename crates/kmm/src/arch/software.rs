//! Software-emulated physical memory for host-side testing.
//!
//! Provides a buffer standing in for the machine's RAM. Physical addresses
//! are offsets into the buffer, so code that writes through translated
//! physical addresses (the frame bitmap, intrusive free lists) runs
//! unmodified on the host.

use core::sync::atomic::{AtomicUsize, Ordering};

/// An in-process buffer emulating physical memory.
pub struct EmulatedMemory {
    memory: alloc::vec::Vec<u8>,
    /// Bump pointer for [`EmulatedMemory::allocate`].
    next_alloc: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates an emulated physical memory of `size` bytes, zero-filled.
    pub fn new(size: usize) -> Self {
        Self {
            memory: alloc::vec![0u8; size],
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Returns the size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    /// Reserves a block of emulated physical memory, returning its physical
    /// address, or `None` if the buffer is exhausted.
    ///
    /// This is a bump allocator for test fixtures that need scratch regions
    /// outside the allocators under test; nothing is ever released.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;

            if end > self.memory.len() {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates an emulated physical address to a host pointer.
    ///
    /// # Panics
    ///
    /// Panics if `phys` is outside the emulated memory.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(
            phys < self.memory.len(),
            "physical address {phys:#x} outside emulated memory"
        );
        unsafe { self.memory.as_ptr().add(phys) as *mut u8 }
    }

    /// Translates a host pointer back to an emulated physical address.
    ///
    /// # Panics
    ///
    /// Panics if the pointer does not point into the emulated memory.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.memory.as_ptr()) };
        assert!(offset >= 0, "pointer below emulated memory");
        assert!(
            (offset as usize) < self.memory.len(),
            "pointer above emulated memory"
        );
        offset as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_alignment() {
        let mem = EmulatedMemory::new(1024);

        mem.allocate(3, 1).unwrap();
        let addr = mem.allocate(16, 64).unwrap();
        assert_eq!(addr % 64, 0);
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let mem = EmulatedMemory::new(64);

        assert!(mem.allocate(64, 1).is_some());
        assert!(mem.allocate(1, 1).is_none());
    }

    #[test]
    fn translation_round_trips() {
        let mem = EmulatedMemory::new(256);

        let ptr = mem.translate(128);
        assert_eq!(mem.ptr_to_phys(ptr), 128);
    }
}

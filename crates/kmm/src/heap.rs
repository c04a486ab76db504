//! General-purpose kernel allocation: the `kmalloc`/`kfree` façade.
//!
//! [`KernelHeap`] routes small requests to per-size slab caches and
//! everything larger straight to the buddy allocator at the covering page
//! order. Ownership of a freed pointer is recovered from the buddy
//! allocator's page metadata: slab pages carry their size class, buddy
//! block heads carry their order, so `free` never guesses and a bad
//! pointer is a logged no-op instead of list corruption.
//!
//! [`LockedHeap`] wraps the heap in a `spin::Mutex` and implements
//! [`GlobalAlloc`], making it usable as the kernel's `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::buddy::{AllocError, BuddyAllocator, MAX_ORDER, PageInfo};
use crate::slab::SlabCache;
use crate::{VirtualAddress, arch};

/// Object sizes served by the slab caches; anything larger goes to the
/// buddy allocator.
pub const SIZE_CLASSES: [usize; 4] = [8, 16, 32, 64];

/// Counters for the heap's two allocation paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Objects currently allocated per size class.
    pub slab_in_use: [usize; SIZE_CLASSES.len()],
    /// Pages currently owned by slab caches.
    pub slab_pages: usize,
    /// Pages on the buddy allocator's free lists.
    pub free_pages: usize,
    /// Pages under buddy management in total.
    pub total_pages: usize,
}

/// The kernel's general-purpose allocator.
pub struct KernelHeap {
    buddy: BuddyAllocator,
    caches: [SlabCache; SIZE_CLASSES.len()],
}

impl KernelHeap {
    /// Creates the heap over the given region: the buddy allocator plus
    /// one slab cache per size class (slabs are created on first use).
    ///
    /// The region must be directly writable and exclusively owned by the
    /// heap; see [`BuddyAllocator::new`].
    pub fn new(base: VirtualAddress, page_count: usize) -> Self {
        Self {
            buddy: BuddyAllocator::new(base, page_count),
            caches: [
                SlabCache::new("kmalloc-8", 8, 0),
                SlabCache::new("kmalloc-16", 16, 1),
                SlabCache::new("kmalloc-32", 32, 2),
                SlabCache::new("kmalloc-64", 64, 3),
            ],
        }
    }

    /// Allocates `size` bytes.
    ///
    /// Sizes up to the largest class come from the smallest fitting slab
    /// cache; larger sizes come from the buddy allocator at the smallest
    /// order covering them. A zero-size request is served from the
    /// smallest class so the caller still gets a unique, freeable address.
    pub fn allocate(&mut self, size: usize) -> Result<VirtualAddress, AllocError> {
        if let Some(class) = Self::class_for(size) {
            return self.caches[class].allocate(&mut self.buddy);
        }
        self.buddy.allocate(Self::order_for(size)?)
    }

    /// Frees the allocation at `addr`, whichever subsystem owns it.
    ///
    /// The owner is determined from the page metadata in O(1). An address
    /// that no live allocation owns is reported and ignored.
    pub fn free(&mut self, addr: VirtualAddress) -> Result<(), AllocError> {
        match self.buddy.page_info(addr) {
            Some(PageInfo::Slab { class }) => {
                if self
                    .caches
                    .get_mut(class as usize)
                    .is_some_and(|cache| cache.free(addr))
                {
                    Ok(())
                } else {
                    log::warn!("free of {addr} rejected by its slab cache");
                    Err(AllocError::InvalidFree)
                }
            }
            Some(PageInfo::Allocated { .. }) => self.buddy.free(addr),
            _ => {
                log::warn!("free of {addr} which is not a live heap allocation");
                Err(AllocError::InvalidFree)
            }
        }
    }

    /// Returns the current allocation counters.
    pub fn stats(&self) -> HeapStats {
        let mut slab_in_use = [0; SIZE_CLASSES.len()];
        let mut slab_pages = 0;
        for (class, cache) in self.caches.iter().enumerate() {
            slab_in_use[class] = cache.in_use();
            slab_pages += cache.slab_count();
        }

        HeapStats {
            slab_in_use,
            slab_pages,
            free_pages: self.buddy.free_pages(),
            total_pages: self.buddy.total_pages(),
        }
    }

    /// Returns the index of the smallest class holding `size`, or `None`
    /// when the request must go to the buddy allocator.
    fn class_for(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&class| size <= class)
    }

    /// Returns the smallest order whose block covers `size` bytes.
    fn order_for(size: usize) -> Result<usize, AllocError> {
        let pages = size.div_ceil(arch::PAGE_SIZE);
        if pages > 1 << MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }
        Ok(pages.next_power_of_two().trailing_zeros() as usize)
    }
}

/// A [`KernelHeap`] behind a `spin::Mutex`, usable as the kernel's
/// `#[global_allocator]`.
///
/// Every allocator mutation happens inside the lock, which is the
/// reentrancy protection this crate provides; kernel interrupt paths must
/// not allocate while the lock is held on the same CPU.
pub struct LockedHeap(spin::Mutex<Option<KernelHeap>>);

impl LockedHeap {
    /// Creates an empty heap; allocation returns null until [`Self::init`]
    /// runs.
    pub const fn empty() -> Self {
        Self(spin::Mutex::new(None))
    }

    /// Initializes the heap over the kernel heap region. Called once,
    /// after the region's bounds are known.
    pub fn init(&self, base: VirtualAddress, page_count: usize) {
        *self.0.lock() = Some(KernelHeap::new(base, page_count));
    }

    /// See [`KernelHeap::allocate`].
    pub fn allocate(&self, size: usize) -> Result<VirtualAddress, AllocError> {
        self.0
            .lock()
            .as_mut()
            .ok_or(AllocError::OutOfMemory)?
            .allocate(size)
    }

    /// See [`KernelHeap::free`].
    pub fn free(&self, addr: VirtualAddress) -> Result<(), AllocError> {
        self.0
            .lock()
            .as_mut()
            .ok_or(AllocError::InvalidFree)?
            .free(addr)
    }

    /// Returns the heap counters, or `None` before init.
    pub fn stats(&self) -> Option<HeapStats> {
        self.0.lock().as_ref().map(KernelHeap::stats)
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > arch::PAGE_SIZE {
            log::error!("unsupported alignment {} requested", layout.align());
            return ptr::null_mut();
        }

        let mut guard = self.0.lock();
        let Some(heap) = guard.as_mut() else {
            log::error!("allocation before heap init");
            return ptr::null_mut();
        };

        // Slab classes and buddy blocks are both power-of-two sized and
        // aligned, so covering the alignment with the size is sufficient.
        heap.allocate(layout.size().max(layout.align()))
            .map(|addr| addr.as_mut_ptr())
            .inspect_err(|err| {
                log::error!("heap allocation of {} bytes failed: {err:?}", layout.size())
            })
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if let Some(heap) = self.0.lock().as_mut() {
            // Invalid frees are logged by the heap; dealloc cannot report.
            let _ = heap.free(VirtualAddress::from_ptr(ptr));
        }
    }
}

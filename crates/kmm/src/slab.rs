//! Slab caches for small fixed-size kernel objects.
//!
//! A cache serves one object size. Its backing memory comes from the buddy
//! allocator one page at a time: each page ("slab") starts with a small
//! header and is carved into as many object slots as fit behind it,
//! threaded onto an intrusive free list. An object therefore never
//! crosses a page boundary, and every pointer a cache hands out lies
//! inside exactly one of its slabs.
//!
//! Slabs are created lazily and never returned to the buddy allocator,
//! even when empty: an address handed out by a cache stays valid until
//! it is explicitly freed, with no page eviction behind the caller's back.

use core::mem;
use core::ptr;

use crate::buddy::{AllocError, BuddyAllocator};
use crate::{VirtualAddress, arch};

/// Node of a slab's intrusive free-slot list, written into the slot
/// itself while it is free.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Header at the start of every slab page, followed by the object slots.
#[repr(C)]
struct SlabHeader {
    /// Next slab in the owning cache's list.
    next: *mut SlabHeader,
    /// Head of this slab's free-slot list; every slot on it lies inside
    /// this slab's page.
    free: *mut FreeSlot,
    in_use: u16,
    capacity: u16,
}

/// A cache of fixed-size objects batched onto buddy pages.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    /// Size-class index stamped into the page metadata of every slab page,
    /// so the heap façade can route frees back here.
    class: u8,
    slabs: *mut SlabHeader,
    slab_count: usize,
    in_use: usize,
}

// SAFETY: A cache exclusively owns its slab pages; callers serialize
// access (see LockedHeap).
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// Creates an empty cache for objects of `object_size` bytes.
    ///
    /// The size is normalized up to pointer width so a free slot can hold
    /// its list link. No slab is allocated until the first allocation.
    pub fn new(name: &'static str, object_size: usize, class: u8) -> Self {
        Self {
            name,
            object_size: object_size.max(mem::size_of::<*mut FreeSlot>()),
            class,
            slabs: ptr::null_mut(),
            slab_count: 0,
            in_use: 0,
        }
    }

    /// Allocates one object, growing the cache by a slab if no slot is
    /// free anywhere.
    pub fn allocate(&mut self, buddy: &mut BuddyAllocator) -> Result<VirtualAddress, AllocError> {
        let mut slab = self.slabs;
        while !slab.is_null() {
            // SAFETY: slab came from this cache's list; headers stay valid
            // for the cache's lifetime (slabs are never reclaimed).
            unsafe {
                if !(*slab).free.is_null() {
                    return Ok(self.take_slot(slab));
                }
                slab = (*slab).next;
            }
        }

        let slab = self.grow(buddy)?;
        Ok(self.take_slot(slab))
    }

    /// Returns an object to the cache.
    ///
    /// Scans the slab list for the page containing `addr`; a pointer that
    /// does not belong to any slab of this cache (or does not sit on a
    /// slot boundary) is rejected by returning `false`, with no other
    /// effect.
    pub fn free(&mut self, addr: VirtualAddress) -> bool {
        let mut slab = self.slabs;
        while !slab.is_null() {
            let page_start = slab as usize;
            if addr.as_usize() >= page_start && addr.as_usize() < page_start + arch::PAGE_SIZE {
                return self.release_slot(slab, addr);
            }
            // SAFETY: as in allocate().
            slab = unsafe { (*slab).next };
        }
        false
    }

    /// Returns the normalized object size.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Returns the number of slabs backing this cache.
    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    /// Returns the number of objects currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns the number of object slots per slab.
    pub fn slab_capacity(&self) -> usize {
        Self::slots_per_slab(self.object_size)
    }

    /// Offset of the first slot: the header rounded up to the object
    /// size, which keeps every slot aligned to it (the page itself is
    /// page-aligned and the sizes are powers of two).
    fn slot_base(object_size: usize) -> usize {
        mem::size_of::<SlabHeader>().next_multiple_of(object_size)
    }

    fn slots_per_slab(object_size: usize) -> usize {
        (arch::PAGE_SIZE - Self::slot_base(object_size)) / object_size
    }

    /// Allocates and carves a fresh slab, prepending it to the list.
    fn grow(&mut self, buddy: &mut BuddyAllocator) -> Result<*mut SlabHeader, AllocError> {
        let page = buddy.allocate_slab_page(self.class)?;
        let header = page.as_mut_ptr::<SlabHeader>();
        let capacity = Self::slots_per_slab(self.object_size);

        // SAFETY: the page is a fresh order-0 buddy block, exclusively
        // ours; header and slots all lie within it.
        unsafe {
            header.write(SlabHeader {
                next: self.slabs,
                free: ptr::null_mut(),
                in_use: 0,
                capacity: capacity as u16,
            });

            // Thread the slots back to front so allocation walks the page
            // from its start.
            let slots = page.as_usize() + Self::slot_base(self.object_size);
            for slot_index in (0..capacity).rev() {
                let slot = (slots + slot_index * self.object_size) as *mut FreeSlot;
                (*slot).next = (*header).free;
                (*header).free = slot;
            }
        }

        self.slabs = header;
        self.slab_count += 1;
        log::debug!(
            "slab cache {}: grew to {} slabs ({} byte objects, {} slots per slab)",
            self.name,
            self.slab_count,
            self.object_size,
            capacity
        );
        Ok(header)
    }

    /// Pops the head of `slab`'s free-slot list. The slab must have a
    /// free slot.
    fn take_slot(&mut self, slab: *mut SlabHeader) -> VirtualAddress {
        // SAFETY: the caller checked (or just built) a non-empty free
        // list, and every slot on it lies inside the slab's page.
        unsafe {
            let slot = (*slab).free;
            (*slab).free = (*slot).next;
            (*slab).in_use += 1;
            self.in_use += 1;
            VirtualAddress::from_ptr(slot)
        }
    }

    /// Pushes the slot at `addr` back onto `slab`'s free list, rejecting
    /// addresses that do not hit a slot boundary.
    fn release_slot(&mut self, slab: *mut SlabHeader, addr: VirtualAddress) -> bool {
        let slots = slab as usize + Self::slot_base(self.object_size);
        if addr.as_usize() < slots {
            log::warn!("slab cache {}: free of {addr} inside a slab header", self.name);
            return false;
        }

        let offset = addr.as_usize() - slots;
        // SAFETY: slab is a live header of this cache; the checks below
        // confirm addr is one of its slots before it is written to.
        unsafe {
            if offset % self.object_size != 0 || offset / self.object_size >= (*slab).capacity as usize
            {
                log::warn!(
                    "slab cache {}: free of {addr} which is not a slot boundary",
                    self.name
                );
                return false;
            }

            #[cfg(debug_assertions)]
            {
                // Walk the free list to catch double frees during testing;
                // release builds keep the no-crash contract.
                let mut cursor = (*slab).free;
                while !cursor.is_null() {
                    debug_assert!(
                        cursor as usize != addr.as_usize(),
                        "double free of slab object {addr}"
                    );
                    cursor = (*cursor).next;
                }
            }

            let slot = addr.as_mut_ptr::<FreeSlot>();
            (*slot).next = (*slab).free;
            (*slab).free = slot;
            (*slab).in_use = (*slab).in_use.saturating_sub(1);
        }
        self.in_use = self.in_use.saturating_sub(1);
        true
    }
}

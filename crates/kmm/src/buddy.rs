//! Buddy allocator for the kernel heap region.
//!
//! Manages a contiguous, directly-writable address range as power-of-two
//! blocks of pages, with one intrusive free list per order. Order `n`
//! holds blocks of `2^n` pages; allocation splits the smallest sufficient
//! block, deallocation merges a block with its buddy for as long as the
//! buddy is free, bounded by [`MAX_ORDER`].
//!
//! Free-list nodes are written into the free blocks themselves, so free
//! memory costs no metadata beyond the per-page state array. That array
//! is carved from the tail of the managed region at init time and
//! records, for every page, whether it is the head of a free or
//! allocated block (and at which order) or a slab page (and for which size
//! class). Frees recover the block order from it, which makes a mismatched
//! or double free a detectable no-op instead of silent list corruption.
//!
//! Buddy arithmetic works on page indices relative to the region base
//! (`index ^ block_pages`), so the region itself needs no particular
//! alignment.

use core::array;
use core::ptr;

use crate::{ByteSize, VirtualAddress, arch};

/// Maximum block order; blocks span up to `2^MAX_ORDER` pages (4 MiB).
pub const MAX_ORDER: usize = 10;

/// Number of free lists (orders 0 through MAX_ORDER inclusive).
const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Errors reported by the allocators in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No block of a suitable order is available.
    OutOfMemory,
    /// The requested order exceeds [`MAX_ORDER`].
    OrderTooLarge,
    /// The freed address does not belong to a live allocation.
    InvalidFree,
}

/// What a page is currently doing, from its metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInfo {
    /// Head of a free block of the given order.
    Free { order: u8 },
    /// Head of a block handed out by [`BuddyAllocator::allocate`].
    Allocated { order: u8 },
    /// Order-0 page owned by a slab cache of the given size class.
    Slab { class: u8 },
    /// Non-head page inside a larger block.
    Interior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PageKind {
    Free = 0,
    Allocated = 1,
    Slab = 2,
    Interior = 3,
}

/// Per-page state, one entry per managed page.
#[derive(Clone, Copy)]
struct PageMeta {
    kind: PageKind,
    /// Block order for `Free`/`Allocated` heads, size-class index for
    /// `Slab` pages, meaningless otherwise.
    extra: u8,
}

/// Node of an intrusive free list, written into the first bytes of a free
/// block. Only valid while the block is on a free list.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Pattern written into the second word of every free block; still being
/// intact when the block leaves the free list means nobody wrote through a
/// stale pointer. Debug builds only.
#[cfg(debug_assertions)]
const FREE_CANARY: usize = 0xF4EE_B10C;

/// Singly-linked free list of blocks at one order.
struct FreeList {
    head: *mut FreeBlock,
    count: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    fn push(&mut self, block: *mut FreeBlock) {
        unsafe {
            (*block).next = self.head;
            #[cfg(debug_assertions)]
            block.cast::<usize>().add(1).write(FREE_CANARY);
        }
        self.head = block;
        self.count += 1;
    }

    fn pop(&mut self) -> Option<*mut FreeBlock> {
        if self.head.is_null() {
            return None;
        }
        let block = self.head;
        unsafe {
            #[cfg(debug_assertions)]
            debug_assert_eq!(
                block.cast::<usize>().add(1).read(),
                FREE_CANARY,
                "free block written to while on the free list"
            );
            self.head = (*block).next;
        }
        self.count -= 1;
        Some(block)
    }

    /// Unlinks a specific block. O(n) walk; only needed while coalescing.
    /// Returns false if the block is not on this list.
    fn remove(&mut self, target: *mut FreeBlock) -> bool {
        if self.head == target {
            self.head = unsafe { (*target).next };
            self.count -= 1;
            return true;
        }

        let mut prev = self.head;
        while !prev.is_null() {
            let next = unsafe { (*prev).next };
            if next == target {
                unsafe { (*prev).next = (*target).next };
                self.count -= 1;
                return true;
            }
            prev = next;
        }
        false
    }

    fn count(&self) -> usize {
        self.count
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

/// Buddy allocator over the kernel heap range.
pub struct BuddyAllocator {
    base: VirtualAddress,
    /// Pages available for allocation (the metadata carve-out excluded).
    page_count: usize,
    free_lists: [FreeList; ORDER_COUNT],
    meta: *mut PageMeta,
}

// SAFETY: The allocator exclusively owns its region, metadata included;
// callers serialize access (see LockedHeap).
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Creates an allocator over `page_count` pages starting at `base`.
    ///
    /// The range must be directly writable and exclusively owned by the
    /// allocator. The per-page metadata is carved from the tail of the
    /// range; the rest is tiled with the largest power-of-two blocks that
    /// fit, so `page_count` need not be a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned or the range is too small to
    /// hold its own metadata plus one page.
    pub fn new(base: VirtualAddress, page_count: usize) -> Self {
        assert!(base.is_page_aligned(), "heap base must be page aligned");

        let meta_bytes = page_count * size_of::<PageMeta>();
        let meta_pages = meta_bytes.div_ceil(arch::PAGE_SIZE);
        assert!(
            page_count > meta_pages,
            "heap region too small for its own metadata"
        );
        let managed = page_count - meta_pages;
        let meta = (base.as_usize() + managed * arch::PAGE_SIZE) as *mut PageMeta;

        let mut allocator = Self {
            base,
            page_count: managed,
            free_lists: array::from_fn(|_| FreeList::new()),
            meta,
        };

        for index in 0..managed {
            allocator.set_meta(index, PageKind::Interior, 0);
        }

        // Greedy tiling: at each step take the largest block that both
        // fits the remainder and keeps its head naturally aligned.
        let mut index = 0;
        while index < managed {
            let align_order = if index == 0 {
                MAX_ORDER
            } else {
                (index.trailing_zeros() as usize).min(MAX_ORDER)
            };
            let fit_order = ((managed - index).ilog2() as usize).min(MAX_ORDER);
            let order = align_order.min(fit_order);

            allocator.insert_free(index, order);
            index += 1 << order;
        }

        log::info!(
            "buddy allocator: {} pages managed ({}), {} metadata pages",
            managed,
            ByteSize(managed * arch::PAGE_SIZE),
            meta_pages
        );

        allocator
    }

    /// Allocates a block of `2^order` pages.
    ///
    /// Pops the smallest available order that can satisfy the request and
    /// splits it down, pushing each upper half onto the next lower list.
    pub fn allocate(&mut self, order: usize) -> Result<VirtualAddress, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge);
        }

        let available = (order..=MAX_ORDER)
            .find(|&o| !self.free_lists[o].is_empty())
            .ok_or(AllocError::OutOfMemory)?;
        let block = self.free_lists[available]
            .pop()
            .ok_or(AllocError::OutOfMemory)?;
        let index = (block as usize - self.base.as_usize()) / arch::PAGE_SIZE;

        for split in (order..available).rev() {
            self.insert_free(index + (1 << split), split);
        }

        self.set_meta(index, PageKind::Allocated, order as u8);
        Ok(self.page_addr(index))
    }

    /// Allocates one page on behalf of a slab cache and tags it with the
    /// cache's size class, so frees of interior pointers can be routed
    /// back to the right cache.
    pub fn allocate_slab_page(&mut self, class: u8) -> Result<VirtualAddress, AllocError> {
        let addr = self.allocate(0)?;
        let index = (addr.as_usize() - self.base.as_usize()) / arch::PAGE_SIZE;
        self.set_meta(index, PageKind::Slab, class);
        Ok(addr)
    }

    /// Frees the block starting at `base`, coalescing with its buddy as
    /// long as the buddy is a free block of the same order.
    ///
    /// The block order is recovered from the page metadata; an address
    /// that is not the head of an allocated block (already freed, interior
    /// of a larger block, slab page, out of range) is rejected without
    /// touching any state.
    pub fn free(&mut self, base: VirtualAddress) -> Result<(), AllocError> {
        let Some(mut index) = self.page_index(base) else {
            log::warn!("buddy free of {base} which is outside the managed region");
            return Err(AllocError::InvalidFree);
        };

        let meta = self.meta(index);
        if meta.kind != PageKind::Allocated {
            log::warn!("buddy free of {base} which is not an allocated block head");
            return Err(AllocError::InvalidFree);
        }
        let mut order = meta.extra as usize;

        // The head is consumed by the merge loop below; only the final
        // (possibly larger) block's head becomes Free again.
        self.set_meta(index, PageKind::Interior, 0);

        while order < MAX_ORDER {
            let buddy = index ^ (1 << order);
            if buddy + (1 << order) > self.page_count {
                break;
            }

            let buddy_meta = self.meta(buddy);
            if buddy_meta.kind != PageKind::Free || buddy_meta.extra as usize != order {
                break;
            }
            if !self.free_lists[order].remove(self.page_addr(buddy).as_mut_ptr()) {
                break;
            }

            self.set_meta(buddy, PageKind::Interior, 0);
            index = index.min(buddy);
            order += 1;
        }

        self.insert_free(index, order);
        Ok(())
    }

    /// Returns the number of pages under management.
    pub fn total_pages(&self) -> usize {
        self.page_count
    }

    /// Returns the number of free pages across all orders.
    pub fn free_pages(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.count() << order)
            .sum()
    }

    /// Returns the number of free blocks at one specific order.
    pub fn free_blocks_at(&self, order: usize) -> usize {
        if order > MAX_ORDER {
            return 0;
        }
        self.free_lists[order].count()
    }

    /// Returns the state of the page containing `addr` (which need not be
    /// page-aligned), or `None` outside the managed region.
    pub fn page_info(&self, addr: VirtualAddress) -> Option<PageInfo> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        let index = offset / arch::PAGE_SIZE;
        if index >= self.page_count {
            return None;
        }

        let meta = self.meta(index);
        Some(match meta.kind {
            PageKind::Free => PageInfo::Free { order: meta.extra },
            PageKind::Allocated => PageInfo::Allocated { order: meta.extra },
            PageKind::Slab => PageInfo::Slab { class: meta.extra },
            PageKind::Interior => PageInfo::Interior,
        })
    }

    /// Returns the base of the managed region.
    pub fn region_base(&self) -> VirtualAddress {
        self.base
    }

    fn page_addr(&self, index: usize) -> VirtualAddress {
        VirtualAddress::new(self.base.as_usize() + index * arch::PAGE_SIZE)
    }

    /// Returns the page index of `addr` if it is a page-aligned address
    /// inside the managed region.
    fn page_index(&self, addr: VirtualAddress) -> Option<usize> {
        let offset = addr.as_usize().checked_sub(self.base.as_usize())?;
        if offset % arch::PAGE_SIZE != 0 {
            return None;
        }
        let index = offset / arch::PAGE_SIZE;
        (index < self.page_count).then_some(index)
    }

    fn meta(&self, index: usize) -> PageMeta {
        // SAFETY: index < page_count, and the metadata array was fully
        // initialized in new().
        unsafe { self.meta.add(index).read() }
    }

    fn set_meta(&mut self, index: usize, kind: PageKind, extra: u8) {
        // SAFETY: as above; the allocator owns the metadata exclusively.
        unsafe { self.meta.add(index).write(PageMeta { kind, extra }) };
    }

    /// Marks `index` as the head of a free block of `order` and pushes it
    /// onto the matching free list.
    fn insert_free(&mut self, index: usize, order: usize) {
        self.set_meta(index, PageKind::Free, order as u8);
        self.free_lists[order].push(self.page_addr(index).as_mut_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    /// Page-aligned host memory standing in for the kernel heap range.
    struct TestRegion {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestRegion {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * arch::PAGE_SIZE, arch::PAGE_SIZE).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn base(&self) -> VirtualAddress {
            VirtualAddress::from_ptr(self.ptr)
        }
    }

    impl Drop for TestRegion {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    /// 17 pages: one goes to metadata, leaving 16 managed (a single
    /// order-4 block after tiling).
    fn test_buddy() -> (BuddyAllocator, TestRegion) {
        let region = TestRegion::new(17);
        let buddy = BuddyAllocator::new(region.base(), 17);
        (buddy, region)
    }

    /// Snapshot of free-block counts per order, for round-trip checks.
    fn free_list_shape(buddy: &BuddyAllocator) -> [usize; ORDER_COUNT] {
        array::from_fn(|order| buddy.free_blocks_at(order))
    }

    #[test]
    fn init_tiles_with_maximal_blocks() {
        let (buddy, _region) = test_buddy();

        assert_eq!(buddy.total_pages(), 16);
        assert_eq!(buddy.free_pages(), 16);
        assert_eq!(buddy.free_blocks_at(4), 1);
        for order in [0, 1, 2, 3, 5] {
            assert_eq!(buddy.free_blocks_at(order), 0);
        }
    }

    #[test]
    fn init_handles_non_power_of_two_regions() {
        // 22 pages, 1 for metadata: 21 managed = 16 + 4 + 1.
        let region = TestRegion::new(22);
        let buddy = BuddyAllocator::new(region.base(), 22);

        assert_eq!(buddy.total_pages(), 21);
        assert_eq!(buddy.free_pages(), 21);
        assert_eq!(buddy.free_blocks_at(4), 1);
        assert_eq!(buddy.free_blocks_at(2), 1);
        assert_eq!(buddy.free_blocks_at(0), 1);
    }

    #[test]
    fn allocate_splits_larger_blocks() {
        let (mut buddy, _region) = test_buddy();

        let block = buddy.allocate(0).unwrap();
        assert_eq!(buddy.free_pages(), 15);
        // Splitting order 4 down to 0 leaves one buddy at each order.
        for order in 0..4 {
            assert_eq!(buddy.free_blocks_at(order), 1);
        }
        assert_eq!(buddy.free_blocks_at(4), 0);
        assert_eq!(buddy.page_info(block), Some(PageInfo::Allocated { order: 0 }));
    }

    #[test]
    fn free_restores_the_initial_shape() {
        let (mut buddy, _region) = test_buddy();
        let before = free_list_shape(&buddy);

        let block = buddy.allocate(2).unwrap();
        assert_ne!(free_list_shape(&buddy), before);

        buddy.free(block).unwrap();
        assert_eq!(free_list_shape(&buddy), before);
        assert_eq!(buddy.free_pages(), 16);
    }

    #[test]
    fn buddies_coalesce_in_either_free_order() {
        for reversed in [false, true] {
            let (mut buddy, _region) = test_buddy();

            let a = buddy.allocate(0).unwrap();
            let b = buddy.allocate(0).unwrap();
            // First two splits off the same order-1 block: true buddies.
            assert_eq!(a.as_usize() ^ b.as_usize(), arch::PAGE_SIZE);

            if reversed {
                buddy.free(b).unwrap();
                buddy.free(a).unwrap();
            } else {
                buddy.free(a).unwrap();
                buddy.free(b).unwrap();
            }

            // One order-4 block again, not two order-0 fragments.
            assert_eq!(buddy.free_blocks_at(0), 0);
            assert_eq!(buddy.free_blocks_at(4), 1);
        }
    }

    #[test]
    fn coalescing_stops_at_allocated_buddies() {
        let (mut buddy, _region) = test_buddy();

        let a = buddy.allocate(0).unwrap();
        let b = buddy.allocate(0).unwrap();
        let c = buddy.allocate(0).unwrap();

        // a and b are buddies in pages 0-1; c is page 2, split off an
        // order-1 block whose other half (page 3) stays free at order 0.
        buddy.free(a).unwrap();
        assert_eq!(buddy.free_blocks_at(0), 2);

        buddy.free(c).unwrap();
        // c merges with page 3 but stops at order 1: its order-1 buddy
        // (pages 0-1) is only half free.
        assert_eq!(buddy.free_blocks_at(0), 1);
        assert_eq!(buddy.free_blocks_at(1), 1);

        buddy.free(b).unwrap();
        assert_eq!(buddy.free_blocks_at(4), 1);
        assert_eq!(buddy.free_pages(), 16);
    }

    #[test]
    fn distinct_blocks_do_not_overlap() {
        let (mut buddy, _region) = test_buddy();
        let before = free_list_shape(&buddy);

        let small = buddy.allocate(0).unwrap();
        let large = buddy.allocate(1).unwrap();

        let small_range = small.as_usize()..small.as_usize() + arch::PAGE_SIZE;
        let large_range = large.as_usize()..large.as_usize() + 2 * arch::PAGE_SIZE;
        assert!(!small_range.contains(&large_range.start));
        assert!(!large_range.contains(&small_range.start));

        buddy.free(small).unwrap();
        buddy.free(large).unwrap();
        assert_eq!(free_list_shape(&buddy), before);
    }

    #[test]
    fn conservation_holds_across_a_workload() {
        let (mut buddy, _region) = test_buddy();
        let total = buddy.total_pages();

        let mut outstanding: Vec<(VirtualAddress, usize)> = Vec::new();
        for order in [0, 1, 0, 2, 0] {
            let block = buddy.allocate(order).unwrap();
            outstanding.push((block, order));

            let held: usize = outstanding.iter().map(|&(_, o)| 1usize << o).sum();
            assert_eq!(buddy.free_pages() + held, total);
        }

        // Free every other block, checking the ledger as we go.
        for (i, &(block, _)) in outstanding.iter().enumerate().rev() {
            if i % 2 == 0 {
                buddy.free(block).unwrap();
            }
        }
        let held: usize = outstanding
            .iter()
            .enumerate()
            .filter(|&(i, _)| i % 2 != 0)
            .map(|(_, &(_, o))| 1usize << o)
            .sum();
        assert_eq!(buddy.free_pages() + held, total);
    }

    #[test]
    fn exhaustion_returns_out_of_memory() {
        let (mut buddy, _region) = test_buddy();

        let mut blocks = Vec::new();
        for _ in 0..16 {
            blocks.push(buddy.allocate(0).unwrap());
        }
        assert_eq!(buddy.allocate(0), Err(AllocError::OutOfMemory));
        assert_eq!(buddy.free_pages(), 0);

        // The failed allocation corrupted nothing: everything frees and
        // coalesces back into the original block.
        for block in blocks {
            buddy.free(block).unwrap();
        }
        assert_eq!(buddy.free_blocks_at(4), 1);
    }

    #[test]
    fn order_above_max_is_rejected() {
        let (mut buddy, _region) = test_buddy();

        assert_eq!(buddy.allocate(MAX_ORDER + 1), Err(AllocError::OrderTooLarge));
    }

    #[test]
    fn double_free_is_detected() {
        let (mut buddy, _region) = test_buddy();

        let block = buddy.allocate(0).unwrap();
        buddy.free(block).unwrap();
        let shape = free_list_shape(&buddy);

        assert_eq!(buddy.free(block), Err(AllocError::InvalidFree));
        assert_eq!(free_list_shape(&buddy), shape);
    }

    #[test]
    fn free_of_interior_page_is_rejected() {
        let (mut buddy, _region) = test_buddy();

        let block = buddy.allocate(1).unwrap();
        let interior = VirtualAddress::new(block.as_usize() + arch::PAGE_SIZE);
        assert_eq!(buddy.free(interior), Err(AllocError::InvalidFree));

        // The block itself is still live and freeable.
        buddy.free(block).unwrap();
        assert_eq!(buddy.free_pages(), 16);
    }

    #[test]
    fn free_of_unaligned_or_foreign_address_is_rejected() {
        let (mut buddy, _region) = test_buddy();

        let block = buddy.allocate(0).unwrap();
        let unaligned = VirtualAddress::new(block.as_usize() + 8);
        assert_eq!(buddy.free(unaligned), Err(AllocError::InvalidFree));

        let foreign = VirtualAddress::new(buddy.region_base().as_usize() - arch::PAGE_SIZE);
        assert_eq!(buddy.free(foreign), Err(AllocError::InvalidFree));
    }

    #[test]
    fn slab_pages_are_tagged_with_their_class() {
        let (mut buddy, _region) = test_buddy();

        let page = buddy.allocate_slab_page(2).unwrap();
        assert_eq!(buddy.page_info(page), Some(PageInfo::Slab { class: 2 }));

        // Interior addresses resolve to the containing page.
        let inner = VirtualAddress::new(page.as_usize() + 100);
        assert_eq!(buddy.page_info(inner), Some(PageInfo::Slab { class: 2 }));

        // Slab pages are not buddy-freeable; the slab layer owns them.
        assert_eq!(buddy.free(page), Err(AllocError::InvalidFree));
    }
}

//! Physical frame allocation.
//!
//! The [`FrameAllocator`] is the single authority on which physical frames
//! are free. It keeps one bit per frame in a [`FrameBitmap`] whose storage
//! is placed directly after the kernel image, and a `used_frames` counter
//! held in lock-step with the bitmap's popcount.
//!
//! Initialization follows the order the boot handoff requires: every frame
//! starts out used, the bootloader's usable regions are then cleared to
//! free, and finally the kernel image plus the bitmap's own storage are
//! re-marked used. The re-reservation must come last because the firmware
//! reports the kernel's own load area as usable RAM.

use crate::{AddressTranslator, ByteSize, FrameBitmap, PhysicalAddress, arch};

/// A single entry of the boot-time memory map.
///
/// Implemented by the bootloader-specific memory map entry type so the
/// frame allocator can be built without copying the map.
pub trait BootRegion {
    /// Base physical address of the region.
    fn base(&self) -> PhysicalAddress;

    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Whether the region is usable RAM. Reserved, ACPI, and device
    /// regions return `false`.
    fn is_usable(&self) -> bool;
}

/// Bitmap-based allocator for single physical frames.
pub struct FrameAllocator {
    bitmap: FrameBitmap,
    total_frames: usize,
    used_frames: usize,
}

impl FrameAllocator {
    /// Builds the allocator from the boot memory map.
    ///
    /// `kernel_end` is the first physical address past the kernel image;
    /// the bitmap storage is placed at the next page boundary after it and
    /// reached through the installed [`AddressTranslator`].
    pub fn from_boot_map<R: BootRegion>(boot_map: &[R], kernel_end: PhysicalAddress) -> Self {
        // Total frames are derived from the highest usable address.
        let highest = boot_map
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| region.base().as_usize() + region.size())
            .max()
            .unwrap_or(0);
        let total_frames = highest / arch::PAGE_SIZE;

        let bitmap_base = kernel_end.align_up(arch::PAGE_SIZE);
        let storage = AddressTranslator::current().phys_to_ptr::<u8>(bitmap_base);
        // SAFETY: The storage range sits between the kernel image and the
        // first frame handed out below; both it and the kernel are
        // re-reserved before any allocation can touch them.
        let mut bitmap = unsafe { FrameBitmap::new(storage, total_frames) };

        // All used, then usable regions freed, then kernel + bitmap
        // re-reserved. Usable regions cover the kernel's own load area, so
        // the reservation has to win by coming last.
        bitmap.fill(true);

        for region in boot_map.iter().filter(|region| region.is_usable()) {
            // Partial frames at the region edges stay used.
            let first = region.base().as_usize().div_ceil(arch::PAGE_SIZE);
            let last = (region.base().as_usize() + region.size()) / arch::PAGE_SIZE;
            for frame in first..last.min(total_frames) {
                bitmap.clear(frame);
            }
        }

        // The bitmap sits directly after the kernel, so everything from
        // address zero through the end of the bitmap is one reserved range.
        let reserved_end = bitmap_base.as_usize() + FrameBitmap::storage_size(total_frames);
        let reserved_frames = reserved_end.div_ceil(arch::PAGE_SIZE);
        for frame in 0..reserved_frames.min(total_frames) {
            bitmap.set(frame);
        }

        let used_frames = bitmap.count_set();
        log::info!(
            "frame allocator: {} frames ({}), {} used after boot reservation",
            total_frames,
            ByteSize(total_frames * arch::PAGE_SIZE),
            used_frames
        );

        Self {
            bitmap,
            total_frames,
            used_frames,
        }
    }

    /// Allocates one frame, returning its physical address.
    ///
    /// Scans for the first free frame; `None` means physical memory is
    /// exhausted. O(total_frames) in the worst case, callers must not
    /// assume O(1).
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let frame = self.bitmap.find_first_clear()?;
        self.bitmap.set(frame);
        self.used_frames += 1;
        Some(PhysicalAddress::new(frame * arch::PAGE_SIZE))
    }

    /// Frees the frame containing `addr`.
    ///
    /// Freeing an already-free frame or an out-of-range address is a
    /// logged no-op.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        let frame = addr.frame_number().as_usize();
        match self.bitmap.clear(frame) {
            Some(true) => self.used_frames -= 1,
            Some(false) => log::warn!("free of frame {frame} which is already free"),
            None => log::warn!("free of out-of-range frame address {addr}"),
        }
    }

    /// Marks a byte range used unconditionally, rounded outward to whole
    /// frames. Idempotent; used to exclude framebuffer and ACPI areas.
    pub fn reserve_region(&mut self, start: PhysicalAddress, size: usize) {
        let first = start.frame_number().as_usize();
        let last = (start.as_usize() + size).div_ceil(arch::PAGE_SIZE);
        for frame in first..last {
            if let Some(false) = self.bitmap.set(frame) {
                self.used_frames += 1;
            }
        }
    }

    /// Returns the total number of frames tracked.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of used or reserved frames.
    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.total_frames - self.used_frames
    }
}

/// The kernel-facing frame allocator: a [`FrameAllocator`] behind a
/// `spin::Mutex`, so every mutation is a critical section.
pub struct LockedFrameAllocator(spin::Mutex<Option<FrameAllocator>>);

impl LockedFrameAllocator {
    /// Creates an empty wrapper; nothing works until [`Self::init`] runs.
    pub const fn uninit() -> Self {
        Self(spin::Mutex::new(None))
    }

    /// Builds the inner allocator from the boot memory map. Called once at
    /// boot, after the address translator is installed.
    pub fn init<R: BootRegion>(&self, boot_map: &[R], kernel_end: PhysicalAddress) {
        *self.0.lock() = Some(FrameAllocator::from_boot_map(boot_map, kernel_end));
    }

    /// See [`FrameAllocator::allocate_frame`].
    pub fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.0.lock().as_mut()?.allocate_frame()
    }

    /// See [`FrameAllocator::free_frame`].
    pub fn free_frame(&self, addr: PhysicalAddress) {
        if let Some(inner) = self.0.lock().as_mut() {
            inner.free_frame(addr);
        }
    }

    /// See [`FrameAllocator::reserve_region`].
    pub fn reserve_region(&self, start: PhysicalAddress, size: usize) {
        if let Some(inner) = self.0.lock().as_mut() {
            inner.reserve_region(start, size);
        }
    }

    /// Returns the total number of frames, or 0 before init.
    pub fn total_frames(&self) -> usize {
        self.0.lock().as_ref().map_or(0, FrameAllocator::total_frames)
    }

    /// Returns the number of used frames, or 0 before init.
    pub fn used_frames(&self) -> usize {
        self.0.lock().as_ref().map_or(0, FrameAllocator::used_frames)
    }
}

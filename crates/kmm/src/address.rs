//! Physical and virtual address types, and translation between them.
//!
//! The allocators in this crate need to write bookkeeping data (the frame
//! bitmap, intrusive free-list nodes) into the memory they manage. Physical
//! addresses are reached through the global [`AddressTranslator`]: on the
//! kernel target this is the higher-half direct map; on the host it is an
//! emulated memory buffer.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates an address from a raw value.
            #[inline]
            pub const fn new(address: usize) -> Self {
                Self(address)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Rounds the address up to the next multiple of `align`.
            ///
            /// `align` must be a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Rounds the address down to the previous multiple of `align`.
            ///
            /// `align` must be a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self(self.0 & !(align - 1))
            }

            /// Returns true if the address is a multiple of [`arch::PAGE_SIZE`].
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 % arch::PAGE_SIZE == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "An address in physical memory.\n\n\
     On i386 this is a 32-bit value; all arithmetic stays below 4 GiB."
);

impl PhysicalAddress {
    /// Returns the number of the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "An address in the kernel's virtual address space."
);

impl VirtualAddress {
    /// Creates a virtual address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the address as a const pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the number of the page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

/// Translates between physical addresses and pointers the kernel can
/// dereference.
///
/// Installed once during early boot ([`AddressTranslator::install`]) and
/// consulted by everything that touches physical memory afterwards. Test
/// builds keep one translator per thread so each test can install its own.
pub enum AddressTranslator {
    /// Direct-map translation: physical memory is mapped contiguously at a
    /// fixed virtual offset (the i386 higher-half mapping).
    Hardware { direct_map_offset: usize },
    /// Translation into an in-process buffer standing in for RAM.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(arch::EmulatedMemory),
}

#[cfg(not(any(test, feature = "software-emulation")))]
static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

impl AddressTranslator {
    /// Creates a direct-map translator with the given offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(arch::EmulatedMemory::new(size))
    }

    /// Installs the global translator.
    ///
    /// # Panics
    ///
    /// Panics if a translator has already been installed.
    pub fn install(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if TRANSLATOR.get().is_some() {
                panic!("address translator already installed");
            }
            TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        TRANSLATOR.with(|t| {
            if t.get().is_some() {
                panic!("address translator already installed");
            }
            t.call_once(|| translator);
        });
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been installed yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current()
            .expect("address translator not installed; call AddressTranslator::install during boot")
    }

    /// Returns the installed translator, or `None` before installation.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: The reference is extended to 'static. The
                    // translator is per-thread, written exactly once behind
                    // spin::Once, and the thread-local outlives every use
                    // within its thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }

    /// Translates a pointer back to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        PhysicalAddress::new(self.virt_to_phys(ptr as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_and_down() {
        let addr = PhysicalAddress::new(arch::PAGE_SIZE + 1);
        assert_eq!(
            addr.align_up(arch::PAGE_SIZE).as_usize(),
            2 * arch::PAGE_SIZE
        );
        assert_eq!(addr.align_down(arch::PAGE_SIZE).as_usize(), arch::PAGE_SIZE);

        let aligned = PhysicalAddress::new(3 * arch::PAGE_SIZE);
        assert_eq!(aligned.align_up(arch::PAGE_SIZE), aligned);
        assert_eq!(aligned.align_down(arch::PAGE_SIZE), aligned);
    }

    #[test]
    fn page_alignment_check() {
        assert!(PhysicalAddress::new(0).is_page_aligned());
        assert!(PhysicalAddress::new(arch::PAGE_SIZE).is_page_aligned());
        assert!(!PhysicalAddress::new(arch::PAGE_SIZE + 8).is_page_aligned());
    }

    #[test]
    fn frame_number_of_address() {
        let addr = PhysicalAddress::new(5 * arch::PAGE_SIZE + 100);
        assert_eq!(addr.frame_number().as_usize(), 5);
    }

    #[test]
    fn virtual_address_pointer_round_trip() {
        let value = 42u32;
        let addr = VirtualAddress::from_ptr(&value);
        assert_eq!(addr.as_ptr::<u32>(), &value as *const u32);
    }

    #[test]
    fn hardware_translation_applies_offset() {
        let translator = AddressTranslator::hardware(0xC000_0000);
        assert_eq!(translator.phys_to_virt(0x1000), 0xC000_1000);
        assert_eq!(translator.virt_to_phys(0xC000_1000), 0x1000);
    }

    #[test]
    fn emulated_translation_round_trips() {
        let translator = AddressTranslator::emulated(arch::PAGE_SIZE);
        let ptr = translator.phys_to_ptr::<u8>(PhysicalAddress::new(128));
        assert_eq!(translator.ptr_to_phys(ptr).as_usize(), 128);
    }

    #[test]
    fn install_makes_translator_current() {
        assert!(AddressTranslator::try_current().is_none());
        AddressTranslator::install(AddressTranslator::emulated(1024));
        assert!(AddressTranslator::try_current().is_some());
    }
}

//! Frame and page number newtypes.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PhysicalAddress, VirtualAddress, arch};

macro_rules! impl_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
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

impl_number_common!(
    FrameNumber,
    "A physical frame number.\n\n\
     Zero-indexed; frame `n` covers physical addresses\n\
     `[n * PAGE_SIZE, (n + 1) * PAGE_SIZE)`."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_number_common!(
    PageNumber,
    "A virtual page number.\n\n\
     Zero-indexed; the virtual counterpart of [`FrameNumber`]."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_usize(), 3 * arch::PAGE_SIZE);
    }

    #[test]
    fn frame_from_unaligned_address() {
        let addr = PhysicalAddress::new(2 * arch::PAGE_SIZE + 17);
        assert_eq!(FrameNumber::from(addr).as_usize(), 2);
    }

    #[test]
    fn frame_arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!((frame + 5).as_usize(), 15);
        assert_eq!(frame + 5 - frame, 5);
    }

    #[test]
    fn page_round_trip() {
        let page = PageNumber::new(42);
        assert_eq!(PageNumber::from(page.start()), page);
    }
}

//! Address types for the emulated 32-bit machine.
//!
//! Physical addresses index the emulated frame arena directly. Virtual
//! addresses are resolved through a [`PageDirectory`](crate::PageDirectory).

use core::{fmt, ops::Add};

use crate::{FrameNumber, arch};

macro_rules! address_type {
    ($name:ident, $label:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// The address as a machine word.
            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0 as u32
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Byte offset within the containing page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", $label, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, offset: usize) -> Self {
                Self::new(self.0 + offset)
            }
        }
    };
}

address_type!(PhysicalAddress, "PhysicalAddress");

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address does not fit the 32-bit physical bus.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// The frame holding this address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

address_type!(VirtualAddress, "VirtualAddress");

impl VirtualAddress {
    /// Creates a virtual address.
    ///
    /// `1 << 32` is accepted so that exclusive bounds such as the top of the
    /// exception stack region can be written down.
    ///
    /// # Panics
    ///
    /// Panics on anything past that.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr) || addr == u32::MAX as usize + 1,
            "virtual address exceeds maximum width"
        );
        Self(addr)
    }

    /// Index into the page directory (level 1) or a page table (level 0).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Adds `len`, or None if the result runs past the top of the space.
    #[inline]
    pub fn checked_add(self, len: usize) -> Option<Self> {
        let end = self.0.checked_add(len)?;
        (end <= u32::MAX as usize + 1).then_some(Self(end))
    }
}

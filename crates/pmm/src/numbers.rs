//! Frame numbers.

use core::fmt;

use crate::{address::PhysicalAddress, arch};

/// Index of a 4 KiB frame in the physical memory arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

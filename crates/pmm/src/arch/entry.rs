//! Page table entry.

use crate::{FrameNumber, PhysicalAddress};

use super::flags::PageFlags;

/// A single 32-bit page table entry.
///
/// The entry format:
/// - Bits 0-11: Flags
/// - Bits 12-31: Physical frame address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Physical address mask (bits 12-31).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// Flag bits mask (bits 0-11).
    const FLAGS_MASK: u32 = 0xFFF;

    /// Creates a new page table entry pointing at `frame`.
    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        let addr = frame.start().as_usize() as u32;
        Self((addr & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns the frame this entry points at, if present.
    pub fn frame(self) -> Option<FrameNumber> {
        self.address().map(PhysicalAddress::frame_number)
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }
}

//! Page table handle.

use crate::{FrameNumber, PhysicalMemoryManager};

use super::{ENTRY_COUNT, entry::PageEntry};

/// A page table stored in a physical frame.
///
/// The table is just a handle: its 1024 entries live in emulated physical
/// memory and every access goes through the [`PhysicalMemoryManager`] that
/// owns the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTable {
    frame: FrameNumber,
}

impl PageTable {
    /// Wraps the frame holding a page table.
    pub const fn from_frame(frame: FrameNumber) -> Self {
        Self { frame }
    }

    /// Returns the frame holding this table.
    pub const fn frame(self) -> FrameNumber {
        self.frame
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(self, pmm: &PhysicalMemoryManager, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        PageEntry::from_u32(pmm.memory().read_u32(self.entry_address(index)))
    }

    /// Overwrites the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn set_entry(self, pmm: &mut PhysicalMemoryManager, index: usize, entry: PageEntry) {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        let address = self.entry_address(index);
        pmm.memory_mut().write_u32(address, entry.as_u32());
    }

    /// Returns the number of entries in this page table.
    pub const fn len(self) -> usize {
        ENTRY_COUNT
    }

    fn entry_address(self, index: usize) -> usize {
        self.frame.start().as_usize() + index * core::mem::size_of::<u32>()
    }
}

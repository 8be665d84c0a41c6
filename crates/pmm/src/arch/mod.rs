//! The emulated machine architecture.
//!
//! Exo runs on a software model of 32-bit x86 paging:
//! - 32-bit physical and virtual addresses
//! - 2 levels of page tables (page directory, page table)
//! - 10-bit indexes (1024 entries per table)
//! - 12-bit page offset (4 KiB pages)
//!
//! Page tables live inside physical frames exactly as the hardware would see
//! them, so walking a table means reading little-endian entries out of the
//! emulated physical memory.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use alloc::vec::Vec;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Bytes mapped by one page table (4 MiB).
pub const TABLE_SPAN: usize = PAGE_SIZE * ENTRY_COUNT;

/// Number of page table levels (level 1 = directory, level 0 = table).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// Number of entries in every page table.
pub const ENTRY_COUNT: usize = 1024;

/// Returns the page table index for a given virtual address at the specified level.
///
/// - Level 0: bits 12-21 (page table)
/// - Level 1: bits 22-31 (page directory)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let shift = match level {
        0 => 12,
        1 => 22,
        _ => panic!("level out of range for two-level paging"),
    };
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

/// Validates a virtual address.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

/// Emulated physical memory.
///
/// A flat byte buffer holding every frame back to back, so physical address
/// `p` is simply byte `p` of the buffer.
pub struct EmulatedMemory {
    memory: Vec<u8>,
}

impl EmulatedMemory {
    /// Creates a zeroed emulated memory region holding `frames` frames.
    pub fn new(frames: usize) -> Self {
        let size = frames * PAGE_SIZE;
        assert!(validate_physical(size), "emulated memory exceeds physical address width");
        Self {
            memory: alloc::vec![0u8; size],
        }
    }

    /// Returns the bytes starting at `phys` with the given length.
    ///
    /// # Panics
    /// Panics if the range is outside of emulated memory.
    pub fn slice(&self, phys: usize, len: usize) -> &[u8] {
        assert!(phys + len <= self.memory.len(), "physical address out of bounds");
        &self.memory[phys..phys + len]
    }

    /// Returns the mutable bytes starting at `phys` with the given length.
    ///
    /// # Panics
    /// Panics if the range is outside of emulated memory.
    pub fn slice_mut(&mut self, phys: usize, len: usize) -> &mut [u8] {
        assert!(phys + len <= self.memory.len(), "physical address out of bounds");
        &mut self.memory[phys..phys + len]
    }

    /// Reads a little-endian `u32` at `phys`.
    pub fn read_u32(&self, phys: usize) -> u32 {
        let bytes = self.slice(phys, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Writes a little-endian `u32` at `phys`.
    pub fn write_u32(&mut self, phys: usize, value: u32) {
        self.slice_mut(phys, 4).copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_address_into_indexes() {
        let addr = 0xEEBF_E123;
        assert_eq!(page_index(addr, 1), 0x3BA);
        assert_eq!(page_index(addr, 0), 0x3FE);
    }

    #[test]
    #[should_panic(expected = "level out of range")]
    fn rejects_third_level() {
        page_index(0, 2);
    }

    #[test]
    fn emulated_memory_round_trips_words() {
        let mut mem = EmulatedMemory::new(2);
        mem.write_u32(PAGE_SIZE + 8, 0xDEAD_BEEF);
        assert_eq!(mem.read_u32(PAGE_SIZE + 8), 0xDEAD_BEEF);
        assert_eq!(mem.slice(PAGE_SIZE + 8, 1), &[0xEF]);
    }
}

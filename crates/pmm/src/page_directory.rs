//! Two-level page directory management.
//!
//! A [`PageDirectory`] is a handle on the frame holding the top-level table.
//! Page tables are allocated from the [`PhysicalMemoryManager`] on demand and
//! every mapping holds one reference on the frame it maps, so removing the
//! last mapping of a frame returns it to the free list.

use core::fmt;

use alloc::vec::Vec;

use crate::{
    AllocError, FrameNumber, PhysicalMemoryManager, VirtualAddress,
    arch::{self, PageEntry, PageFlags, PageTable},
};

/// Errors returned by page directory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A page table could not be allocated.
    OutOfMemory,
    /// No page is mapped at the address.
    NotMapped,
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        MapError::OutOfMemory
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "out of memory for page table"),
            MapError::NotMapped => write!(f, "address is not mapped"),
        }
    }
}

/// Flags given to directory entries that point at page tables.
///
/// Access control is left entirely to the leaf entries.
const TABLE_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::USER);

/// A two-level page directory.
///
/// The directory is a lightweight handle: the tables themselves live in
/// physical memory, so every operation takes the memory manager that owns
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory {
    /// The top-level table for this address space.
    root: PageTable,
}

impl PageDirectory {
    /// Creates a new page directory with an empty top-level table.
    pub fn new(pmm: &mut PhysicalMemoryManager) -> Result<Self, AllocError> {
        let frame = pmm.allocate(true)?;
        pmm.incref(frame);
        pmm.mark_page_table(frame);
        Ok(Self {
            root: PageTable::from_frame(frame),
        })
    }

    /// Returns the frame holding the top-level table.
    pub fn root(&self) -> FrameNumber {
        self.root.frame()
    }

    #[cfg(test)]
    fn table_present(&self, pmm: &PhysicalMemoryManager, virt: VirtualAddress) -> bool {
        self.table(pmm, virt).is_some()
    }

    /// Returns the leaf entry for a virtual address.
    ///
    /// Returns None if no page table covers the address. The returned entry
    /// may itself be non-present.
    pub fn entry(&self, pmm: &PhysicalMemoryManager, virt: VirtualAddress) -> Option<PageEntry> {
        let table = self.table(pmm, virt)?;
        Some(table.entry(pmm, virt.page_index(0)))
    }

    /// Looks up the frame and flags mapped at a virtual address.
    pub fn lookup(
        &self,
        pmm: &PhysicalMemoryManager,
        virt: VirtualAddress,
    ) -> Option<(FrameNumber, PageFlags)> {
        let entry = self.entry(pmm, virt)?;
        Some((entry.frame()?, entry.flags()))
    }

    /// Maps `frame` at `virt` with the given flags.
    ///
    /// Any page already mapped at `virt` is removed first. Mapping the frame
    /// that is already there only changes the flags. The present bit is
    /// always set.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn insert(
        &self,
        pmm: &mut PhysicalMemoryManager,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let table = self.table_or_create(pmm, virt)?;
        let index = virt.page_index(0);

        // Take the new reference before dropping the old one so that
        // re-inserting the same frame never frees it.
        pmm.incref(frame);
        let old = table.entry(pmm, index);
        if let Some(old_frame) = old.frame() {
            pmm.decref(old_frame);
        }

        table.set_entry(pmm, index, PageEntry::new(frame, flags | PageFlags::PRESENT));
        Ok(())
    }

    /// Unmaps a virtual address.
    ///
    /// Returns the frame that was mapped, or None if the address was not
    /// mapped. The frame is freed if this was its last reference.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn remove(&self, pmm: &mut PhysicalMemoryManager, virt: VirtualAddress) -> Option<FrameNumber> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let table = self.table(pmm, virt)?;
        let index = virt.page_index(0);
        let frame = table.entry(pmm, index).frame()?;
        table.set_entry(pmm, index, PageEntry::default());
        pmm.decref(frame);
        Some(frame)
    }

    /// Replaces the flags of an existing mapping, keeping its frame.
    pub fn set_flags(
        &self,
        pmm: &mut PhysicalMemoryManager,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let table = self.table(pmm, virt).ok_or(MapError::NotMapped)?;
        let index = virt.page_index(0);
        let mut entry = table.entry(pmm, index);
        if !entry.is_present() {
            return Err(MapError::NotMapped);
        }
        entry.set_flags(flags | PageFlags::PRESENT);
        table.set_entry(pmm, index, entry);
        Ok(())
    }

    /// Returns every present mapping in `[start, end)`, in address order.
    ///
    /// Regions without a page table are skipped a whole table at a time.
    pub fn mapped_pages(
        &self,
        pmm: &PhysicalMemoryManager,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Vec<(VirtualAddress, PageEntry)> {
        let mut pages = Vec::new();
        let mut addr = start.align_down(arch::PAGE_SIZE).as_usize();
        let end = end.as_usize();

        while addr < end {
            let virt = VirtualAddress::new(addr);
            match self.table(pmm, virt) {
                None => {
                    addr = (addr | (arch::TABLE_SPAN - 1)) + 1;
                }
                Some(table) => {
                    let entry = table.entry(pmm, virt.page_index(0));
                    if entry.is_present() {
                        pages.push((virt, entry));
                    }
                    addr += arch::PAGE_SIZE;
                }
            }
        }

        pages
    }

    /// Releases every mapping, every page table and the directory itself.
    pub fn destroy(self, pmm: &mut PhysicalMemoryManager) {
        for dir_index in 0..arch::ENTRY_COUNT {
            let Some(table_frame) = self.root.entry(pmm, dir_index).frame() else {
                continue;
            };
            let table = PageTable::from_frame(table_frame);
            for index in 0..table.len() {
                if let Some(frame) = table.entry(pmm, index).frame() {
                    table.set_entry(pmm, index, PageEntry::default());
                    pmm.decref(frame);
                }
            }
            self.root.set_entry(pmm, dir_index, PageEntry::default());
            pmm.decref(table_frame);
        }
        pmm.decref(self.root.frame());
    }

    fn table(&self, pmm: &PhysicalMemoryManager, virt: VirtualAddress) -> Option<PageTable> {
        let entry = self.root.entry(pmm, virt.page_index(1));
        entry.frame().map(PageTable::from_frame)
    }

    fn table_or_create(
        &self,
        pmm: &mut PhysicalMemoryManager,
        virt: VirtualAddress,
    ) -> Result<PageTable, AllocError> {
        if let Some(table) = self.table(pmm, virt) {
            return Ok(table);
        }

        let frame = pmm.allocate(true)?;
        pmm.incref(frame);
        pmm.mark_page_table(frame);
        self.root
            .set_entry(pmm, virt.page_index(1), PageEntry::new(frame, TABLE_FLAGS));
        Ok(PageTable::from_frame(frame))
    }
}

//! Virtual memory layout shared by the kernel and user programs.
//!
//! ```text
//!  0xEEC00000  UTOP, UXSTACKTOP  ---------------------
//!                                 user exception stack   PGSIZE
//!  0xEEBFF000                     ---------------------
//!                                 empty guard page       PGSIZE
//!  0xEEBFE000  USTACKTOP         ---------------------
//!                                 normal user stack
//!                                       ...
//!  0xD0000000                     ---------------------
//!                                 block cache window     DISKSIZE
//!  0x10000000  DISKMAP           ---------------------
//!                                       ...
//!  0x00800000  UTEXT             ---------------------
//!  0x007FF000  PFTEMP             scratch page
//!  0x00400000  UTEMP             ---------------------
//! ```

/// Bytes mapped by a page.
pub const PGSIZE: u32 = pmm::PAGE_SIZE as u32;

/// Bytes mapped by a page table.
pub const PTSIZE: u32 = pmm::TABLE_SPAN as u32;

/// Top of the user-accessible address space.
pub const UTOP: u32 = 0xEEC0_0000;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;

/// Top of the normal user stack; one guard page below the exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE;

/// Start of the user temporary mapping area.
pub const UTEMP: u32 = 0x0040_0000;

/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PTSIZE - PGSIZE;

/// Where user program text starts.
pub const UTEXT: u32 = 0x0080_0000;

/// Start of the disk block window.
pub const DISKMAP: u32 = 0x1000_0000;

/// Size of the disk block window.
pub const DISKSIZE: u32 = 0xC000_0000;

/// Rounds `addr` down to a page boundary.
pub const fn round_down(addr: u32) -> u32 {
    addr & !(PGSIZE - 1)
}

/// Returns whether `addr` is page-aligned.
pub const fn is_page_aligned(addr: u32) -> bool {
    addr & (PGSIZE - 1) == 0
}

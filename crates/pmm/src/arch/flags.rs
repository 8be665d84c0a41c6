//! Page table entry flags.

bitflags::bitflags! {
    /// Permission and status bits held in the low 12 bits of a page table entry.
    ///
    /// The hardware-defined bits follow 32-bit x86. Bits 9-11 are left to
    /// software; Exo uses two of them to implement shared and copy-on-write
    /// mappings in user space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        /// The entry maps a page (or, in a directory, a page table).
        const PRESENT = 1 << 0;
        /// Writes are allowed.
        const WRITABLE = 1 << 1;
        /// User-mode accesses are allowed.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
        /// Set by the MMU on any access through this entry.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on a write through this entry.
        const DIRTY = 1 << 6;
        /// Large page (unused by the emulated MMU).
        const HUGE_PAGE = 1 << 7;
        /// Global mapping.
        const GLOBAL = 1 << 8;
        /// Software-available bit 9.
        const AVAIL_0 = 1 << 9;
        /// Mapping is shared between address spaces and never copied.
        const SHARE = 1 << 10;
        /// Mapping is copy-on-write.
        const COPY_ON_WRITE = 1 << 11;

        /// All software-available bits.
        const AVAILABLE = Self::AVAIL_0.bits() | Self::SHARE.bits() | Self::COPY_ON_WRITE.bits();
    }
}

impl PageFlags {
    /// Bits that user code may request through the system-call interface.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAILABLE);

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.contains(Self::USER)
    }
}

//! Software memory management unit.
//!
//! An [`AddressSpace`] pairs a page directory with the physical memory it
//! lives in and performs user-mode accesses the way the hardware would:
//! every access walks the tables, checks the permission bits, sets Accessed
//! (and Dirty on writes) in the leaf entry, or raises a [`PageFault`].

use core::fmt;

use crate::{
    PageDirectory, PhysicalAddress, PhysicalMemoryManager, VirtualAddress,
    arch::{self, PageFlags},
};

bitflags::bitflags! {
    /// Page fault error code, laid out like the x86 error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultCode: u32 {
        /// The page was present; the fault is a protection violation.
        const PROTECTION = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// The kind of memory access being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A page fault raised by the software MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address (not rounded).
    pub address: VirtualAddress,
    /// Why the access failed.
    pub code: FaultCode,
}

impl PageFault {
    /// Returns whether the faulting access was a write.
    pub fn is_write(&self) -> bool {
        self.code.contains(FaultCode::WRITE)
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {} ({} {})",
            self.address,
            if self.is_write() { "write" } else { "read" },
            if self.code.contains(FaultCode::PROTECTION) {
                "protection"
            } else {
                "not-present"
            }
        )
    }
}

/// A user address space as seen through the software MMU.
pub struct AddressSpace<'a> {
    pmm: &'a mut PhysicalMemoryManager,
    directory: PageDirectory,
}

impl<'a> AddressSpace<'a> {
    /// Creates a view of `directory` backed by `pmm`.
    pub fn new(pmm: &'a mut PhysicalMemoryManager, directory: PageDirectory) -> Self {
        Self { pmm, directory }
    }

    /// Returns the page directory of this address space.
    pub fn directory(&self) -> PageDirectory {
        self.directory
    }

    /// Translates a user-mode access to a physical address.
    ///
    /// On success the leaf entry's Accessed bit (and Dirty bit for writes)
    /// is set.
    pub fn translate(
        &mut self,
        virt: VirtualAddress,
        access: Access,
    ) -> Result<PhysicalAddress, PageFault> {
        let (frame, flags) = self.permitted(virt, access)?;

        let mut updated = flags | PageFlags::ACCESSED;
        if access == Access::Write {
            updated |= PageFlags::DIRTY;
        }
        if updated != flags {
            let page = virt.align_down(arch::PAGE_SIZE);
            // The mapping was just found, so it cannot be missing.
            let _ = self.directory.set_flags(self.pmm, page, updated);
        }

        Ok(frame.start() + virt.page_offset())
    }

    /// Reads `buf.len()` bytes starting at `virt`.
    ///
    /// Pages are accessed in order; the first failing page raises the fault.
    pub fn read(&mut self, virt: VirtualAddress, buf: &mut [u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < buf.len() {
            let addr = virt + done;
            let phys = self.translate(addr, Access::Read)?;
            let chunk = (arch::PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(self.pmm.read(phys, chunk));
            done += chunk;
        }
        Ok(())
    }

    /// Writes `data` starting at `virt`.
    ///
    /// Pages are accessed in order; pages before a faulting page have
    /// already been written when the fault is raised.
    pub fn write(&mut self, virt: VirtualAddress, data: &[u8]) -> Result<(), PageFault> {
        let mut done = 0;
        while done < data.len() {
            let addr = virt + done;
            let phys = self.translate(addr, Access::Write)?;
            let chunk = (arch::PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            self.pmm
                .write(phys, chunk)
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Reads a little-endian word.
    pub fn read_u32(&mut self, virt: VirtualAddress) -> Result<u32, PageFault> {
        let mut bytes = [0u8; 4];
        self.read(virt, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes a little-endian word.
    pub fn write_u32(&mut self, virt: VirtualAddress, value: u32) -> Result<(), PageFault> {
        self.write(virt, &value.to_le_bytes())
    }

    /// Checks that user mode may access `[virt, virt + len)` with `required` permissions.
    ///
    /// Nothing is modified. On failure returns the first offending address:
    /// `virt` itself if the first page fails, otherwise the start of the
    /// first failing page. Ranges that wrap past the top of the address
    /// space fail at `virt`.
    pub fn check(
        &self,
        virt: VirtualAddress,
        len: usize,
        required: PageFlags,
    ) -> Result<(), VirtualAddress> {
        let required = required | PageFlags::PRESENT | PageFlags::USER;
        let Some(end) = virt.checked_add(len) else {
            return Err(virt);
        };

        let mut page = virt.align_down(arch::PAGE_SIZE);
        while page < end {
            let ok = self
                .directory
                .lookup(&*self.pmm, page)
                .is_some_and(|(_, flags)| flags.contains(required));
            if !ok {
                return Err(if page < virt { virt } else { page });
            }
            page = page + arch::PAGE_SIZE;
        }
        Ok(())
    }

    fn permitted(
        &self,
        virt: VirtualAddress,
        access: Access,
    ) -> Result<(crate::FrameNumber, PageFlags), PageFault> {
        let mut code = FaultCode::USER;
        if access == Access::Write {
            code |= FaultCode::WRITE;
        }

        let page = virt.align_down(arch::PAGE_SIZE);
        let Some((frame, flags)) = self.directory.lookup(&*self.pmm, page) else {
            return Err(PageFault { address: virt, code });
        };

        let allowed = flags.is_user() && (access == Access::Read || flags.is_writable());
        if !allowed {
            return Err(PageFault {
                address: virt,
                code: code | FaultCode::PROTECTION,
            });
        }
        Ok((frame, flags))
    }
}

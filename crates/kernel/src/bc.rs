//! Fault-driven disk block cache.
//!
//! The disk is mirrored into the address space of the environment that owns
//! the cache, one page per block, starting at [`DISKMAP`]. There is no index
//! and no eviction policy: a block is resident exactly when its page is
//! mapped and dirty exactly when the page's Dirty bit is set. Touching a
//! non-resident block page faults, and the kernel's fault path calls
//! [`BlockCache::handle_fault`] to read the block in.

use core::fmt;

use alloc::{boxed::Box, vec, vec::Vec};
use pmm::{AddressSpace, PageDirectory, PageFault, PageFlags, PhysicalMemoryManager, VirtualAddress};

use crate::{
    disk::{self, BITMAP_START, BLKSECTS, BLKSIZE, BlockDevice, DiskError, FS_MAGIC, SUPERBLOCK, Superblock},
    memlayout::{DISKMAP, DISKSIZE, round_down},
};

/// Errors raised by the block cache.
///
/// Every one of these means the cache or the store is in a state the kernel
/// cannot trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Block 0, or a block past the end of the store.
    BadBlock(u32),
    /// The address is outside the block window.
    OutOfWindow(u32),
    /// A block marked free in the bitmap was read.
    ReadFreeBlock(u32),
    /// The backing store failed.
    Disk(DiskError),
    /// No frame was available for a block.
    NoMemory,
    /// The superblock magic is wrong.
    BadSuperblock(u32),
    /// The startup self-test read back something other than what it wrote.
    SelfTest,
    /// A metadata block is marked free.
    CorruptBitmap(u32),
}

impl From<DiskError> for CacheError {
    fn from(err: DiskError) -> Self {
        CacheError::Disk(err)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::BadBlock(blockno) => write!(f, "bad block number {blockno:08x}"),
            CacheError::OutOfWindow(va) => write!(f, "address {va:08x} outside the block window"),
            CacheError::ReadFreeBlock(blockno) => write!(f, "reading free block {blockno:08x}"),
            CacheError::Disk(err) => write!(f, "disk error: {err}"),
            CacheError::NoMemory => write!(f, "no memory for block"),
            CacheError::BadSuperblock(magic) => write!(f, "bad superblock magic {magic:08x}"),
            CacheError::SelfTest => write!(f, "block cache self-test failed"),
            CacheError::CorruptBitmap(blockno) => {
                write!(f, "metadata block {blockno} marked free")
            }
        }
    }
}

/// The block cache of one environment.
pub struct BlockCache {
    disk: Box<dyn BlockDevice + Send>,
    superblock: Option<Superblock>,
    bitmap: Option<Vec<u8>>,
}

impl BlockCache {
    pub fn new(disk: Box<dyn BlockDevice + Send>) -> Self {
        Self {
            disk,
            superblock: None,
            bitmap: None,
        }
    }

    /// Returns the superblock, once it has been read.
    pub fn superblock(&self) -> Option<Superblock> {
        self.superblock
    }

    /// Returns the window address of a block.
    pub fn diskaddr(&self, blockno: u32) -> Result<u32, CacheError> {
        let past_end = self.superblock.is_some_and(|sb| blockno >= sb.nblocks);
        if blockno == 0 || past_end || blockno as usize >= DISKSIZE as usize / BLKSIZE {
            return Err(CacheError::BadBlock(blockno));
        }
        Ok(DISKMAP + blockno * BLKSIZE as u32)
    }

    /// Returns whether the page holding `va` is mapped.
    pub fn va_is_mapped(pmm: &PhysicalMemoryManager, pgdir: PageDirectory, va: u32) -> bool {
        pgdir.lookup(pmm, page_of(va)).is_some()
    }

    /// Returns whether the page holding `va` is dirty.
    pub fn va_is_dirty(pmm: &PhysicalMemoryManager, pgdir: PageDirectory, va: u32) -> bool {
        pgdir
            .lookup(pmm, page_of(va))
            .is_some_and(|(_, flags)| flags.contains(PageFlags::DIRTY))
    }

    /// Reads the block containing `va` into a fresh page.
    pub fn handle_fault(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
        va: u32,
    ) -> Result<(), CacheError> {
        let blockno = block_of(va)?;
        if self.superblock.is_some_and(|sb| blockno >= sb.nblocks) {
            return Err(CacheError::BadBlock(blockno));
        }

        let page = page_of(va);
        let frame = pmm.allocate(true).map_err(|_| CacheError::NoMemory)?;
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        if pgdir.insert(pmm, page, frame, flags).is_err() {
            // Never referenced, so still ours to release.
            let _ = pmm.deallocate(frame);
            return Err(CacheError::NoMemory);
        }

        self.disk
            .read_sectors(blockno * BLKSECTS as u32, pmm.frame_bytes_mut(frame))?;

        // A read is not a write.
        pgdir
            .set_flags(pmm, page, flags)
            .map_err(|_| CacheError::BadBlock(blockno))?;

        if let Some(bitmap) = &self.bitmap
            && disk::bitmap_is_free(bitmap, blockno)
        {
            return Err(CacheError::ReadFreeBlock(blockno));
        }

        log::trace!("bc: loaded block {blockno}");
        Ok(())
    }

    /// Writes the block containing `va` back if it is resident and dirty.
    pub fn flush_block(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
        va: u32,
    ) -> Result<(), CacheError> {
        let blockno = block_of(va)?;
        let page = page_of(va);
        let Some((frame, flags)) = pgdir.lookup(pmm, page) else {
            return Ok(());
        };
        if !flags.contains(PageFlags::DIRTY) {
            return Ok(());
        }

        self.disk
            .write_sectors(blockno * BLKSECTS as u32, pmm.frame_bytes(frame))?;
        pgdir
            .set_flags(pmm, page, flags - PageFlags::DIRTY)
            .map_err(|_| CacheError::BadBlock(blockno))?;

        log::trace!("bc: flushed block {blockno}");
        Ok(())
    }

    /// Brings the cache up for an address space.
    ///
    /// Runs the self-test on block 1, then reads the superblock and the
    /// free bitmap and checks that the metadata blocks are in use.
    pub fn init(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
    ) -> Result<(), CacheError> {
        self.check(pmm, pgdir)?;

        let mut raw = [0u8; Superblock::SIZE];
        self.read(pmm, pgdir, self.diskaddr(SUPERBLOCK)?, &mut raw)?;
        let sb = Superblock::from_bytes(&raw);
        if sb.magic != FS_MAGIC {
            return Err(CacheError::BadSuperblock(sb.magic));
        }
        self.superblock = Some(sb);

        let mut bitmap = vec![0u8; sb.bitmap_blocks() as usize * BLKSIZE];
        for (i, chunk) in bitmap.chunks_exact_mut(BLKSIZE).enumerate() {
            let va = self.diskaddr(BITMAP_START + i as u32)?;
            self.read(pmm, pgdir, va, chunk)?;
        }
        for blockno in 0..BITMAP_START + sb.bitmap_blocks() {
            if disk::bitmap_is_free(&bitmap, blockno) {
                return Err(CacheError::CorruptBitmap(blockno));
            }
        }
        self.bitmap = Some(bitmap);

        log::info!("bc: {} blocks, superblock good", sb.nblocks);
        Ok(())
    }

    /// Smashes the superblock, pushes it through the disk and reads it back.
    fn check(&mut self, pmm: &mut PhysicalMemoryManager, pgdir: PageDirectory) -> Result<(), CacheError> {
        const OOPS: &[u8] = b"OOPS!\n\0";
        let va = self.diskaddr(SUPERBLOCK)?;

        let mut backup = vec![0u8; BLKSIZE];
        self.read(pmm, pgdir, va, &mut backup)?;

        self.write(pmm, pgdir, va, OOPS)?;
        self.flush_block(pmm, pgdir, va)?;
        if !Self::va_is_mapped(pmm, pgdir, va) || Self::va_is_dirty(pmm, pgdir, va) {
            return Err(CacheError::SelfTest);
        }

        pgdir.remove(pmm, page_of(va));
        if Self::va_is_mapped(pmm, pgdir, va) {
            return Err(CacheError::SelfTest);
        }

        let mut back = [0u8; OOPS.len()];
        self.read(pmm, pgdir, va, &mut back)?;
        if back != OOPS {
            return Err(CacheError::SelfTest);
        }

        self.write(pmm, pgdir, va, &backup)?;
        self.flush_block(pmm, pgdir, va)?;

        log::info!("block cache is good");
        Ok(())
    }

    fn read(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
        va: u32,
        buf: &mut [u8],
    ) -> Result<(), CacheError> {
        self.access(pmm, pgdir, |space| {
            space.read(VirtualAddress::new(va as usize), buf)
        })
    }

    fn write(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
        va: u32,
        data: &[u8],
    ) -> Result<(), CacheError> {
        self.access(pmm, pgdir, |space| {
            space.write(VirtualAddress::new(va as usize), data)
        })
    }

    /// Runs an access through the MMU, loading blocks as it faults on them.
    fn access(
        &mut self,
        pmm: &mut PhysicalMemoryManager,
        pgdir: PageDirectory,
        mut op: impl FnMut(&mut AddressSpace<'_>) -> Result<(), PageFault>,
    ) -> Result<(), CacheError> {
        loop {
            match op(&mut AddressSpace::new(pmm, pgdir)) {
                Ok(()) => return Ok(()),
                Err(fault) => self.handle_fault(pmm, pgdir, fault.address.as_u32())?,
            }
        }
    }
}

/// Returns whether `va` lies in the block window.
pub fn in_window(va: u32) -> bool {
    va >= DISKMAP && va - DISKMAP < DISKSIZE
}

fn block_of(va: u32) -> Result<u32, CacheError> {
    if !in_window(va) {
        return Err(CacheError::OutOfWindow(va));
    }
    Ok((va - DISKMAP) / BLKSIZE as u32)
}

fn page_of(va: u32) -> VirtualAddress {
    VirtualAddress::new(round_down(va) as usize)
}

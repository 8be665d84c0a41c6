//! Backing store for the block cache.
//!
//! The store is addressed in 512-byte sectors; the cache works in 4 KiB
//! blocks of [`BLKSECTS`] sectors each. Block 1 holds the [`Superblock`] and
//! the free bitmap starts at block 2, one bit per block, set meaning free.

use core::fmt;

use alloc::{sync::Arc, vec, vec::Vec};
use spin::Mutex;

/// Bytes per disk sector.
pub const SECTSIZE: usize = 512;

/// Bytes per cache block.
pub const BLKSIZE: usize = pmm::PAGE_SIZE;

/// Sectors per block.
pub const BLKSECTS: usize = BLKSIZE / SECTSIZE;

/// Blocks tracked by one bitmap block.
pub const BLKBITSIZE: usize = BLKSIZE * 8;

/// Magic number identifying a formatted store.
pub const FS_MAGIC: u32 = 0x4A05_30AE;

/// Block number of the superblock.
pub const SUPERBLOCK: u32 = 1;

/// Block number of the first bitmap block.
pub const BITMAP_START: u32 = 2;

/// Errors reported by a [`BlockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The transfer reaches past the end of the device.
    OutOfRange { sector: u32 },
    /// The buffer is not a whole number of sectors.
    PartialSector,
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::OutOfRange { sector } => write!(f, "sector {sector} out of range"),
            DiskError::PartialSector => write!(f, "transfer is not sector-sized"),
        }
    }
}

/// A synchronous sector-addressed storage device.
pub trait BlockDevice {
    /// Number of sectors on the device.
    fn sectors(&self) -> u32;

    /// Reads `buf.len() / SECTSIZE` sectors starting at `first`.
    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), DiskError>;

    /// Writes `buf.len() / SECTSIZE` sectors starting at `first`.
    fn write_sectors(&mut self, first: u32, buf: &[u8]) -> Result<(), DiskError>;
}

/// The store's root metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    /// Total number of blocks on the store.
    pub nblocks: u32,
}

impl Superblock {
    /// Bytes of the superblock at the start of block 1.
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..].copy_from_slice(&self.nblocks.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nblocks: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Number of bitmap blocks needed to track every block.
    pub fn bitmap_blocks(&self) -> u32 {
        (self.nblocks as usize).div_ceil(BLKBITSIZE) as u32
    }
}

/// Returns whether `blockno` is marked free in `bitmap`.
pub fn bitmap_is_free(bitmap: &[u8], blockno: u32) -> bool {
    let byte = blockno as usize / 8;
    bitmap
        .get(byte)
        .is_some_and(|bits| bits & (1 << (blockno % 8)) != 0)
}

/// A RAM-backed disk.
///
/// Clones share the same sectors, so a test can inspect the store after the
/// kernel has taken ownership of a handle.
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemDisk {
    /// Creates a zero-filled disk of `nblocks` blocks.
    pub fn new(nblocks: u32) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0; nblocks as usize * BLKSIZE])),
        }
    }

    /// Creates a disk with a superblock and a bitmap in which only the
    /// metadata blocks are in use.
    ///
    /// # Panics
    /// Panics if the metadata would not fit on the disk.
    pub fn format(nblocks: u32) -> Self {
        let disk = Self::new(nblocks);
        let sb = Superblock {
            magic: FS_MAGIC,
            nblocks,
        };
        let used = BITMAP_START + sb.bitmap_blocks();
        assert!(used <= nblocks, "disk too small for its bitmap");

        {
            let mut data = disk.data.lock();
            let start = SUPERBLOCK as usize * BLKSIZE;
            data[start..start + Superblock::SIZE].copy_from_slice(&sb.to_bytes());

            let bitmap = &mut data[BITMAP_START as usize * BLKSIZE..];
            for blockno in used..nblocks {
                bitmap[blockno as usize / 8] |= 1 << (blockno % 8);
            }
        }
        log::debug!("formatted {nblocks} block disk");
        disk
    }

    /// Marks a block in use in the on-disk bitmap.
    pub fn allocate_block(&self, blockno: u32) {
        let mut data = self.data.lock();
        let byte = BITMAP_START as usize * BLKSIZE + blockno as usize / 8;
        data[byte] &= !(1 << (blockno % 8));
    }

    /// Returns a copy of a block's contents.
    pub fn block(&self, blockno: u32) -> Vec<u8> {
        let start = blockno as usize * BLKSIZE;
        self.data.lock()[start..start + BLKSIZE].to_vec()
    }

    fn range(&self, first: u32, len: usize) -> Result<core::ops::Range<usize>, DiskError> {
        if len % SECTSIZE != 0 {
            return Err(DiskError::PartialSector);
        }
        let start = first as usize * SECTSIZE;
        let end = start + len;
        if end > self.data.lock().len() {
            return Err(DiskError::OutOfRange { sector: first });
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemDisk {
    fn sectors(&self) -> u32 {
        (self.data.lock().len() / SECTSIZE) as u32
    }

    fn read_sectors(&mut self, first: u32, buf: &mut [u8]) -> Result<(), DiskError> {
        let range = self.range(first, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write_sectors(&mut self, first: u32, buf: &[u8]) -> Result<(), DiskError> {
        let range = self.range(first, buf.len())?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

//! Physical memory manager over the emulated frame arena.
//!
//! Every frame of emulated memory has a [`Frame`] record carrying its state
//! and reference count. Free frames sit on a LIFO free list, so the most
//! recently released frame is the next one handed out.

use core::fmt;

use alloc::vec::Vec;

use crate::{
    Frame, FrameFlag, FrameNumber, PhysicalAddress,
    arch::{self, EmulatedMemory},
};

/// Errors that can occur during physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is available.
    OutOfMemory,
    /// Attempted to release a frame that is not allocated or still referenced.
    InvalidDeallocation,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
            AllocError::InvalidDeallocation => write!(f, "invalid frame deallocation"),
        }
    }
}

/// Physical memory manager.
///
/// Owns the emulated physical memory and the metadata for every frame in it.
/// Frame 0 is reserved so that a zero physical address never names a usable
/// page.
pub struct PhysicalMemoryManager {
    memory: EmulatedMemory,
    frames: Vec<Frame>,
    free_list: Vec<FrameNumber>,
}

impl PhysicalMemoryManager {
    /// Creates a physical memory manager over `total_frames` frames of zeroed memory.
    ///
    /// # Panics
    /// Panics if fewer than two frames are requested.
    pub fn new(total_frames: usize) -> Self {
        assert!(total_frames >= 2, "physical memory needs at least two frames");

        let mut frames = Vec::with_capacity(total_frames);
        frames.resize_with(total_frames, Frame::default);
        frames[0].flags.set(FrameFlag::Reserved);

        // Lowest frames are handed out first.
        let free_list = (1..total_frames).rev().map(FrameNumber::new).collect();

        log::debug!("physical memory: {total_frames} frames");

        Self {
            memory: EmulatedMemory::new(total_frames),
            frames,
            free_list,
        }
    }

    /// Allocates a single frame with a reference count of zero.
    ///
    /// The caller is expected to take a reference (usually by mapping the
    /// frame) before anything else can release it.
    pub fn allocate(&mut self, zero: bool) -> Result<FrameNumber, AllocError> {
        let frame_num = self.free_list.pop().ok_or(AllocError::OutOfMemory)?;
        let frame = &mut self.frames[frame_num.as_usize()];
        debug_assert_eq!(frame.refcount(), 0);
        frame.flags.set(FrameFlag::Allocated);

        if zero {
            self.frame_bytes_mut(frame_num).fill(0);
        }

        log::trace!("allocated frame {frame_num}");
        Ok(frame_num)
    }

    /// Returns an unreferenced frame to the free list.
    pub fn deallocate(&mut self, frame_num: FrameNumber) -> Result<(), AllocError> {
        let frame = self
            .frames
            .get_mut(frame_num.as_usize())
            .ok_or(AllocError::InvalidDeallocation)?;
        if !frame.flags.test(FrameFlag::Allocated) || frame.refcount() != 0 {
            return Err(AllocError::InvalidDeallocation);
        }

        frame.flags.clear(FrameFlag::Allocated);
        frame.flags.clear(FrameFlag::PageTable);
        self.free_list.push(frame_num);
        log::trace!("freed frame {frame_num}");
        Ok(())
    }

    /// Takes a reference on an allocated frame.
    ///
    /// # Panics
    /// Panics if the frame is not allocated.
    pub fn incref(&mut self, frame_num: FrameNumber) {
        let frame = self.allocated_frame_mut(frame_num);
        frame.increment();
    }

    /// Drops a reference on a frame, freeing it when no references remain.
    ///
    /// Returns true if the frame was freed.
    ///
    /// # Panics
    /// Panics if the frame is not allocated or has no references.
    pub fn decref(&mut self, frame_num: FrameNumber) -> bool {
        let frame = self.allocated_frame_mut(frame_num);
        if frame.decrement() > 0 {
            return false;
        }

        frame.flags.clear(FrameFlag::Allocated);
        frame.flags.clear(FrameFlag::PageTable);
        self.free_list.push(frame_num);
        log::trace!("freed frame {frame_num}");
        true
    }

    /// Marks a frame as holding a page table.
    pub(crate) fn mark_page_table(&mut self, frame_num: FrameNumber) {
        self.allocated_frame_mut(frame_num)
            .flags
            .set(FrameFlag::PageTable);
    }

    /// Returns the reference count of a frame (zero for unknown frames).
    pub fn refcount(&self, frame_num: FrameNumber) -> u32 {
        self.frame(frame_num).map_or(0, Frame::refcount)
    }

    /// Returns the metadata for a frame.
    pub fn frame(&self, frame_num: FrameNumber) -> Option<&Frame> {
        self.frames.get(frame_num.as_usize())
    }

    /// Returns the number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.free_list.len()
    }

    /// Returns the number of frames managed, including reserved ones.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the contents of a frame.
    pub fn frame_bytes(&self, frame_num: FrameNumber) -> &[u8] {
        self.memory
            .slice(frame_num.start().as_usize(), arch::PAGE_SIZE)
    }

    /// Returns the mutable contents of a frame.
    pub fn frame_bytes_mut(&mut self, frame_num: FrameNumber) -> &mut [u8] {
        self.memory
            .slice_mut(frame_num.start().as_usize(), arch::PAGE_SIZE)
    }

    /// Returns `len` bytes of memory starting at `phys`.
    pub(crate) fn read(&self, phys: PhysicalAddress, len: usize) -> &[u8] {
        self.memory.slice(phys.as_usize(), len)
    }

    /// Returns `len` writable bytes of memory starting at `phys`.
    pub(crate) fn write(&mut self, phys: PhysicalAddress, len: usize) -> &mut [u8] {
        self.memory.slice_mut(phys.as_usize(), len)
    }

    pub(crate) fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut EmulatedMemory {
        &mut self.memory
    }

    fn allocated_frame_mut(&mut self, frame_num: FrameNumber) -> &mut Frame {
        let frame = self
            .frames
            .get_mut(frame_num.as_usize())
            .unwrap_or_else(|| panic!("frame {frame_num} out of range"));
        assert!(
            frame.flags.test(FrameFlag::Allocated),
            "frame {frame_num} is not allocated"
        );
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_frame_zero() {
        let pmm = PhysicalMemoryManager::new(8);
        assert_eq!(pmm.free_frames(), 7);
        assert_eq!(pmm.total_frames(), 8);
        assert!(pmm.frame(FrameNumber::new(0)).unwrap().flags.test(FrameFlag::Reserved));
    }

    #[test]
    fn allocates_lowest_frame_first() {
        let mut pmm = PhysicalMemoryManager::new(8);
        assert_eq!(pmm.allocate(false), Ok(FrameNumber::new(1)));
        assert_eq!(pmm.allocate(false), Ok(FrameNumber::new(2)));
        assert_eq!(pmm.free_frames(), 5);
    }

    #[test]
    fn reports_out_of_memory() {
        let mut pmm = PhysicalMemoryManager::new(2);
        assert!(pmm.allocate(false).is_ok());
        assert_eq!(pmm.allocate(false), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn zeroes_on_request() {
        let mut pmm = PhysicalMemoryManager::new(4);
        let frame = pmm.allocate(false).unwrap();
        pmm.frame_bytes_mut(frame).fill(0xAA);
        pmm.deallocate(frame).unwrap();

        let again = pmm.allocate(false).unwrap();
        assert_eq!(again, frame);
        assert_eq!(pmm.frame_bytes(again)[0], 0xAA);
        pmm.deallocate(again).unwrap();

        let zeroed = pmm.allocate(true).unwrap();
        assert!(pmm.frame_bytes(zeroed).iter().all(|&b| b == 0));
    }

    #[test]
    fn last_decref_frees() {
        let mut pmm = PhysicalMemoryManager::new(4);
        let frame = pmm.allocate(true).unwrap();
        pmm.incref(frame);
        pmm.incref(frame);
        assert_eq!(pmm.refcount(frame), 2);
        assert!(!pmm.decref(frame));
        assert!(pmm.decref(frame));
        assert_eq!(pmm.free_frames(), 3);
    }

    #[test]
    fn rejects_referenced_deallocation() {
        let mut pmm = PhysicalMemoryManager::new(4);
        let frame = pmm.allocate(true).unwrap();
        pmm.incref(frame);
        assert_eq!(pmm.deallocate(frame), Err(AllocError::InvalidDeallocation));
        assert_eq!(pmm.deallocate(FrameNumber::new(3)), Err(AllocError::InvalidDeallocation));
    }
}

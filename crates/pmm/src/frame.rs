/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`: the state bits plus the number of
/// mappings (page table entries or directory entries) that refer to the frame.
#[derive(Debug, Default)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    refcount: u32,
}

impl Frame {
    /// Returns the number of references held on this frame.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub(crate) fn increment(&mut self) {
        self.refcount = self
            .refcount
            .checked_add(1)
            .unwrap_or_else(|| panic!("frame reference count overflow"));
    }

    /// Drops one reference, returning the remaining count.
    pub(crate) fn decrement(&mut self) -> u32 {
        assert!(self.refcount > 0, "frame reference count underflow");
        self.refcount -= 1;
        self.refcount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame is reserved and should not be allocated.
    Reserved = 1 << 1,
    /// Frame holds a page directory or page table.
    PageTable = 1 << 2,
}

/// State bits for a physical memory frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Sets the given flag.
    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    /// Clears the given flag.
    pub fn clear(&mut self, flag: FrameFlag) {
        self.0 &= !(flag as u8);
    }

    /// Tests if the given flag is set.
    pub fn test(&self, flag: FrameFlag) -> bool {
        self.0 & flag as u8 != 0
    }

    /// Tests the given flag and sets it, returning the previous value.
    pub fn test_and_set(&mut self, flag: FrameFlag) -> bool {
        let old = self.test(flag);
        self.set(flag);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let mut flags = FrameFlags::new();
        assert!(!flags.test_and_set(FrameFlag::Allocated));
        assert!(flags.test_and_set(FrameFlag::Allocated));
        flags.set(FrameFlag::PageTable);
        flags.clear(FrameFlag::Allocated);
        assert!(!flags.test(FrameFlag::Allocated));
        assert!(flags.test(FrameFlag::PageTable));
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decrement_below_zero_panics() {
        Frame::default().decrement();
    }
}

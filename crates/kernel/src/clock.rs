//! Millisecond clock driven by the timer tick.

/// Monotonic millisecond counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Clock {
    ticks: u64,
    ms: u64,
}

impl Clock {
    pub const fn new() -> Self {
        Self { ticks: 0, ms: 0 }
    }

    /// Advances the clock by one timer tick of `tick_ms` milliseconds.
    pub fn tick(&mut self, tick_ms: u32) {
        self.ticks += 1;
        self.ms += u64::from(tick_ms);
    }

    /// Milliseconds since boot, truncated to the 31 bits a syscall can return.
    pub fn now_ms(&self) -> u32 {
        (self.ms & i32::MAX as u64) as u32
    }

    /// Number of ticks since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

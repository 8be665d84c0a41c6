//! The console device behind `cputs` and `cgetc`.

use alloc::{collections::VecDeque, string::String};

/// Console output buffer and pending keyboard input.
#[derive(Debug, Default)]
pub struct Console {
    output: String,
    input: VecDeque<u8>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text to the console.
    pub fn write(&mut self, bytes: &[u8]) {
        self.output.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Returns everything written so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Queues input characters.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied().filter(|&b| b != 0));
    }

    /// Takes one pending input character, or 0 if none is waiting.
    pub fn getc(&mut self) -> u8 {
        self.input.pop_front().unwrap_or(0)
    }
}

impl core::fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

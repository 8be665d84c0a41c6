//! Kernel log sink.
//!
//! Records from the `log` facade are formatted into a bounded ring of lines
//! that tests and the embedding host can read back with [`recent`].

use alloc::{collections::VecDeque, string::String, vec::Vec};
use core::fmt::Write;

use log::LevelFilter;
use spin::{Mutex, Once};

/// Number of lines kept in the ring.
const RING_LINES: usize = 512;

pub struct KernelLog {
    lines: Mutex<VecDeque<String>>,
}

static DEFAULT: Once<KernelLog> = Once::new();

impl KernelLog {
    /// Installs the kernel log as the global logger, once.
    ///
    /// Later calls only adjust the maximum level.
    pub fn init(level: LevelFilter) -> &'static Self {
        let mut installed = false;
        let log = DEFAULT.call_once(|| {
            installed = true;
            KernelLog::new()
        });
        if installed {
            log.install();
        }
        log::set_max_level(level);
        log
    }

    fn install(&'static self) {
        // Fails only if the embedding host installed its own logger first.
        let _ = log::set_logger(self);
    }

    fn new() -> Self {
        KernelLog {
            lines: Mutex::new(VecDeque::with_capacity(RING_LINES)),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == RING_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut line = String::new();
        if write_log_entry_to(&mut line, record).is_ok() {
            self.push(line);
        }
    }

    fn flush(&self) {}
}

/// Returns a copy of the most recent log lines, oldest first.
pub fn recent() -> Vec<String> {
    DEFAULT
        .get()
        .map(|log| log.lines.lock().iter().cloned().collect())
        .unwrap_or_default()
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return write!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return write!(writer, "[{:5}] {}", record.level(), record.args());
}

//! Boot-time debug logger.
//!
//! Formatted log lines are kept in a fixed-capacity in-memory ring until a
//! console is available to drain them to. Single-threaded environment; the
//! spinlock only guards against reentrancy through the `static`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use spin::Mutex;

const MAX_LOG_ENTRIES: usize = 512;

static LOG_BUFFER: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Append one line to the ring, dropping the oldest entry when full.
pub fn log(line: String) {
    let mut buffer = LOG_BUFFER.lock();
    if buffer.len() == MAX_LOG_ENTRIES {
        buffer.remove(0);
    }
    buffer.push(line);
}

/// Run `visit` over every buffered line in chronological order.
pub fn with_lines(mut visit: impl FnMut(&str)) {
    let buffer = LOG_BUFFER.lock();
    for line in buffer.iter() {
        visit(line);
    }
}

/// Number of buffered lines.
pub fn line_count() -> usize {
    LOG_BUFFER.lock().len()
}

/// Drop all buffered lines (after draining to the console).
pub fn clear() {
    LOG_BUFFER.lock().clear();
}

/// Render format arguments into an owned string (macro support).
pub fn format_line(args: core::fmt::Arguments) -> String {
    let mut line = String::new();
    let _ = line.write_fmt(args);
    line
}

/// Append one line tagged as an error (macro support).
pub fn log_error_line(mut line: String) {
    line.insert_str(0, "ERROR: ");
    log(line);
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log($crate::logger::format_line(core::format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log_error_line($crate::logger::format_line(core::format_args!(
            $($arg)*
        )))
    };
}

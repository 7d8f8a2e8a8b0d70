//! Ring buffer of recent log lines, captured into error reports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default maximum number of lines to keep
pub const DEFAULT_LOG_TAIL_LINES: usize = 1_000;

/// A shared ring buffer for log lines that caps memory usage by line count.
///
/// Clones share the same buffer, so the process logger can push into one
/// handle while the recovery coordinator reads from another.
#[derive(Debug, Clone)]
pub struct LogTail {
    inner: Arc<Mutex<Buffer>>,
}

#[derive(Debug)]
struct Buffer {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_TAIL_LINES)
    }
}

impl LogTail {
    /// Create a new buffer with the specified maximum line count.
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                lines: VecDeque::new(),
                max_lines,
            })),
        }
    }

    /// Push a line. If at capacity, drops the oldest line.
    pub fn push_line(&self, line: impl Into<String>) {
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        if buf.max_lines == 0 {
            return;
        }
        if buf.lines.len() >= buf.max_lines {
            buf.lines.pop_front();
        }
        buf.lines.push_back(line.into());
    }

    /// The most recent `n` lines, oldest first.
    pub fn recent(&self, n: usize) -> Vec<String> {
        let Ok(buf) = self.inner.lock() else {
            return Vec::new();
        };
        let skip = buf.lines.len().saturating_sub(n);
        buf.lines.iter().skip(skip).cloned().collect()
    }

    /// Current line count.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|buf| buf.lines.len()).unwrap_or(0)
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

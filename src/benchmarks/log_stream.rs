//! Per-backend diagnostic log.

use log::info;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One timestamped diagnostic line. `elapsed` is measured on the monotonic
/// clock from the last reset of the owning stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub elapsed: Duration,
    pub message: String,
}

struct LogBuffer {
    epoch: Instant,
    lines: Vec<LogLine>,
}

/// Append-only ordered log for one backend, reset at the start of every run.
///
/// Every line is mirrored to the `log` facade so it also shows up in the
/// process log.
pub struct LogStream {
    name: String,
    buffer: Mutex<LogBuffer>,
}

impl LogStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Mutex::new(LogBuffer {
                epoch: Instant::now(),
                lines: Vec::new(),
            }),
        }
    }

    /// Appends one line.
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {}", self.name, message);
        let mut buffer = self.lock();
        let elapsed = buffer.epoch.elapsed();
        buffer.lines.push(LogLine { elapsed, message });
    }

    /// Clears all lines and restarts the timestamp epoch.
    pub fn reset(&self) {
        let mut buffer = self.lock();
        buffer.lines.clear();
        buffer.epoch = Instant::now();
    }

    /// Snapshot of the current lines in append order.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lock().lines.clone()
    }

    /// Snapshot of the messages only.
    pub fn messages(&self) -> Vec<String> {
        self.lock()
            .lines
            .iter()
            .map(|line| line.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

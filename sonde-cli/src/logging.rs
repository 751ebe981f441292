//! Stderr rendering of pipeline log entries

use chrono::Utc;
use sonde_core::logging::{LogEntry, LogLevel, SignalLog};
use std::io::Write;

/// Renders collected pipeline log entries as timestamped stderr lines.
pub struct StderrLogger {
    min_level: LogLevel,
}

impl StderrLogger {
    pub fn new(verbosity: u8) -> Self {
        Self {
            min_level: LogLevel::from_verbosity(verbosity),
        }
    }

    fn render(&self, entry: &LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "[{}] {:5} {}: {}",
            Utc::now().format("%H:%M:%S%.3f"),
            entry.level.to_string(),
            entry.subsystem,
            entry.message
        );
    }

    /// Drain and render everything the pipeline has collected so far.
    pub fn drain(&self, log: &mut SignalLog) {
        for entry in log.take_entries() {
            self.render(&entry);
        }
    }
}

//! Structured logging for the scanner pipeline
//!
//! The pipeline writes through a collector so that both the CLI and library
//! consumers can decide how entries are rendered. Verbosity `-v/-vv/-vvv`
//! maps to Info/Debug/Trace.

use std::fmt;

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogLevel {
    /// Map a `-v` count (0..=3) to the minimum recorded level.
    pub fn from_verbosity(v: u8) -> Self {
        match v {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to record
    pub level: LogLevel,

    /// Enable logging for specific subsystems
    pub enable_source: bool,
    pub enable_dsp: bool,
    pub enable_detect: bool,
    pub enable_frame: bool,
    pub enable_ecc: bool,

    /// Maximum number of entries to keep
    pub max_entries: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_source: true,
            enable_dsp: true,
            enable_detect: true,
            enable_frame: true,
            enable_ecc: true,
            max_entries: 1000,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            max_entries: 5000,
            ..Self::default()
        }
    }

    /// Quiet logging for production
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Warn,
            enable_source: false,
            enable_dsp: false,
            enable_detect: false,
            enable_frame: false,
            enable_ecc: false,
            max_entries: 100,
        }
    }
}

/// A single log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub subsystem: &'static str,
    pub message: String,
}

/// Logger that collects structured log entries
#[derive(Debug, Clone)]
pub struct SignalLog {
    config: LogConfig,
    entries: Vec<LogEntry>,
}

impl SignalLog {
    pub fn new(config: LogConfig) -> Self {
        let capacity = config.max_entries.min(1000);
        Self {
            config,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn subsystem_enabled(&self, subsystem: &str) -> bool {
        match subsystem {
            "source" => self.config.enable_source,
            "dsp" => self.config.enable_dsp,
            "detect" => self.config.enable_detect,
            "frame" => self.config.enable_frame,
            "ecc" => self.config.enable_ecc,
            _ => true,
        }
    }

    pub fn log(&mut self, level: LogLevel, subsystem: &'static str, message: impl Into<String>) {
        if level < self.config.level || !self.subsystem_enabled(subsystem) {
            return;
        }
        if self.entries.len() >= self.config.max_entries {
            self.entries.remove(0);
        }
        self.entries.push(LogEntry {
            level,
            subsystem,
            message: message.into(),
        });
    }

    pub fn info(&mut self, subsystem: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Info, subsystem, message);
    }

    pub fn debug(&mut self, subsystem: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Debug, subsystem, message);
    }

    pub fn warn(&mut self, subsystem: &'static str, message: impl Into<String>) {
        self.log(LogLevel::Warn, subsystem, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Drain collected entries, oldest first.
    pub fn take_entries(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries)
    }
}

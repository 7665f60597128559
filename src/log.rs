//! Injected logging interface.
//!
//! Components never log through ambient state; each one holds an
//! `Arc<dyn PatchLog>` handed to it at construction. [`TracingLog`] forwards
//! to `tracing`, [`MemoryLog`] captures records so tests can assert on them.

use parking_lot::Mutex;
use std::sync::Arc;
pub use tracing::Level;

pub trait PatchLog: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

pub type SharedLog = Arc<dyn PatchLog>;

/// Convenience methods over any [`PatchLog`].
pub trait PatchLogExt {
    fn debug(&self, message: impl AsRef<str>);
    fn info(&self, message: impl AsRef<str>);
    fn warn(&self, message: impl AsRef<str>);
    fn error(&self, message: impl AsRef<str>);
}

impl<L: PatchLog + ?Sized> PatchLogExt for L {
    fn debug(&self, message: impl AsRef<str>) {
        self.log(Level::DEBUG, message.as_ref());
    }

    fn info(&self, message: impl AsRef<str>) {
        self.log(Level::INFO, message.as_ref());
    }

    fn warn(&self, message: impl AsRef<str>) {
        self.log(Level::WARN, message.as_ref());
    }

    fn error(&self, message: impl AsRef<str>) {
        self.log(Level::ERROR, message.as_ref());
    }
}

/// Forwards records to `tracing` under the `bundle_patcher` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl TracingLog {
    pub fn shared() -> SharedLog {
        Arc::new(TracingLog)
    }
}

impl PatchLog for TracingLog {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "bundle_patcher", "{message}"),
            Level::WARN => tracing::warn!(target: "bundle_patcher", "{message}"),
            Level::INFO => tracing::info!(target: "bundle_patcher", "{message}"),
            Level::DEBUG => tracing::debug!(target: "bundle_patcher", "{message}"),
            _ => tracing::trace!(target: "bundle_patcher", "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl NullLog {
    pub fn shared() -> SharedLog {
        Arc::new(NullLog)
    }
}

impl PatchLog for NullLog {
    fn log(&self, _level: Level, _message: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records at `level` whose message contains `needle`.
    pub fn find(&self, level: Level, needle: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level && r.message.contains(needle))
            .map(|r| r.message.clone())
            .collect()
    }
}

impl PatchLog for MemoryLog {
    fn log(&self, level: Level, message: &str) {
        self.records.lock().push(LogRecord {
            level,
            message: message.to_string(),
        });
    }
}

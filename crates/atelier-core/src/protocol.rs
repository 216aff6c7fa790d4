//! Progress reporting contract between the engine and its callers.
//!
//! The engine never writes to stdout or a logger; it hands structured
//! [`LogEntry`] values to a caller-supplied [`ProgressSink`]. Callers render
//! them however they like (UI stream, job log, test capture).

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    /// Which part of the pipeline emitted this (e.g. "gateway", "repair").
    pub role: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    fn new(level: LogLevel, role: &str, message: impl Into<String>) -> Self {
        Self { level, role: role.to_string(), message: message.into(), at: Utc::now() }
    }

    pub fn info(role: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, role, message)
    }

    pub fn success(role: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, role, message)
    }

    pub fn warn(role: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, role, message)
    }

    pub fn error(role: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, role, message)
    }
}

/// Receiver for engine progress entries.
pub trait ProgressSink: Send + Sync {
    fn accept(&self, entry: LogEntry);
}

impl<F> ProgressSink for F
where
    F: Fn(LogEntry) + Send + Sync,
{
    fn accept(&self, entry: LogEntry) {
        self(entry)
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn accept(&self, _entry: LogEntry) {}
}

//! Bounded per-instance log retention

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of entries retained per instance
pub const DEFAULT_LOG_BUFFER_LINES: usize = 1000;

/// Where a log entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    /// Captured from the child's stdout
    Stdout,
    /// Captured from the child's stderr
    Stderr,
    /// Generated by the supervisor itself (start, stop, exit, errors)
    System,
}

impl LogChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Stdout => "stdout",
            LogChannel::Stderr => "stderr",
            LogChannel::System => "system",
        }
    }
}

/// A single retained line of output or supervisor notice
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: LogChannel,
    pub message: String,
}

impl LogEntry {
    /// Create an entry stamped now, trimming trailing whitespace from the message
    pub fn new(channel: LogChannel, message: impl AsRef<str>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            message: message.as_ref().trim_end().to_string(),
        }
    }
}

/// Ring of the most recent log entries for one instance.
///
/// Entries are kept in append order; once `capacity` is exceeded the oldest
/// entries are discarded first.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER_LINES)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// The last `limit` entries in append order, or everything when `limit` is None
    pub fn tail(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let skip = limit
            .map(|limit| self.entries.len().saturating_sub(limit))
            .unwrap_or(0);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Shared types for bootlog
//!
//! This crate contains the value types passed between the buffer, the module
//! index and the flusher, plus the two line formats written to the sink.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeSet;

/// Maximum byte length of a module name
pub const MAX_MODULE_NAME_LEN: usize = 256;

/// Maximum byte length of a message
pub const MAX_CONTENT_LEN: usize = 512;

/// Timestamp layout used in log lines
pub const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Log Types
// ============================================================================

/// A single buffered log entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Wall-clock time of recording
    pub timestamp: DateTime<Utc>,

    /// Owning module name
    pub module: String,

    /// Whole seconds since the module's first entry
    pub seconds_from_first: u64,

    /// Rendered message text
    pub content: String,
}

impl LogEntry {
    /// Create a new entry, truncating the module name and content to their bounds
    pub fn new(
        timestamp: DateTime<Utc>,
        module: &str,
        seconds_from_first: u64,
        content: &str,
    ) -> Self {
        Self {
            timestamp,
            module: truncate(module, MAX_MODULE_NAME_LEN).to_string(),
            seconds_from_first,
            content: truncate(content, MAX_CONTENT_LEN).to_string(),
        }
    }

    /// Format as `[<timestamp>][<module>][<seconds_from_first>]<content>`
    pub fn to_line(&self) -> String {
        format!(
            "[{}][{}][{}]{}",
            self.timestamp.format(LINE_TIMESTAMP_FORMAT),
            self.module,
            self.seconds_from_first,
            self.content
        )
    }
}

// ============================================================================
// Module Types
// ============================================================================

/// Timing and dependency metadata for one module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Declared dependencies; only ever grows
    pub dependencies: BTreeSet<String>,
}

impl ModuleRecord {
    /// Create a record for a module seen for the first time at `at`
    pub fn new(name: String, at: DateTime<Utc>) -> Self {
        Self {
            name,
            first_seen: at,
            last_seen: at,
            dependencies: BTreeSet::new(),
        }
    }

    /// Elapsed time between first and last activity, in fractional seconds
    pub fn elapsed_seconds(&self) -> f64 {
        let elapsed = self.last_seen - self.first_seen;
        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Dependency names joined by commas
    pub fn dependency_list(&self) -> String {
        self.dependencies
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Format as `[<name>][<first>][<last>][<elapsed>]<deps>`
    pub fn to_report_line(&self) -> String {
        format!(
            "[{}][{}][{}][{:.2}]{}",
            self.name,
            self.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.last_seen.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.elapsed_seconds(),
            self.dependency_list()
        )
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Truncate `s` to at most `max` bytes without splitting a UTF-8 character
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut idx = max;
    // Walk backwards to find a valid char boundary
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    &s[..idx]
}

/// Split a comma-separated dependency string into individual names
///
/// Surrounding whitespace is trimmed and empty pieces are skipped.
pub fn split_dependencies(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|name| !name.is_empty())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AggregatorError, Result};

/// Default number of buffered entries
pub const DEFAULT_CAPACITY: usize = 500;

/// Default timer-driven flush interval
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Default sink destination
pub const DEFAULT_SINK_PATH: &str = "./boot.log";

/// Aggregator settings, loadable from TOML
///
/// ```toml
/// capacity = 500
/// flush_threshold = 250
/// flush_interval_ms = 1000
/// sink_path = "./boot.log"
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Buffer capacity
    pub capacity: usize,

    /// Occupancy that wakes the flusher (defaults to half the capacity)
    pub flush_threshold: Option<usize>,

    /// Timer-driven flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// File the default sink appends to
    pub sink_path: PathBuf,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            flush_threshold: None,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            sink_path: PathBuf::from(DEFAULT_SINK_PATH),
        }
    }
}

impl AggregatorConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = Some(threshold);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_sink_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink_path = path.into();
        self
    }

    /// Effective flush threshold
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold.unwrap_or_else(|| (self.capacity / 2).max(1))
    }

    /// Effective flush interval
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Reject values the buffer and timer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(AggregatorError::InvalidConfig(
                "capacity must be greater than zero".to_string(),
            ));
        }
        let threshold = self.flush_threshold();
        if threshold == 0 || threshold > self.capacity {
            return Err(AggregatorError::InvalidConfig(format!(
                "flush threshold {} must be between 1 and capacity {}",
                threshold, self.capacity
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(AggregatorError::InvalidConfig(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

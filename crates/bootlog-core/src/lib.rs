//! Log aggregation engine for bootlog
//!
//! This crate provides the bounded entry buffer, the per-module index, the
//! background flusher and the [`Aggregator`] facade tying them together.

mod aggregator;
mod buffer;
mod config;
mod error;
mod flusher;
mod index;
mod sink;

pub use aggregator::{Aggregator, AggregatorStats};
pub use buffer::{Batch, EntryBuffer};
pub use config::{
    AggregatorConfig, DEFAULT_CAPACITY, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_SINK_PATH,
};
pub use error::{AggregatorError, Result};
pub use flusher::{Flusher, FlusherHandle, FlusherState};
pub use index::ModuleIndex;
pub use sink::{FileSink, MemorySink, Sink};

// Re-export types used in our public API
pub use bootlog_types::{LogEntry, ModuleRecord};

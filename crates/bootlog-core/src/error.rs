use std::io;

use thiserror::Error;

/// Errors surfaced by the aggregator
///
/// Buffer overflow is deliberately absent: a full buffer evicts its oldest
/// entry and bumps a counter instead of failing the producer.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The aggregator was shut down
    #[error("aggregator is closed")]
    Closed,

    /// The sink could not be opened or written; entries stay buffered
    #[error("sink unavailable: {0}")]
    SinkUnavailable(#[source] io::Error),

    /// Configuration values are out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The flusher task or one of its blocking writes panicked
    #[error("flusher task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    /// Config file could not be parsed
    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),

    /// Config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

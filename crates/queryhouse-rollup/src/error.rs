//! Error types for rollup planning and loading

use queryhouse_core::CoreError;
use queryhouse_orchestrator::QueueError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RollupError>;

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("{table}: more than {max} partitions requested")]
    TooManyPartitions { table: String, max: usize },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Every partition of the requested range failed to build
    #[error("No partitions of {table} available: {reason}")]
    NoPartitionsAvailable { table: String, reason: String },

    #[error("Source query of {rollup} returned {limit} or more rows")]
    SourceRowLimit { rollup: String, limit: usize },

    #[error("Partition store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

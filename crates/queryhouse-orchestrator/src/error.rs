//! Error types for the query queue

use queryhouse_core::{CoreError, DriverError, HandlerKind};
use queryhouse_queue::{QueueDriverError, StoredError, StoredErrorKind};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue driver error: {0}")]
    Driver(#[from] QueueDriverError),

    /// The handler failed; every waiter of the key receives the same message
    #[error("Query failed: {0}")]
    Handler(String),

    #[error("Query {key} did not finish within {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Query orphaned: {0}")]
    Orphaned(String),

    #[error("Query cancelled: {0}")]
    Cancelled(String),

    #[error("Priority {0} outside [-10000, 10000]")]
    InvalidPriority(i32),

    #[error("No handler registered for {0}")]
    UnknownHandler(HandlerKind),

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl QueueError {
    /// Error delivered to a waiter for a stored failure outcome.
    pub fn from_stored(key: &str, stored: StoredError, timeout: Duration) -> Self {
        match stored.kind {
            StoredErrorKind::Handler => QueueError::Handler(stored.message),
            StoredErrorKind::Timeout => QueueError::Timeout {
                key: key.to_string(),
                timeout,
            },
            StoredErrorKind::Cancelled => QueueError::Cancelled(stored.message),
            StoredErrorKind::Orphaned => QueueError::Orphaned(stored.message),
        }
    }
}

/// Failure raised by a [`QueryHandler`](crate::QueryHandler).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("{0}")]
    Failed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

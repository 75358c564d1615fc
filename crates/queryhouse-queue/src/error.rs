//! Queue Driver Error Types
//!
//! ## Error Categories
//!
//! ### Backend Errors
//! - `Database`: SQLite operation failed (lock contention, I/O, constraint)
//! - `Unavailable`: Backend temporarily unreachable
//! - `Closed`: Connection pool was shut down
//! - `Migration`: Schema could not be created or upgraded
//!
//! ### Data Errors
//! - `Serialization`: Payload or outcome JSON could not be (de)serialized
//! - `InvalidData`: A stored column holds a value this version does not understand
//!
//! Drivers never retry. Callers decide with [`QueueDriverError::is_retryable`]:
//!
//! ```ignore
//! match driver.add_to_queue(entry).await {
//!     Err(e) if e.is_retryable() => { /* back off and try again */ }
//!     other => other?,
//! }
//! ```

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueDriverError>;

#[derive(Debug, Error)]
pub enum QueueDriverError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Queue driver closed")]
    Closed,

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl QueueDriverError {
    /// Transport and lock failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueDriverError::Unavailable(_) => true,
            QueueDriverError::Database(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Database(db) => {
                    // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                    let code = db.code().and_then(|c| c.parse::<i32>().ok()).unwrap_or(0);
                    matches!(code & 0xff, 5 | 6)
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<sqlx::Error> for QueueDriverError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolClosed => QueueDriverError::Closed,
            other => QueueDriverError::Database(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for QueueDriverError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        QueueDriverError::Migration(e.to_string())
    }
}

impl From<queryhouse_core::CoreError> for QueueDriverError {
    fn from(e: queryhouse_core::CoreError) -> Self {
        QueueDriverError::InvalidData(e.to_string())
    }
}

//! Error Types for QueryHouse Core
//!
//! ## Error Categories
//!
//! ### Model Errors
//! - `InvalidGranularity`: Unknown granularity name (e.g. "decade")
//! - `InvalidTimezone`: Timezone name not present in the IANA database
//! - `InvalidTimestamp`: Timestamp string in an unsupported format
//! - `InvalidRange`: Range whose start is after its end
//! - `UnknownHandler`: Handler kind name read back from storage is unknown
//!
//! ### Fingerprint Errors
//! - `Serialization`: Key material could not be serialized for hashing
//!
//! Backend failures are reported separately through [`DriverError`] so the
//! queue can store them as handler failures verbatim.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unsupported granularity: {0}")]
    InvalidGranularity(String),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid range: {start} is after {end}")]
    InvalidRange { start: String, end: String },

    #[error("Unknown handler kind: {0}")]
    UnknownHandler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by a backend database driver.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Query cancelled")]
    Cancelled,
}

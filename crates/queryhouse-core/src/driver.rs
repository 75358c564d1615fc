//! Backend database driver collaborator.
//!
//! The queue never talks to a warehouse directly. Handlers receive a
//! [`Driver`] for their data source and execute compiled SQL through it.

use crate::error::DriverError;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

pub type Rows = Vec<Row>;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Execute SQL with positional parameters and return all rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Rows, DriverError>;

    /// Cheap round trip used to check the backend is reachable.
    async fn test_connection(&self) -> Result<(), DriverError>;
}

//! QueryHouse Core
//!
//! Types shared by the queue, the orchestrator and the rollup planner.
//!
//! - [`CompiledQuery`] and its [`QueryKey`] fingerprint, which identifies
//!   identical queries across processes
//! - [`HandlerKind`]: what a queue entry does when it runs
//! - [`RollupDefinition`], [`RefreshKey`], [`Granularity`] and [`TimeRange`]
//!   (half-open, wall-clock time in the rollup's timezone)
//! - [`Driver`]: the data source a query runs against
//! - [`time`]: local/UTC conversion and timestamp formatting
//!
//! ```
//! use queryhouse_core::{CompiledQuery, Granularity, TimeRange};
//! use serde_json::json;
//!
//! let a = CompiledQuery::new("warehouse", "SELECT 1 WHERE x = ?", vec![json!(1)]);
//! let b = CompiledQuery::new("warehouse", "SELECT 1 WHERE x = ?", vec![json!(1)]);
//! assert_eq!(a.query_key().unwrap(), b.query_key().unwrap());
//!
//! let january = TimeRange::parse("2024-01-01", "2024-02-01").unwrap();
//! let bucket = Granularity::Month.bucket_of(january.start);
//! assert_eq!(bucket, january);
//! ```

pub mod driver;
pub mod error;
pub mod query;
pub mod rollup;
pub mod time;

pub use driver::{Driver, Row, Rows};
pub use error::{CoreError, DriverError, Result};
pub use query::{BuildTarget, CompiledQuery, HandlerKind, QueryKey};
pub use rollup::{Granularity, RefreshKey, RollupDefinition, TimeRange};

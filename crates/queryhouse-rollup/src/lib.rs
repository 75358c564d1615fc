//! QueryHouse Rollups
//!
//! Partitioned pre-aggregations built and refreshed through the query queue.
//!
//! ## Components
//!
//! - [`planner`]: splits a requested range into calendar-aligned partitions
//! - [`refresh`]: refresh key evaluation and staleness rules
//! - [`store`]: built partition versions, swapped in atomically
//! - [`orchestrator`]: loads the partitions of a rollup, building stale ones
//!   through the data source's queue
//! - [`lambda`]: serves a range from built partitions plus a live source tail
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────────────────┐
//! │  LambdaExecutor  │────►│ PreAggregationOrchestrator │
//! └────────┬─────────┘     └─────┬──────────────┬───────┘
//!          │ Query               │ RefreshKey   │ latest_version
//!          │                     │ BuildRange   ▼
//!          │                     │ Build   ┌──────────────────┐
//!          ▼                     ▼         │  PartitionStore  │
//! ┌─────────────────────────────────────┐  └──────────────────┘
//! │          QueryOrchestrator          │           ▲
//! │  (one QueryQueue per data source)   │───────────┘ PartitionBuildHandler
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use queryhouse_rollup::{
//!     rollup_handlers, LoadOptions, MemoryPartitionStore, PreAggregationOrchestrator,
//!     RollupConfig,
//! };
//!
//! let store = Arc::new(MemoryPartitionStore::new(driver.clone()));
//! let handler_store = store.clone();
//! let queries = Arc::new(QueryOrchestrator::new(
//!     QueueConfig::from_env(),
//!     Arc::new(move |_: &str| rollup_handlers(driver.clone(), handler_store.clone())),
//! ));
//!
//! let rollups = PreAggregationOrchestrator::new(queries, store, RollupConfig::from_env());
//! let loaded = rollups.load(&rollup, &requested, LoadOptions::default()).await?;
//! let table = loaded.target_table_sql();
//! ```

pub mod config;
pub mod error;
pub mod lambda;
pub mod orchestrator;
pub mod planner;
pub mod refresh;
pub mod store;

pub use config::RollupConfig;
pub use error::{Result, RollupError};
pub use lambda::{LambdaExecutor, LambdaQuery, LambdaResult, LambdaSegment, OrderBy};
pub use orchestrator::{
    rollup_handlers, union_tables, LoadOptions, LoadResult, LoadedPartition, PartitionBuildHandler,
    PartitionFailure, PreAggregationOrchestrator,
};
pub use planner::{
    intersect_ranges, partition_table_name, plan_partitions, plan_partitions_with_limit,
    replace_partition_params, time_series, PartitionDescriptor, FROM_PARTITION_RANGE,
    MAX_SOURCE_ROW_LIMIT, TO_PARTITION_RANGE,
};
pub use refresh::StaleReason;
pub use store::{MemoryPartitionStore, PartitionStore, VersionEntry};

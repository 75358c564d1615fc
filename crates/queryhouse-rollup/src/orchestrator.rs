//! Pre-Aggregation Orchestrator
//!
//! Brings the partitions of a rollup that serve a requested range up to
//! date.
//!
//! ## Load Flow
//!
//! ```text
//! load(rollup, requested)
//!   ├─ resolve build range      explicit | BuildRange queries | now
//!   ├─ plan partitions          planner::plan_partitions_with_limit
//!   └─ per partition, concurrently
//!        ├─ latest version      PartitionStore::latest_version
//!        ├─ update window?      keep immutable partitions as they are
//!        ├─ refresh key values  every / sql
//!        └─ stale? build        PreAggregationBuild through the queue
//! ```
//!
//! Builds go through the data source's [`QueryQueue`](queryhouse_orchestrator::QueryQueue)
//! keyed by `(partition table, load range, refresh key values)`, so
//! concurrent loads of the same partition share one build, across processes
//! when the queue driver is shared. Stored queue outcomes are not reused for
//! builds; the partition store is the only record of what was built.
//!
//! A failed partition does not fail the load: it is reported in
//! [`LoadResult::failed`] and the remaining partitions are still served.

use crate::config::RollupConfig;
use crate::error::{Result, RollupError};
use crate::planner::{
    plan_partitions_with_limit, replace_partition_params, replace_partition_placeholders,
    PartitionDescriptor,
};
use crate::refresh::{
    first_value, outside_update_window, refresh_key_values, staleness, StaleReason,
};
use crate::store::{PartitionStore, VersionEntry};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use futures::future::join_all;
use queryhouse_core::time::{parse_utc, utc_to_local};
use queryhouse_core::{
    BuildTarget, CompiledQuery, Driver, HandlerKind, QueryKey, RollupDefinition, TimeRange,
};
use queryhouse_observability::metrics::PARTITION_BUILDS_TOTAL;
use queryhouse_orchestrator::{
    DriverQueryHandler, ExecuteOptions, HandlerError, HandlerRegistry, QueryHandler,
    QueryOrchestrator,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call options of [`PreAggregationOrchestrator::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Rebuild every planned partition, ignoring built versions
    pub force_build: bool,

    /// Evaluation time of refresh keys and the update window
    pub now: Option<DateTime<Utc>>,

    pub request_id: Option<String>,
}

/// A partition ready to be queried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedPartition {
    pub descriptor: PartitionDescriptor,
    pub version: VersionEntry,
    /// Built by this load rather than reused
    pub rebuilt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionFailure {
    pub descriptor: PartitionDescriptor,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub table_name: String,
    pub build_range: TimeRange,
    /// Loaded partitions in range order
    pub partitions: Vec<LoadedPartition>,
    pub failed: Vec<PartitionFailure>,
}

impl LoadResult {
    /// Table expression over every loaded partition.
    pub fn target_table_sql(&self) -> Option<String> {
        union_tables(self.partitions.iter().map(|p| p.descriptor.partition_table_name.as_str()))
    }

    /// End of the contiguous run of sealed partitions starting at `from`,
    /// and those partitions.
    ///
    /// Failed or still open partitions end the run; everything from the
    /// returned boundary on has to come from the source.
    pub fn sealed_prefix(&self, from: NaiveDateTime) -> (NaiveDateTime, Vec<&LoadedPartition>) {
        let mut prefix = Vec::new();
        if self.partitions.is_empty() {
            return (from, prefix);
        }

        let mut boundary = from.max(self.build_range.start);
        for partition in &self.partitions {
            let range = &partition.descriptor.range;
            if range.start > boundary || !partition.descriptor.is_sealed() {
                break;
            }
            boundary = boundary.max(range.end);
            prefix.push(partition);
        }

        if prefix.is_empty() {
            return (from, prefix);
        }
        (boundary, prefix)
    }
}

/// `table` for one table, a `UNION ALL` subquery for several.
pub fn union_tables<'a>(tables: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let tables: Vec<&str> = tables.into_iter().collect();
    match tables.as_slice() {
        [] => None,
        [single] => Some(single.to_string()),
        many => Some(format!(
            "({})",
            many.iter()
                .map(|t| format!("SELECT * FROM {}", t))
                .collect::<Vec<_>>()
                .join(" UNION ALL ")
        )),
    }
}

pub struct PreAggregationOrchestrator {
    queries: Arc<QueryOrchestrator>,
    store: Arc<dyn PartitionStore>,
    config: RollupConfig,
}

impl PreAggregationOrchestrator {
    pub fn new(
        queries: Arc<QueryOrchestrator>,
        store: Arc<dyn PartitionStore>,
        config: RollupConfig,
    ) -> Self {
        Self {
            queries,
            store,
            config,
        }
    }

    pub fn queries(&self) -> &Arc<QueryOrchestrator> {
        &self.queries
    }

    pub fn store(&self) -> &Arc<dyn PartitionStore> {
        &self.store
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Make the partitions of `rollup` serving `requested` available.
    ///
    /// `requested` is in local time of the rollup's timezone. A request
    /// outside the build range loads nothing and succeeds.
    ///
    /// # Errors
    ///
    /// - `NoPartitionsAvailable` when every planned partition failed
    /// - `TooManyPartitions` from planning
    /// - `Queue` when resolving the build range failed
    pub async fn load(
        &self,
        rollup: &RollupDefinition,
        requested: &TimeRange,
        options: LoadOptions,
    ) -> Result<LoadResult> {
        let tz = rollup.tz()?;
        let now = options.now.unwrap_or_else(Utc::now);
        let build_range = self.resolve_build_range(rollup, now, &options).await?;

        let planned = plan_partitions_with_limit(
            &rollup.table_name,
            requested,
            &build_range,
            rollup.partition_granularity,
            tz,
            self.config.max_partitions,
        )?;

        debug!(
            rollup = %rollup.name,
            requested = %requested,
            build_range = %build_range,
            partitions = planned.len(),
            "Planned partitions"
        );

        let outcomes = join_all(
            planned
                .iter()
                .map(|partition| self.load_partition(rollup, partition, now, &options)),
        )
        .await;

        let mut result = LoadResult {
            table_name: rollup.table_name.clone(),
            build_range,
            partitions: Vec::new(),
            failed: Vec::new(),
        };

        for (descriptor, outcome) in planned.into_iter().zip(outcomes) {
            match outcome {
                Ok(loaded) => result.partitions.push(loaded),
                Err(e) => {
                    PARTITION_BUILDS_TOTAL
                        .with_label_values(&[rollup.table_name.as_str(), "failed"])
                        .inc();
                    warn!(
                        rollup = %rollup.name,
                        partition = %descriptor.partition_table_name,
                        error = %e,
                        "Partition load failed"
                    );
                    result.failed.push(PartitionFailure {
                        descriptor,
                        error: e.to_string(),
                    });
                }
            }
        }

        if result.partitions.is_empty() {
            if let Some(failure) = result.failed.first() {
                return Err(RollupError::NoPartitionsAvailable {
                    table: rollup.table_name.clone(),
                    reason: failure.error.clone(),
                });
            }
        }

        info!(
            rollup = %rollup.name,
            loaded = result.partitions.len(),
            rebuilt = result.partitions.iter().filter(|p| p.rebuilt).count(),
            failed = result.failed.len(),
            "Rollup loaded"
        );

        Ok(result)
    }

    async fn load_partition(
        &self,
        rollup: &RollupDefinition,
        partition: &PartitionDescriptor,
        now: DateTime<Utc>,
        options: &LoadOptions,
    ) -> Result<LoadedPartition> {
        let latest = self
            .store
            .latest_version(&partition.partition_table_name)
            .await?;

        if let Some(version) = &latest {
            if !options.force_build && outside_update_window(&rollup.refresh_key, partition, now) {
                return Ok(self.fresh(rollup, partition, version.clone()));
            }
        }

        let values = refresh_key_values(
            &self.queries,
            rollup,
            partition,
            now,
            options.request_id.clone(),
        )
        .await?;

        let target = BuildTarget {
            table_name: rollup.table_name.clone(),
            partition_table_name: partition.partition_table_name.clone(),
            load_range: partition.load_range,
            sealed: partition.is_sealed(),
            refresh_key_values: values,
        };

        let reason = match latest {
            None => StaleReason::Missing,
            Some(version) => match staleness(&version, &target, options.force_build) {
                Some(reason) => reason,
                None => return Ok(self.fresh(rollup, partition, version)),
            },
        };

        info!(
            rollup = %rollup.name,
            partition = %partition.partition_table_name,
            reason = %reason,
            "Building partition"
        );

        let key = QueryKey::of(&(
            &target.partition_table_name,
            &target.load_range,
            &target.refresh_key_values,
        ))?;
        let payload = build_payload(rollup, partition, target);
        let value = self
            .queries
            .execute_with_key(
                HandlerKind::PreAggregationBuild,
                key,
                payload,
                rollup.priority.unwrap_or(0),
                ExecuteOptions {
                    request_id: options.request_id.clone(),
                    force_build: true,
                    ..Default::default()
                },
            )
            .await?;
        let version: VersionEntry = serde_json::from_value(value)?;

        PARTITION_BUILDS_TOTAL
            .with_label_values(&[rollup.table_name.as_str(), "built"])
            .inc();

        Ok(LoadedPartition {
            descriptor: partition.clone(),
            version,
            rebuilt: true,
        })
    }

    fn fresh(
        &self,
        rollup: &RollupDefinition,
        partition: &PartitionDescriptor,
        version: VersionEntry,
    ) -> LoadedPartition {
        PARTITION_BUILDS_TOTAL
            .with_label_values(&[rollup.table_name.as_str(), "fresh"])
            .inc();
        LoadedPartition {
            descriptor: partition.clone(),
            version,
            rebuilt: false,
        }
    }

    /// Build range of `rollup` at `now`, in local time.
    ///
    /// Range queries return the first and last source timestamps. The end
    /// is moved past the last timestamp so its rows are included. When a
    /// query returns nothing the other bound is used for both, and when
    /// both are empty the range is the instant `now`.
    pub async fn resolve_build_range(
        &self,
        rollup: &RollupDefinition,
        now: DateTime<Utc>,
        options: &LoadOptions,
    ) -> Result<TimeRange> {
        if let Some(range) = rollup.build_range {
            return Ok(range);
        }

        let tz = rollup.tz()?;
        let now_local = utc_to_local(now, tz);
        let Some((start_query, end_query)) = &rollup.build_range_queries else {
            return Ok(TimeRange {
                start: now_local,
                end: now_local,
            });
        };

        let priority = rollup.priority.unwrap_or(0);
        let (start, end) = tokio::try_join!(
            self.range_bound(start_query, priority, options),
            self.range_bound(end_query, priority, options),
        )?;

        let start = start.map(|t| utc_to_local(t, tz));
        let end = end.map(|t| utc_to_local(t, tz) + ChronoDuration::milliseconds(1));
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) => (start, end),
            (Some(start), None) => (start, start),
            (None, Some(end)) => (end, end),
            (None, None) => (now_local, now_local),
        };

        let range = TimeRange::new(start, end.max(start))?;
        debug!(rollup = %rollup.name, build_range = %range, "Resolved build range");
        Ok(range)
    }

    async fn range_bound(
        &self,
        query: &CompiledQuery,
        priority: i32,
        options: &LoadOptions,
    ) -> Result<Option<DateTime<Utc>>> {
        let rows = self
            .queries
            .execute(
                HandlerKind::BuildRange,
                query.clone(),
                priority,
                ExecuteOptions {
                    request_id: options.request_id.clone(),
                    force_build: true,
                    ..Default::default()
                },
            )
            .await?;

        match first_value(&rows) {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(parse_utc(&s)?)),
            other => Err(RollupError::InvalidRange(format!(
                "build range query returned {}",
                other
            ))),
        }
    }
}

fn build_payload(
    rollup: &RollupDefinition,
    partition: &PartitionDescriptor,
    target: BuildTarget,
) -> CompiledQuery {
    let (from, to) = partition.load_range_params();
    let load = &rollup.load_query;
    CompiledQuery {
        data_source: load.data_source.clone(),
        sql: replace_partition_placeholders(&load.sql, &from, &to),
        params: replace_partition_params(&load.params, &from, &to),
        refresh_key_sql: rollup.refresh_key.sql.clone(),
        rollup_meta: Some(Box::new(rollup.clone())),
        build_target: Some(target),
    }
}

/// Handler of [`HandlerKind::PreAggregationBuild`]: builds the payload's
/// target through the partition store.
pub struct PartitionBuildHandler {
    store: Arc<dyn PartitionStore>,
}

impl PartitionBuildHandler {
    pub fn new(store: Arc<dyn PartitionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueryHandler for PartitionBuildHandler {
    async fn handle(
        &self,
        payload: &CompiledQuery,
        cancel: CancellationToken,
    ) -> std::result::Result<Value, HandlerError> {
        let target = payload
            .build_target
            .as_ref()
            .ok_or_else(|| HandlerError::failed("build payload without a target"))?;

        tokio::select! {
            built = self.store.build(target, payload) => {
                let version = built.map_err(|e| HandlerError::failed(e.to_string()))?;
                Ok(serde_json::to_value(version)?)
            }
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
        }
    }
}

/// Handlers of a data source serving rollups: plain, refresh key and build
/// range queries through `driver`, partition builds through `store`.
pub fn rollup_handlers(driver: Arc<dyn Driver>, store: Arc<dyn PartitionStore>) -> HandlerRegistry {
    let queries: Arc<dyn QueryHandler> = Arc::new(DriverQueryHandler::new(driver));
    HandlerRegistry::new()
        .with(HandlerKind::Query, Arc::clone(&queries))
        .with(HandlerKind::RefreshKey, Arc::clone(&queries))
        .with(HandlerKind::BuildRange, queries)
        .with(
            HandlerKind::PreAggregationBuild,
            Arc::new(PartitionBuildHandler::new(store)),
        )
}

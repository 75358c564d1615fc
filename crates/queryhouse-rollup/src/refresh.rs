//! Refresh Keys
//!
//! Decide whether a partition has to be rebuilt.
//!
//! A partition is built with a list of refresh key values:
//!
//! - `every`: the index of the current interval, `floor(now / every)`
//! - `sql`: the first value of the refresh SQL's first row, evaluated over
//!   the partition's load range
//!
//! The two are independent: the partition is stale when any value differs
//! from the values of its latest version. A rollup without either is built
//! once and then kept.
//!
//! With `incremental`, sealed partitions that ended more than
//! `update_window` ago and already have a version are not re-evaluated.

use crate::error::Result;
use crate::planner::{replace_partition_placeholders, PartitionDescriptor};
use crate::store::VersionEntry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use queryhouse_core::{BuildTarget, CompiledQuery, HandlerKind, RefreshKey, RollupDefinition};
use queryhouse_orchestrator::{ExecuteOptions, QueryOrchestrator};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::debug;

/// Why a partition is (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    Missing,
    Forced,
    RefreshKeyChanged,
    LoadRangeChanged,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StaleReason::Missing => "missing",
            StaleReason::Forced => "forced",
            StaleReason::RefreshKeyChanged => "refresh_key_changed",
            StaleReason::LoadRangeChanged => "load_range_changed",
        };
        f.write_str(s)
    }
}

/// Compare the latest version with what the partition would be built from;
/// `None` when the version can be kept.
pub fn staleness(
    version: &VersionEntry,
    target: &BuildTarget,
    force_build: bool,
) -> Option<StaleReason> {
    if force_build {
        return Some(StaleReason::Forced);
    }
    if version.load_range != target.load_range {
        return Some(StaleReason::LoadRangeChanged);
    }
    if version.refresh_key_values != target.refresh_key_values {
        return Some(StaleReason::RefreshKeyChanged);
    }
    None
}

/// Whether a built partition lies outside the update window at `now`.
pub fn outside_update_window(
    refresh_key: &RefreshKey,
    partition: &PartitionDescriptor,
    now: DateTime<Utc>,
) -> bool {
    if !refresh_key.incremental || !partition.is_sealed() {
        return false;
    }
    let window = refresh_key
        .update_window
        .and_then(|w| ChronoDuration::from_std(w).ok())
        .unwrap_or_else(ChronoDuration::zero);
    partition.load_range_utc.1 + window < now
}

/// Index of the `every` interval containing `now`.
pub fn interval_index(every: std::time::Duration, now: DateTime<Utc>) -> Option<i64> {
    let every_ms = i64::try_from(every.as_millis()).ok().filter(|ms| *ms > 0)?;
    Some(now.timestamp_millis().div_euclid(every_ms))
}

/// Refresh key values of `partition` at `now`.
///
/// The refresh SQL runs through the data source's queue; concurrent loads
/// of the same partition share one execution, but every load sees a fresh
/// value.
pub async fn refresh_key_values(
    queries: &QueryOrchestrator,
    rollup: &RollupDefinition,
    partition: &PartitionDescriptor,
    now: DateTime<Utc>,
    request_id: Option<String>,
) -> Result<Vec<Value>> {
    let mut values = Vec::new();

    if let Some(index) = rollup.refresh_key.every.and_then(|e| interval_index(e, now)) {
        values.push(json!(index));
    }

    if let Some(sql) = &rollup.refresh_key.sql {
        let (from, to) = partition.load_range_params();
        let query = CompiledQuery::new(
            rollup.data_source.clone(),
            replace_partition_placeholders(sql, &from, &to),
            vec![],
        );
        let rows = queries
            .execute(
                HandlerKind::RefreshKey,
                query,
                rollup.priority.unwrap_or(0),
                ExecuteOptions {
                    request_id,
                    force_build: true,
                    ..Default::default()
                },
            )
            .await?;
        values.push(first_value(&rows));
    }

    debug!(
        partition = %partition.partition_table_name,
        values = ?values,
        "Evaluated refresh key"
    );
    Ok(values)
}

/// First column of the first row of a query result; `Null` when empty.
pub(crate) fn first_value(rows: &Value) -> Value {
    rows.as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| row.as_object())
        .and_then(|row| row.values().next())
        .cloned()
        .unwrap_or(Value::Null)
}

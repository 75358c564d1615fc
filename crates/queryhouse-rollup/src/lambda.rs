//! Lambda Queries
//!
//! Serve a time range from rollups where they are built and from the
//! source where they are not.
//!
//! ```text
//! range        [start ─────────────────────────────────────────── end)
//! rollup 1     [start ─────── b1)
//! rollup 2                    [b1 ──────── b2)
//! source                                   [b2 ───────────────── end)
//! ```
//!
//! Each rollup is loaded from the previous boundary on; its boundary is the
//! end of its contiguous run of sealed partitions. Boundaries are computed
//! for every request. A partition that failed to build ends the run early,
//! so the source query covers its rows instead.
//!
//! All segment queries and the source query run concurrently through the
//! data source's queue. Their rows are concatenated and ordered by the
//! query's sort keys.

use crate::error::{Result, RollupError};
use crate::orchestrator::{union_tables, LoadOptions, PreAggregationOrchestrator};
use crate::planner::{replace_partition_params, MAX_SOURCE_ROW_LIMIT};
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use futures::future::try_join_all;
use queryhouse_core::time::{format_utc, local_to_utc};
use queryhouse_core::{CompiledQuery, HandlerKind, RollupDefinition, Row, Rows, TimeRange};
use queryhouse_observability::metrics::LAMBDA_ROWS_TOTAL;
use queryhouse_orchestrator::ExecuteOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A rollup and the query reading it.
///
/// The query refers to the rollup by its `table_name`, which is replaced by
/// the built partitions. Partition range placeholders in its parameters are
/// set to the segment's range.
#[derive(Debug, Clone)]
pub struct LambdaSegment {
    pub rollup: RollupDefinition,
    pub query: CompiledQuery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LambdaQuery {
    /// Rollups in the order they cover the range
    pub segments: Vec<LambdaSegment>,

    /// Query over the source data, with partition range placeholders and an
    /// optional `__MAX_SOURCE_ROW_LIMIT` parameter
    pub source_query: CompiledQuery,

    /// Local time of the rollups' timezone
    pub range: TimeRange,

    pub order_by: Vec<OrderBy>,

    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LambdaResult {
    pub rows: Rows,
    /// Start of the range served from the source
    pub boundary: NaiveDateTime,
    pub historical_rows: usize,
    pub live_rows: usize,
    /// Partition tables that served the historical part
    pub partitions: Vec<String>,
}

pub struct LambdaExecutor {
    pre_aggregations: Arc<PreAggregationOrchestrator>,
}

impl LambdaExecutor {
    pub fn new(pre_aggregations: Arc<PreAggregationOrchestrator>) -> Self {
        Self { pre_aggregations }
    }

    /// Run `query`.
    ///
    /// # Errors
    ///
    /// - `InvalidRange` for a query without rollups or with rollups in
    ///   different timezones
    /// - `SourceRowLimit` when the source part reaches `max_source_rows`
    /// - `Queue` when a segment or the source query fails
    pub async fn execute(&self, query: LambdaQuery) -> Result<LambdaResult> {
        let tz = lambda_timezone(&query.segments)?;
        let rollup_name = query
            .segments
            .last()
            .map(|s| s.rollup.name.clone())
            .unwrap_or_default();

        let mut boundary = query.range.start;
        let mut historical = Vec::new();
        let mut partitions = Vec::new();

        for segment in &query.segments {
            if boundary >= query.range.end {
                break;
            }
            let requested = TimeRange {
                start: boundary,
                end: query.range.end,
            };
            let options = LoadOptions {
                request_id: query.request_id.clone(),
                ..Default::default()
            };

            let loaded = match self
                .pre_aggregations
                .load(&segment.rollup, &requested, options)
                .await
            {
                Ok(loaded) => loaded,
                Err(RollupError::NoPartitionsAvailable { table, reason }) => {
                    warn!(
                        rollup = %segment.rollup.name,
                        table = %table,
                        reason = %reason,
                        "Rollup unavailable, serving from source"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (segment_end, prefix) = loaded.sealed_prefix(boundary);
            let tables: Vec<&str> = prefix
                .iter()
                .map(|p| p.descriptor.partition_table_name.as_str())
                .collect();
            let Some(table_sql) = union_tables(tables.iter().copied()) else {
                continue;
            };
            if segment_end <= boundary {
                continue;
            }

            debug!(
                rollup = %segment.rollup.name,
                from = %boundary,
                to = %segment_end,
                partitions = tables.len(),
                "Serving segment from rollup"
            );

            let (from, to) = (utc_param(boundary, tz)?, utc_param(segment_end, tz)?);
            let mut segment_query = segment.query.clone();
            segment_query.sql = segment_query
                .sql
                .replace(&segment.rollup.table_name, &table_sql);
            segment_query.params = replace_partition_params(&segment_query.params, &from, &to);

            historical.push((segment_query, segment.rollup.priority.unwrap_or(0)));
            partitions.extend(tables.into_iter().map(str::to_string));
            boundary = segment_end;
        }

        let max_source_rows = self.pre_aggregations.config().max_source_rows;
        let live_query = if boundary < query.range.end {
            let (from, to) = (utc_param(boundary, tz)?, utc_param(query.range.end, tz)?);
            let mut live = query.source_query.clone();
            live.params = replace_partition_params(&live.params, &from, &to)
                .into_iter()
                .map(|p| match p.as_str() {
                    Some(MAX_SOURCE_ROW_LIMIT) => Value::from(max_source_rows),
                    _ => p,
                })
                .collect();
            Some(live)
        } else {
            None
        };

        let request_id = &query.request_id;
        let historical_rows = try_join_all(
            historical
                .into_iter()
                .map(|(q, priority)| self.run(q, priority, request_id)),
        );
        let live_rows = async move {
            match live_query {
                Some(q) => self.run(q, 0, request_id).await,
                None => Ok(Vec::new()),
            }
        };
        let (historical_rows, live_rows) = tokio::try_join!(historical_rows, live_rows)?;

        if live_rows.len() >= max_source_rows {
            return Err(RollupError::SourceRowLimit {
                rollup: rollup_name,
                limit: max_source_rows,
            });
        }

        let historical_rows: Rows = historical_rows.into_iter().flatten().collect();
        let historical_count = historical_rows.len();
        let live_count = live_rows.len();

        LAMBDA_ROWS_TOTAL
            .with_label_values(&[rollup_name.as_str(), "historical"])
            .inc_by(historical_count as u64);
        LAMBDA_ROWS_TOTAL
            .with_label_values(&[rollup_name.as_str(), "live"])
            .inc_by(live_count as u64);

        let mut rows = historical_rows;
        rows.extend(live_rows);
        sort_rows(&mut rows, &query.order_by);

        info!(
            rollup = %rollup_name,
            boundary = %boundary,
            historical_rows = historical_count,
            live_rows = live_count,
            "Lambda query served"
        );

        Ok(LambdaResult {
            rows,
            boundary,
            historical_rows: historical_count,
            live_rows: live_count,
            partitions,
        })
    }

    /// Rows of one historical or live query. Identical requests running at
    /// the same time share an execution; stored outcomes of earlier requests
    /// are never reused.
    async fn run(
        &self,
        query: CompiledQuery,
        priority: i32,
        request_id: &Option<String>,
    ) -> Result<Rows> {
        let value = self
            .pre_aggregations
            .queries()
            .execute(
                HandlerKind::Query,
                query,
                priority,
                ExecuteOptions {
                    request_id: request_id.clone(),
                    force_build: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn lambda_timezone(segments: &[LambdaSegment]) -> Result<Tz> {
    let first = segments
        .first()
        .ok_or_else(|| RollupError::InvalidRange("lambda query without rollups".to_string()))?;
    let tz = first.rollup.tz()?;
    for segment in &segments[1..] {
        if segment.rollup.tz()? != tz {
            return Err(RollupError::InvalidRange(format!(
                "rollups {} and {} use different timezones",
                first.rollup.name, segment.rollup.name
            )));
        }
    }
    Ok(tz)
}

fn utc_param(t: NaiveDateTime, tz: Tz) -> Result<String> {
    Ok(format_utc(local_to_utc(t, tz)?))
}

/// Stable sort of `rows` by `order_by`; missing and null values first.
pub fn sort_rows(rows: &mut [Row], order_by: &[OrderBy]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in order_by {
            let ordering = compare_values(a.get(&key.column), b.get(&key.column));
            let ordering = if key.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    #[test]
    fn test_sort_rows_by_keys() {
        let mut rows = vec![
            row(json!({ "day": "2024-01-02", "count": 1 })),
            row(json!({ "day": "2024-01-01", "count": 5 })),
            row(json!({ "day": "2024-01-02", "count": 3 })),
            row(json!({ "count": 9 })),
        ];
        sort_rows(&mut rows, &[OrderBy::asc("day"), OrderBy::desc("count")]);

        let order: Vec<Value> = rows.iter().map(|r| r["count"].clone()).collect();
        assert_eq!(order, vec![json!(9), json!(5), json!(3), json!(1)]);
    }

    #[test]
    fn test_sort_is_stable_without_keys() {
        let mut rows = vec![row(json!({ "n": 2 })), row(json!({ "n": 1 }))];
        sort_rows(&mut rows, &[]);
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[test]
    fn test_numbers_compare_numerically() {
        let mut rows = vec![
            row(json!({ "n": 10 })),
            row(json!({ "n": 9.5 })),
            row(json!({ "n": -1 })),
        ];
        sort_rows(&mut rows, &[OrderBy::asc("n")]);
        let order: Vec<Value> = rows.iter().map(|r| r["n"].clone()).collect();
        assert_eq!(order, vec![json!(-1), json!(9.5), json!(10)]);
    }

    #[test]
    fn test_segments_must_share_timezone() {
        let rollup = |name: &str, tz: &str| {
            let mut rollup: RollupDefinition = serde_json::from_value(json!({
                "name": name,
                "table_name": name,
                "data_source": "main",
                "load_query": { "data_source": "main", "sql": "SELECT 1" }
            }))
            .unwrap();
            rollup.timezone = tz.to_string();
            LambdaSegment {
                query: CompiledQuery::new("main", format!("SELECT * FROM {}", name), vec![]),
                rollup,
            }
        };

        assert!(lambda_timezone(&[]).is_err());
        assert_eq!(
            lambda_timezone(&[rollup("a", "Europe/Paris"), rollup("b", "Europe/Paris")]).unwrap(),
            chrono_tz::Europe::Paris
        );
        assert!(matches!(
            lambda_timezone(&[rollup("a", "UTC"), rollup("b", "Europe/Paris")]),
            Err(RollupError::InvalidRange(_))
        ));
    }
}

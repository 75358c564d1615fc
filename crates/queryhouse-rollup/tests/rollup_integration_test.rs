//! Rollup Integration Tests
//!
//! Load and lambda scenarios against an in-memory warehouse with hourly
//! events from 2024-01-01T00:00Z to 2024-01-03T12:00Z:
//! - Partitions are built once and reused while their refresh key holds
//! - Either refresh key condition changing triggers a rebuild
//! - Incremental rollups keep partitions outside the update window
//! - Concurrent loads share partition builds
//! - Failed partitions are reported and shift the lambda boundary back
//! - Lambda results have no duplicate or missing rows at the boundary

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use queryhouse_core::time::{format_utc, parse_local, parse_utc};
use queryhouse_core::{
    CompiledQuery, Driver, DriverError, RollupDefinition, Row, Rows, TimeRange,
};
use queryhouse_orchestrator::{QueryOrchestrator, QueueConfig, QueueError};
use queryhouse_rollup::{
    rollup_handlers, LambdaExecutor, LambdaQuery, LambdaSegment, LoadOptions,
    MemoryPartitionStore, OrderBy, PartitionStore, PreAggregationOrchestrator, RollupConfig,
    RollupError, FROM_PARTITION_RANGE, MAX_SOURCE_ROW_LIMIT, TO_PARTITION_RANGE,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Warehouse answering the statements the tests issue, told apart by their
/// first word.
struct Warehouse {
    events: Vec<DateTime<Utc>>,
    refresh_value: Mutex<Value>,
    load_delay: Duration,
    loads: Mutex<Vec<String>>,
    fail_load_from: Mutex<Option<String>>,
    fail_source: AtomicBool,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
}

impl Warehouse {
    fn hourly() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let events = (0..=60).map(|h| start + ChronoDuration::hours(h)).collect();
        Self::with_events(events)
    }

    fn with_events(events: Vec<DateTime<Utc>>) -> Self {
        Self {
            events,
            refresh_value: Mutex::new(json!("v1")),
            load_delay: Duration::from_millis(20),
            loads: Mutex::new(Vec::new()),
            fail_load_from: Mutex::new(None),
            fail_source: AtomicBool::new(false),
            statements: Mutex::new(Vec::new()),
        }
    }

    fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    fn set_refresh_value(&self, value: Value) {
        *self.refresh_value.lock().unwrap() = value;
    }

    fn fail_load(&self, from: &str) {
        *self.fail_load_from.lock().unwrap() = Some(from.to_string());
    }

    fn statements_starting_with(&self, word: &str) -> Vec<(String, Vec<Value>)> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter(|(sql, _)| sql.starts_with(word))
            .cloned()
            .collect()
    }

    fn rows_between(&self, params: &[Value], source: &str) -> Rows {
        let bound = |i: usize| parse_utc(params[i].as_str().unwrap()).unwrap();
        let (from, to) = (bound(0), bound(1));
        self.events
            .iter()
            .filter(|t| from <= **t && **t < to)
            .map(|t| {
                let mut row = Row::new();
                row.insert("ts".to_string(), json!(format_utc(*t)));
                row.insert("source".to_string(), json!(source));
                row
            })
            .collect()
    }

    fn single(column: &str, value: Value) -> Rows {
        let mut row = Row::new();
        row.insert(column.to_string(), value);
        vec![row]
    }
}

#[async_trait]
impl Driver for Warehouse {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Rows, DriverError> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));

        match sql.split_whitespace().next() {
            Some("LOAD") => {
                tokio::time::sleep(self.load_delay).await;
                let from = params[0].as_str().unwrap_or_default().to_string();
                if self.fail_load_from.lock().unwrap().as_deref() == Some(from.as_str()) {
                    return Err(DriverError::Query(format!("disk full loading {}", from)));
                }
                self.loads.lock().unwrap().push(from);
                Ok(self.rows_between(params, "load"))
            }
            Some("REFRESH") => Ok(Self::single(
                "max",
                self.refresh_value.lock().unwrap().clone(),
            )),
            Some("MIN") => Ok(Self::single(
                "min",
                self.events.iter().min().map(|t| json!(format_utc(*t))).unwrap_or(Value::Null),
            )),
            Some("MAX") => Ok(Self::single(
                "max",
                self.events.iter().max().map(|t| json!(format_utc(*t))).unwrap_or(Value::Null),
            )),
            Some("ROLLUP") => Ok(self.rows_between(params, "rollup")),
            Some("SOURCE") => {
                if self.fail_source.load(Ordering::SeqCst) {
                    return Err(DriverError::Connection("source unreachable".to_string()));
                }
                Ok(self.rows_between(params, "live"))
            }
            _ => Err(DriverError::Query(format!("unexpected statement: {}", sql))),
        }
    }

    async fn test_connection(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct Harness {
    warehouse: Arc<Warehouse>,
    store: Arc<MemoryPartitionStore>,
    rollups: Arc<PreAggregationOrchestrator>,
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        concurrency: 4,
        continue_wait_timeout: Duration::from_millis(100),
        reconcile_interval: Duration::from_millis(20),
        result_poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn harness_with(warehouse: Warehouse, config: RollupConfig) -> Harness {
    let warehouse = Arc::new(warehouse);
    let driver: Arc<dyn Driver> = warehouse.clone();
    let store = Arc::new(MemoryPartitionStore::new(Arc::clone(&driver)));
    let handler_store: Arc<dyn PartitionStore> = store.clone();

    let queries = Arc::new(QueryOrchestrator::new(
        queue_config(),
        Arc::new(move |_: &str| rollup_handlers(Arc::clone(&driver), Arc::clone(&handler_store))),
    ));
    let rollups = Arc::new(PreAggregationOrchestrator::new(queries, store.clone(), config));

    Harness {
        warehouse,
        store,
        rollups,
    }
}

fn harness() -> Harness {
    harness_with(Warehouse::hourly(), RollupConfig::default())
}

fn rollup(name: &str) -> RollupDefinition {
    serde_json::from_value(json!({
        "name": name,
        "table_name": name,
        "data_source": "warehouse",
        "partition_granularity": "day",
        "refresh_key": { "sql": "REFRESH SELECT MAX(updated_at) FROM events" },
        "build_range_queries": [
            { "data_source": "warehouse", "sql": "MIN SELECT MIN(ts) FROM events" },
            { "data_source": "warehouse", "sql": "MAX SELECT MAX(ts) FROM events" }
        ],
        "load_query": {
            "data_source": "warehouse",
            "sql": "LOAD SELECT * FROM events WHERE ts >= ? AND ts < ?",
            "params": [FROM_PARTITION_RANGE, TO_PARTITION_RANGE]
        }
    }))
    .unwrap()
}

fn range(start: &str, end: &str) -> TimeRange {
    TimeRange::parse(start, end).unwrap()
}

fn utc(s: &str) -> DateTime<Utc> {
    parse_utc(s).unwrap()
}

fn rebuilt(result: &queryhouse_rollup::LoadResult) -> Vec<bool> {
    result.partitions.iter().map(|p| p.rebuilt).collect()
}

// ============================================================================
// Pre-aggregation loading
// ============================================================================

#[tokio::test]
async fn test_load_builds_partitions_once() {
    let h = harness();
    let rollup = rollup("daily_events");
    let requested = range("2024-01-01", "2024-01-04");

    let first = h
        .rollups
        .load(&rollup, &requested, LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(
        first.build_range,
        range("2024-01-01", "2024-01-03T12:00:00.001")
    );
    assert_eq!(rebuilt(&first), vec![true, true, true]);
    assert!(first.failed.is_empty());
    assert_eq!(h.warehouse.load_count(), 3);
    assert_eq!(
        first.target_table_sql().unwrap(),
        "(SELECT * FROM daily_events20240101 UNION ALL SELECT * FROM daily_events20240102 \
         UNION ALL SELECT * FROM daily_events20240103)"
    );

    assert_eq!(h.store.rows("daily_events20240101").await.unwrap().len(), 24);
    assert_eq!(h.store.rows("daily_events20240103").await.unwrap().len(), 13);
    assert!(first.partitions[1].version.sealed);
    assert!(!first.partitions[2].version.sealed);

    let second = h
        .rollups
        .load(&rollup, &requested, LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(rebuilt(&second), vec![false, false, false]);
    assert_eq!(h.warehouse.load_count(), 3);
    for (a, b) in first.partitions.iter().zip(&second.partitions) {
        assert_eq!(a.version.version_id, b.version.version_id);
    }

    // load parameters are the UTC bounds of the bucket within the build range
    let loads = h.warehouse.statements_starting_with("LOAD");
    assert!(loads.iter().any(|(_, params)| params
        == &vec![json!("2024-01-03T00:00:00.000Z"), json!("2024-01-03T12:00:00.001Z")]));
}

#[tokio::test]
async fn test_refresh_key_conditions_are_independent() {
    let h = harness();
    let mut rollup = rollup("daily_events");
    rollup.refresh_key.every = Some(Duration::from_secs(3600));
    let requested = range("2024-01-01", "2024-01-04");
    let at = |now: DateTime<Utc>| LoadOptions {
        now: Some(now),
        ..Default::default()
    };
    let now = utc("2024-01-03T13:10:00Z");

    let built = h.rollups.load(&rollup, &requested, at(now)).await.unwrap();
    assert_eq!(rebuilt(&built), vec![true, true, true]);
    assert_eq!(
        built.partitions[0].version.refresh_key_values,
        vec![json!(now.timestamp_millis() / 3_600_000), json!("v1")]
    );

    let same = h.rollups.load(&rollup, &requested, at(now)).await.unwrap();
    assert_eq!(rebuilt(&same), vec![false, false, false]);

    // only the SQL value changes
    h.warehouse.set_refresh_value(json!("v2"));
    let sql_changed = h.rollups.load(&rollup, &requested, at(now)).await.unwrap();
    assert_eq!(rebuilt(&sql_changed), vec![true, true, true]);

    // only the interval changes
    let next_hour = now + ChronoDuration::hours(1);
    let interval_changed = h
        .rollups
        .load(&rollup, &requested, at(next_hour))
        .await
        .unwrap();
    assert_eq!(rebuilt(&interval_changed), vec![true, true, true]);

    assert_eq!(h.warehouse.load_count(), 9);
}

#[tokio::test]
async fn test_incremental_rollup_keeps_partitions_outside_window() {
    let h = harness();
    let mut rollup = rollup("daily_events");
    rollup.refresh_key.sql = None;
    rollup.refresh_key.every = Some(Duration::from_secs(3600));
    rollup.refresh_key.incremental = true;
    rollup.refresh_key.update_window = Some(Duration::from_secs(86_400));
    let requested = range("2024-01-01", "2024-01-04");
    let now = utc("2024-01-03T13:00:00Z");

    let first = h
        .rollups
        .load(
            &rollup,
            &requested,
            LoadOptions {
                now: Some(now),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rebuilt(&first), vec![true, true, true]);

    let later = now + ChronoDuration::hours(1);
    let second = h
        .rollups
        .load(
            &rollup,
            &requested,
            LoadOptions {
                now: Some(later),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // Jan 1 ended more than a day ago; Jan 2 is inside the window; Jan 3 is open
    assert_eq!(rebuilt(&second), vec![false, true, true]);

    let forced = h
        .rollups
        .load(
            &rollup,
            &requested,
            LoadOptions {
                now: Some(later),
                force_build: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rebuilt(&forced), vec![true, true, true]);
    assert_eq!(h.warehouse.load_count(), 8);
}

#[tokio::test]
async fn test_concurrent_loads_share_builds() {
    let mut warehouse = Warehouse::hourly();
    warehouse.load_delay = Duration::from_millis(150);
    let h = harness_with(warehouse, RollupConfig::default());
    let rollup = rollup("daily_events");
    let requested = range("2024-01-01", "2024-01-04");

    let (a, b) = tokio::join!(
        h.rollups.load(&rollup, &requested, LoadOptions::default()),
        h.rollups.load(&rollup, &requested, LoadOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.warehouse.load_count(), 3);
    for (x, y) in a.partitions.iter().zip(&b.partitions) {
        assert_eq!(x.version.version_id, y.version.version_id);
    }
}

#[tokio::test]
async fn test_failed_partition_is_reported() {
    let h = harness();
    h.warehouse.fail_load("2024-01-02T00:00:00.000Z");
    let rollup = rollup("daily_events");

    let result = h
        .rollups
        .load(&rollup, &range("2024-01-01", "2024-01-04"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(result.partitions.len(), 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(
        result.failed[0].descriptor.partition_table_name,
        "daily_events20240102"
    );
    assert!(result.failed[0].error.contains("disk full"));
    assert!(h.store.latest_version("daily_events20240102").await.unwrap().is_none());

    let err = h
        .rollups
        .load(&rollup, &range("2024-01-02", "2024-01-03"), LoadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RollupError::NoPartitionsAvailable { .. }));
}

#[tokio::test]
async fn test_range_outside_build_range_loads_nothing() {
    let h = harness();
    let result = h
        .rollups
        .load(
            &rollup("daily_events"),
            &range("2023-06-01", "2023-07-01"),
            LoadOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.partitions.is_empty());
    assert!(result.failed.is_empty());
    assert_eq!(result.target_table_sql(), None);
    assert_eq!(h.warehouse.load_count(), 0);
}

#[tokio::test]
async fn test_empty_source_builds_range_at_now() {
    let h = harness_with(Warehouse::with_events(vec![]), RollupConfig::default());
    let now = utc("2024-05-05T10:30:00Z");
    let options = LoadOptions {
        now: Some(now),
        ..Default::default()
    };

    let build = h
        .rollups
        .resolve_build_range(&rollup("daily_events"), now, &options)
        .await
        .unwrap();
    assert!(build.is_instant());
    assert_eq!(build.start, parse_local("2024-05-05T10:30:00").unwrap());

    let mut explicit = rollup("daily_events");
    explicit.build_range = Some(range("2024-01-01", "2024-02-01"));
    assert_eq!(
        h.rollups
            .resolve_build_range(&explicit, now, &options)
            .await
            .unwrap(),
        range("2024-01-01", "2024-02-01")
    );
    assert_eq!(h.warehouse.statements_starting_with("MIN").len(), 1);
}

#[tokio::test]
async fn test_partition_limit() {
    let h = harness_with(
        Warehouse::hourly(),
        RollupConfig {
            max_partitions: 2,
            ..Default::default()
        },
    );
    let err = h
        .rollups
        .load(
            &rollup("daily_events"),
            &range("2024-01-01", "2024-01-04"),
            LoadOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RollupError::TooManyPartitions { max: 2, .. }));
}

// ============================================================================
// Lambda queries
// ============================================================================

fn segment(rollup: RollupDefinition) -> LambdaSegment {
    let query = CompiledQuery::new(
        "warehouse",
        format!("ROLLUP SELECT ts FROM {} WHERE ts >= ? AND ts < ?", rollup.table_name),
        vec![json!(FROM_PARTITION_RANGE), json!(TO_PARTITION_RANGE)],
    );
    LambdaSegment { rollup, query }
}

fn lambda_query(segments: Vec<LambdaSegment>) -> LambdaQuery {
    LambdaQuery {
        segments,
        source_query: CompiledQuery::new(
            "warehouse",
            "SOURCE SELECT ts FROM events WHERE ts >= ? AND ts < ? LIMIT ?",
            vec![
                json!(FROM_PARTITION_RANGE),
                json!(TO_PARTITION_RANGE),
                json!(MAX_SOURCE_ROW_LIMIT),
            ],
        ),
        range: range("2024-01-01", "2024-01-04"),
        order_by: vec![OrderBy::asc("ts")],
        request_id: Some("lambda-test".to_string()),
    }
}

fn assert_complete_and_ordered(rows: &Rows, expected: usize) {
    let ts: Vec<&str> = rows.iter().map(|r| r["ts"].as_str().unwrap()).collect();
    let unique: HashSet<&str> = ts.iter().copied().collect();
    assert_eq!(ts.len(), expected, "row count");
    assert_eq!(unique.len(), expected, "duplicate rows at the boundary");
    let mut sorted = ts.clone();
    sorted.sort();
    assert_eq!(ts, sorted);
}

#[tokio::test]
async fn test_lambda_splits_at_last_sealed_partition() {
    let h = harness();
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    let result = lambda
        .execute(lambda_query(vec![segment(rollup("daily_events"))]))
        .await
        .unwrap();

    assert_eq!(result.boundary, parse_local("2024-01-03T00:00:00").unwrap());
    assert_eq!(result.historical_rows, 48);
    assert_eq!(result.live_rows, 13);
    assert_eq!(
        result.partitions,
        vec!["daily_events20240101".to_string(), "daily_events20240102".to_string()]
    );
    assert_complete_and_ordered(&result.rows, 61);
    assert_eq!(result.rows[47]["source"], json!("rollup"));
    assert_eq!(result.rows[48]["source"], json!("live"));

    let rollup_sql = h.warehouse.statements_starting_with("ROLLUP");
    assert_eq!(rollup_sql.len(), 1);
    assert!(rollup_sql[0].0.contains(
        "(SELECT * FROM daily_events20240101 UNION ALL SELECT * FROM daily_events20240102)"
    ));

    let source = h.warehouse.statements_starting_with("SOURCE");
    assert_eq!(
        source[0].1,
        vec![
            json!("2024-01-03T00:00:00.000Z"),
            json!("2024-01-04T00:00:00.000Z"),
            json!(10_000),
        ]
    );
}

#[tokio::test]
async fn test_repeated_lambda_requests_query_live_tail_again() {
    let h = harness();
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    for _ in 0..2 {
        let result = lambda
            .execute(lambda_query(vec![segment(rollup("daily_events"))]))
            .await
            .unwrap();
        assert_eq!(result.live_rows, 13);
        assert_complete_and_ordered(&result.rows, 61);
    }

    assert_eq!(h.warehouse.statements_starting_with("SOURCE").len(), 2);
    assert_eq!(h.warehouse.statements_starting_with("ROLLUP").len(), 2);
    // partitions were built by the first request only
    assert_eq!(h.warehouse.load_count(), 3);
}

#[tokio::test]
async fn test_failed_partition_moves_boundary_back() {
    let h = harness();
    h.warehouse.fail_load("2024-01-02T00:00:00.000Z");
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    let result = lambda
        .execute(lambda_query(vec![segment(rollup("daily_events"))]))
        .await
        .unwrap();

    assert_eq!(result.boundary, parse_local("2024-01-02T00:00:00").unwrap());
    assert_eq!(result.historical_rows, 24);
    assert_eq!(result.live_rows, 37);
    assert_complete_and_ordered(&result.rows, 61);
}

#[tokio::test]
async fn test_rollups_chain_from_previous_boundary() {
    let h = harness();
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    let mut archive = rollup("archive_events");
    archive.build_range = Some(range("2024-01-01", "2024-01-02"));
    archive.build_range_queries = None;

    let result = lambda
        .execute(lambda_query(vec![
            segment(archive),
            segment(rollup("daily_events")),
        ]))
        .await
        .unwrap();

    assert_eq!(
        result.partitions,
        vec!["archive_events20240101".to_string(), "daily_events20240102".to_string()]
    );
    assert_eq!(result.boundary, parse_local("2024-01-03T00:00:00").unwrap());
    assert_eq!(result.historical_rows, 48);
    assert_complete_and_ordered(&result.rows, 61);

    // the second rollup was only loaded from the first boundary on
    assert!(h.store.latest_version("daily_events20240101").await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_failure_is_surfaced() {
    let h = harness();
    h.warehouse.fail_source.store(true, Ordering::SeqCst);
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    let err = lambda
        .execute(lambda_query(vec![segment(rollup("daily_events"))]))
        .await
        .unwrap_err();
    match err {
        RollupError::Queue(QueueError::Handler(message)) => {
            assert!(message.contains("source unreachable"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_live_tail_row_limit() {
    let h = harness_with(
        Warehouse::hourly(),
        RollupConfig {
            max_source_rows: 10,
            ..Default::default()
        },
    );
    let lambda = LambdaExecutor::new(Arc::clone(&h.rollups));

    let err = lambda
        .execute(lambda_query(vec![segment(rollup("daily_events"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, RollupError::SourceRowLimit { limit: 10, .. }));
}

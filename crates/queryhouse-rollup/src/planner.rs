//! Partition Range Planner
//!
//! Splits a requested time range into the calendar-aligned partitions of a
//! rollup.
//!
//! ## Ranges
//!
//! Every descriptor carries three local-time ranges:
//!
//! ```text
//! build range      [=================================)
//! requested range          [==================)
//! bucket (month)   [-------|-----][------------|------]
//! range                    [=====][============)         requested ∩ bucket ∩ build
//! load_range       [=============][===================)  bucket ∩ build
//! ```
//!
//! - `range` is what the partition answers for this request. The ranges of
//!   a plan are sorted, contiguous, and their union is exactly the clipped
//!   requested range.
//! - `load_range` is what the partition table is built from. It does not
//!   depend on the request, so different requests share partition builds.
//! - A partition is sealed once its `load_range` reaches the end of its
//!   bucket; a sealed partition never gains rows.
//!
//! Buckets are aligned in the rollup's timezone. Local times are converted
//! to UTC only for the descriptor's `*_utc` fields and load parameters:
//! ambiguous times take the earlier instant, times inside a DST gap move
//! forward to the first valid instant.

use crate::error::{Result, RollupError};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use queryhouse_core::time::{format_utc, local_to_utc};
use queryhouse_core::{Granularity, TimeRange};
use serde::Serialize;
use serde_json::Value;

/// Parameter placeholder replaced with the start of the partition load range
pub const FROM_PARTITION_RANGE: &str = "__FROM_PARTITION_RANGE";

/// Parameter placeholder replaced with the end of the partition load range
pub const TO_PARTITION_RANGE: &str = "__TO_PARTITION_RANGE";

/// Parameter placeholder replaced with the live tail row limit
pub const MAX_SOURCE_ROW_LIMIT: &str = "__MAX_SOURCE_ROW_LIMIT";

pub const DEFAULT_MAX_PARTITIONS: usize = 10_000;

/// One partition of a rollup, as planned for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionDescriptor {
    pub table_name: String,

    /// `table_name` plus the bucket suffix; `table_name` when unpartitioned
    pub partition_table_name: String,

    pub granularity: Option<Granularity>,

    /// Requested range clipped to the bucket and the build range
    pub range: TimeRange,

    /// Full calendar bucket; the build range when unpartitioned
    pub bucket: TimeRange,

    /// Rows of the partition table: bucket clipped to the build range
    pub load_range: TimeRange,

    pub range_utc: (DateTime<Utc>, DateTime<Utc>),

    pub load_range_utc: (DateTime<Utc>, DateTime<Utc>),

    pub build_range_start: NaiveDateTime,

    pub build_range_end: NaiveDateTime,
}

impl PartitionDescriptor {
    pub fn is_sealed(&self) -> bool {
        self.load_range.end >= self.bucket.end
    }

    /// Load range bounds formatted for query parameters.
    pub fn load_range_params(&self) -> (String, String) {
        (format_utc(self.load_range_utc.0), format_utc(self.load_range_utc.1))
    }
}

/// Intersection of two ranges; `None` when they are disjoint.
///
/// Ranges that only touch intersect in an instant (`start == end`).
pub fn intersect_ranges(a: &TimeRange, b: &TimeRange) -> Option<TimeRange> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if start > end {
        return None;
    }
    Some(TimeRange { start, end })
}

/// Full buckets of `granularity` covering `range`.
///
/// The first bucket starts at or before `range.start`; an instant range
/// yields the bucket containing it.
pub fn time_series(granularity: Granularity, range: &TimeRange) -> Vec<TimeRange> {
    Buckets::new(granularity, range).collect()
}

struct Buckets {
    granularity: Granularity,
    next: Option<NaiveDateTime>,
    end: NaiveDateTime,
    instant: bool,
}

impl Buckets {
    fn new(granularity: Granularity, range: &TimeRange) -> Self {
        Self {
            granularity,
            next: Some(granularity.bucket_start(range.start)),
            end: range.end,
            instant: range.is_instant(),
        }
    }
}

impl Iterator for Buckets {
    type Item = TimeRange;

    fn next(&mut self) -> Option<TimeRange> {
        let start = self.next.take()?;
        if start >= self.end && !self.instant {
            return None;
        }
        let end = self.granularity.next_bucket(start);
        if !self.instant && end > start {
            self.next = Some(end);
        }
        Some(TimeRange { start, end })
    }
}

/// Plan the partitions serving `requested`, with the default partition limit.
pub fn plan_partitions(
    table_name: &str,
    requested: &TimeRange,
    build: &TimeRange,
    granularity: Option<Granularity>,
    tz: Tz,
) -> Result<Vec<PartitionDescriptor>> {
    plan_partitions_with_limit(
        table_name,
        requested,
        build,
        granularity,
        tz,
        DEFAULT_MAX_PARTITIONS,
    )
}

/// Plan the partitions serving `requested` within `build`.
///
/// Returns an empty plan when the ranges do not overlap, and exactly one
/// partition for an instant request inside the build range.
///
/// # Errors
///
/// - `TooManyPartitions` when more than `max_partitions` buckets are needed
/// - `Core` when a local time cannot be converted to UTC
pub fn plan_partitions_with_limit(
    table_name: &str,
    requested: &TimeRange,
    build: &TimeRange,
    granularity: Option<Granularity>,
    tz: Tz,
    max_partitions: usize,
) -> Result<Vec<PartitionDescriptor>> {
    let Some(clipped) = intersect_ranges(requested, build) else {
        return Ok(Vec::new());
    };
    // Ranges are half-open; an instant only overlaps a range containing it.
    let overlaps = match (requested.is_instant(), build.is_instant()) {
        (false, false) => !clipped.is_instant(),
        (true, true) => true,
        (true, false) => build.contains(requested.start),
        (false, true) => requested.contains(build.start),
    };
    if !overlaps {
        return Ok(Vec::new());
    }

    let Some(granularity) = granularity else {
        return Ok(vec![descriptor(
            table_name,
            table_name.to_string(),
            None,
            clipped,
            *build,
            *build,
            tz,
        )?]);
    };

    let buckets: Vec<TimeRange> = Buckets::new(granularity, &clipped)
        .take(max_partitions.saturating_add(1))
        .collect();
    if buckets.len() > max_partitions {
        return Err(RollupError::TooManyPartitions {
            table: table_name.to_string(),
            max: max_partitions,
        });
    }

    buckets
        .into_iter()
        .map(|bucket| {
            let range = intersect_ranges(&bucket, &clipped).unwrap_or(clipped);
            descriptor(
                table_name,
                partition_table_name(table_name, granularity, bucket.start),
                Some(granularity),
                range,
                bucket,
                *build,
                tz,
            )
        })
        .collect()
}

fn descriptor(
    table_name: &str,
    partition_table_name: String,
    granularity: Option<Granularity>,
    range: TimeRange,
    bucket: TimeRange,
    build: TimeRange,
    tz: Tz,
) -> Result<PartitionDescriptor> {
    let load_range = intersect_ranges(&bucket, &build).unwrap_or(range);
    Ok(PartitionDescriptor {
        table_name: table_name.to_string(),
        partition_table_name,
        granularity,
        range,
        bucket,
        load_range,
        range_utc: (local_to_utc(range.start, tz)?, local_to_utc(range.end, tz)?),
        load_range_utc: (
            local_to_utc(load_range.start, tz)?,
            local_to_utc(load_range.end, tz)?,
        ),
        build_range_start: build.start,
        build_range_end: build.end,
    })
}

/// Name of the partition table of the bucket starting at `bucket_start`.
///
/// Day and coarser: `YYYYMMDD`; hour: `YYYYMMDDHH`; minute and second:
/// `YYYYMMDDHHmm`.
pub fn partition_table_name(
    table_name: &str,
    granularity: Granularity,
    bucket_start: NaiveDateTime,
) -> String {
    let format = match granularity {
        Granularity::Second | Granularity::Minute => "%Y%m%d%H%M",
        Granularity::Hour => "%Y%m%d%H",
        _ => "%Y%m%d",
    };
    format!("{}{}", table_name, bucket_start.format(format))
}

/// Replace partition range placeholders in query parameters.
pub fn replace_partition_params(params: &[Value], from: &str, to: &str) -> Vec<Value> {
    params
        .iter()
        .map(|param| match param.as_str() {
            Some(FROM_PARTITION_RANGE) => Value::String(from.to_string()),
            Some(TO_PARTITION_RANGE) => Value::String(to.to_string()),
            _ => param.clone(),
        })
        .collect()
}

/// Replace partition range placeholders written inline in SQL text with
/// quoted timestamps.
pub fn replace_partition_placeholders(sql: &str, from: &str, to: &str) -> String {
    sql.replace(FROM_PARTITION_RANGE, &format!("'{}'", from))
        .replace(TO_PARTITION_RANGE, &format!("'{}'", to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::parse(start, end).unwrap()
    }

    fn at(s: &str) -> NaiveDateTime {
        queryhouse_core::time::parse_local(s).unwrap()
    }

    #[test]
    fn test_month_partitions_cover_requested_range() {
        let requested = range("2020-02-07", "2020-05-07");
        let partitions = plan_partitions(
            "orders_monthly",
            &requested,
            &requested,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();

        let names: Vec<&str> = partitions
            .iter()
            .map(|p| p.partition_table_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "orders_monthly20200201",
                "orders_monthly20200301",
                "orders_monthly20200401",
                "orders_monthly20200501",
            ]
        );

        assert_eq!(partitions[0].range, range("2020-02-07", "2020-03-01"));
        assert_eq!(partitions[1].range, range("2020-03-01", "2020-04-01"));
        assert_eq!(partitions[2].range, range("2020-04-01", "2020-05-01"));
        assert_eq!(partitions[3].range, range("2020-05-01", "2020-05-07"));

        // contiguous and exactly the requested range
        for pair in partitions.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
        assert_eq!(partitions[0].range.start, requested.start);
        assert_eq!(partitions[3].range.end, requested.end);

        assert_eq!(partitions[0].bucket, range("2020-02-01", "2020-03-01"));
        assert!(partitions[0].is_sealed());
        assert!(!partitions[3].is_sealed());
    }

    #[test]
    fn test_load_range_is_independent_of_request() {
        let build = range("2020-01-15", "2020-06-01");
        let a = plan_partitions(
            "t",
            &range("2020-03-10", "2020-03-20"),
            &build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();
        let b = plan_partitions(
            "t",
            &range("2020-03-01", "2020-04-01"),
            &build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].load_range, b[0].load_range);
        assert_eq!(a[0].load_range, range("2020-03-01", "2020-04-01"));

        let first = plan_partitions(
            "t",
            &build,
            &build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();
        assert_eq!(first[0].load_range, range("2020-01-15", "2020-02-01"));
        assert!(first[0].is_sealed());
    }

    #[test]
    fn test_disjoint_and_touching_ranges_are_empty() {
        let build = range("2020-01-01", "2020-02-01");

        let disjoint = plan_partitions(
            "t",
            &range("2021-01-01", "2021-02-01"),
            &build,
            Some(Granularity::Day),
            Tz::UTC,
        )
        .unwrap();
        assert!(disjoint.is_empty());

        let touching = plan_partitions(
            "t",
            &range("2020-02-01", "2020-03-01"),
            &build,
            Some(Granularity::Day),
            Tz::UTC,
        )
        .unwrap();
        assert!(touching.is_empty());
    }

    #[test]
    fn test_instant_request_yields_one_partition() {
        let build = range("2020-01-01", "2020-02-01");
        let partitions = plan_partitions(
            "t",
            &range("2020-01-10T12:00:00", "2020-01-10T12:00:00"),
            &build,
            Some(Granularity::Day),
            Tz::UTC,
        )
        .unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition_table_name, "t20200110");
        assert!(partitions[0].range.is_instant());
        assert_eq!(partitions[0].load_range, range("2020-01-10", "2020-01-11"));
    }

    #[test]
    fn test_instant_at_exclusive_end_is_empty() {
        let build = range("2020-01-01", "2020-02-01");
        let at_build_end = plan_partitions(
            "orders",
            &range("2020-02-01", "2020-02-01"),
            &build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();
        assert!(at_build_end.is_empty());

        let at_build_start = plan_partitions(
            "orders",
            &range("2020-01-01", "2020-01-01"),
            &build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();
        assert_eq!(at_build_start.len(), 1);
        assert_eq!(at_build_start[0].partition_table_name, "orders20200101");

        // an instant build range at the end of the request is outside it too
        let instant_build = range("2020-02-01", "2020-02-01");
        let partitions = plan_partitions(
            "orders",
            &build,
            &instant_build,
            Some(Granularity::Month),
            Tz::UTC,
        )
        .unwrap();
        assert!(partitions.is_empty());
    }

    #[test]
    fn test_unpartitioned_rollup_is_one_table() {
        let build = range("2020-01-01", "2020-03-01");
        let partitions = plan_partitions(
            "orders_total",
            &range("2019-12-01", "2020-02-01"),
            &build,
            None,
            Tz::UTC,
        )
        .unwrap();

        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition_table_name, "orders_total");
        assert_eq!(partitions[0].range, range("2020-01-01", "2020-02-01"));
        assert_eq!(partitions[0].load_range, build);
        assert!(partitions[0].is_sealed());
    }

    #[test]
    fn test_partitions_follow_local_calendar() {
        let tz = chrono_tz::America::New_York;
        let requested = range("2024-03-09", "2024-03-12");
        let partitions =
            plan_partitions("t", &requested, &requested, Some(Granularity::Day), tz).unwrap();

        assert_eq!(partitions.len(), 3);
        // 2024-03-10 is 23 hours long
        let (start, end) = partitions[1].range_utc;
        assert_eq!(start.to_rfc3339(), "2024-03-10T05:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2024-03-11T04:00:00+00:00");
        assert_eq!(partitions[1].load_range_params().0, "2024-03-10T05:00:00.000Z");
    }

    #[test]
    fn test_week_buckets_start_on_local_monday() {
        let tz = chrono_tz::Asia::Kolkata;
        let build = range("2024-03-01", "2024-04-01");
        let partitions = plan_partitions(
            "t",
            &range("2024-03-13", "2024-03-20"),
            &build,
            Some(Granularity::Week),
            tz,
        )
        .unwrap();

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].bucket.start, at("2024-03-11T00:00:00"));
        assert_eq!(partitions[0].partition_table_name, "t20240311");
        assert_eq!(
            partitions[0].load_range_utc.0.to_rfc3339(),
            "2024-03-10T18:30:00+00:00"
        );
    }

    #[test]
    fn test_sub_day_suffixes() {
        let start = at("2024-01-02T03:04:00");
        assert_eq!(partition_table_name("t", Granularity::Hour, start), "t2024010203");
        assert_eq!(partition_table_name("t", Granularity::Minute, start), "t202401020304");
        assert_eq!(partition_table_name("t", Granularity::Quarter, start), "t20240102");
    }

    #[test]
    fn test_partition_limit() {
        let requested = range("2020-01-01", "2020-01-02");
        let err = plan_partitions_with_limit(
            "t",
            &requested,
            &requested,
            Some(Granularity::Hour),
            Tz::UTC,
            10,
        )
        .unwrap_err();
        assert!(matches!(err, RollupError::TooManyPartitions { max: 10, .. }));

        let exact = plan_partitions_with_limit(
            "t",
            &requested,
            &requested,
            Some(Granularity::Hour),
            Tz::UTC,
            24,
        )
        .unwrap();
        assert_eq!(exact.len(), 24);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let requested = range("2023-11-20", "2024-02-10");
        let plan = || {
            plan_partitions(
                "t",
                &requested,
                &requested,
                Some(Granularity::Week),
                chrono_tz::Europe::Berlin,
            )
            .unwrap()
        };
        assert_eq!(plan(), plan());
    }

    #[test]
    fn test_time_series() {
        let buckets = time_series(Granularity::Quarter, &range("2024-02-15", "2024-07-01"));
        assert_eq!(
            buckets,
            vec![
                range("2024-01-01", "2024-04-01"),
                range("2024-04-01", "2024-07-01"),
            ]
        );

        let instant = time_series(Granularity::Day, &range("2024-02-15", "2024-02-15"));
        assert_eq!(instant, vec![range("2024-02-15", "2024-02-16")]);
    }

    #[test]
    fn test_intersect_ranges() {
        let a = range("2024-01-01", "2024-02-01");
        assert_eq!(
            intersect_ranges(&a, &range("2024-01-15", "2024-03-01")),
            Some(range("2024-01-15", "2024-02-01"))
        );
        assert!(intersect_ranges(&a, &range("2024-02-01", "2024-03-01"))
            .unwrap()
            .is_instant());
        assert_eq!(intersect_ranges(&a, &range("2024-03-01", "2024-04-01")), None);
    }

    #[test]
    fn test_replace_partition_params() {
        let params = vec![
            json!(FROM_PARTITION_RANGE),
            json!("paid"),
            json!(TO_PARTITION_RANGE),
            json!(3),
        ];
        let replaced = replace_partition_params(
            &params,
            "2024-01-01T00:00:00.000Z",
            "2024-02-01T00:00:00.000Z",
        );
        assert_eq!(
            replaced,
            vec![
                json!("2024-01-01T00:00:00.000Z"),
                json!("paid"),
                json!("2024-02-01T00:00:00.000Z"),
                json!(3),
            ]
        );

        let sql = replace_partition_placeholders(
            "SELECT MAX(updated_at) FROM orders WHERE created_at >= __FROM_PARTITION_RANGE AND created_at < __TO_PARTITION_RANGE",
            "a",
            "b",
        );
        assert_eq!(
            sql,
            "SELECT MAX(updated_at) FROM orders WHERE created_at >= 'a' AND created_at < 'b'"
        );
    }
}

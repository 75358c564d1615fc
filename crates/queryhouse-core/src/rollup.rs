//! Rollup Model
//!
//! Definitions shared by the partition planner and the pre-aggregation
//! orchestrator:
//!
//! - [`Granularity`]: calendar unit used for both rollup rows and partitions
//! - [`TimeRange`]: half-open range of local wall-clock times
//! - [`RefreshKey`]: when a built partition is considered stale
//! - [`RollupDefinition`]: everything needed to build and query one rollup
//!
//! All times in a [`TimeRange`] are local to the rollup's timezone. They are
//! only converted to UTC at the edges (see [`crate::time`]).

use crate::error::{CoreError, Result};
use crate::query::CompiledQuery;
use chrono::{Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Calendar unit.
///
/// Weeks are ISO weeks starting on Monday; quarters start in January, April,
/// July and October.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Start of the bucket containing `t`.
    pub fn bucket_start(&self, t: NaiveDateTime) -> NaiveDateTime {
        let date = t.date();
        match self {
            Granularity::Second => t.with_nanosecond(0).unwrap_or(t),
            Granularity::Minute => date
                .and_hms_opt(t.hour(), t.minute(), 0)
                .unwrap_or(t),
            Granularity::Hour => date.and_hms_opt(t.hour(), 0, 0).unwrap_or(t),
            Granularity::Day => date.and_time(NaiveTime::MIN),
            Granularity::Week => {
                let offset = date.weekday().num_days_from_monday() as i64;
                (date - ChronoDuration::days(offset)).and_time(NaiveTime::MIN)
            }
            Granularity::Month => first_of_month(date.year(), date.month()),
            Granularity::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                first_of_month(date.year(), month)
            }
            Granularity::Year => first_of_month(date.year(), 1),
        }
    }

    /// Start of the bucket following the one that starts at `bucket_start`.
    pub fn next_bucket(&self, bucket_start: NaiveDateTime) -> NaiveDateTime {
        match self {
            Granularity::Second => bucket_start + ChronoDuration::seconds(1),
            Granularity::Minute => bucket_start + ChronoDuration::minutes(1),
            Granularity::Hour => bucket_start + ChronoDuration::hours(1),
            Granularity::Day => bucket_start + ChronoDuration::days(1),
            Granularity::Week => bucket_start + ChronoDuration::weeks(1),
            Granularity::Month => add_months(bucket_start, 1),
            Granularity::Quarter => add_months(bucket_start, 3),
            Granularity::Year => add_months(bucket_start, 12),
        }
    }

    /// Full bucket containing `t`.
    pub fn bucket_of(&self, t: NaiveDateTime) -> TimeRange {
        let start = self.bucket_start(t);
        TimeRange {
            start,
            end: self.next_bucket(start),
        }
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

fn add_months(t: NaiveDateTime, months: u32) -> NaiveDateTime {
    t.checked_add_months(Months::new(months)).unwrap_or(NaiveDateTime::MAX)
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            other => Err(CoreError::InvalidGranularity(other.to_string())),
        }
    }
}

/// Half-open range `[start, end)` of local wall-clock times.
///
/// A range with `start == end` denotes a single instant; the planner treats
/// it as touching the bucket that contains `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start > end {
            return Err(CoreError::InvalidRange {
                start: crate::time::format_local(start),
                end: crate::time::format_local(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse a range from two local timestamp strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(crate::time::parse_local(start)?, crate::time::parse_local(end)?)
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            crate::time::format_local(self.start),
            crate::time::format_local(self.end)
        )
    }
}

/// Staleness rule of a rollup.
///
/// `every` and `sql` are independent: a partition is stale when either the
/// interval bucket or the SQL result changed since it was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshKey {
    /// Rebuild once per interval
    #[serde(default)]
    pub every: Option<Duration>,

    /// SQL whose single-value result changes when the source data changes
    #[serde(default)]
    pub sql: Option<String>,

    /// Only rebuild partitions inside the update window
    #[serde(default)]
    pub incremental: bool,

    /// Partitions that ended more than this long ago are not rebuilt
    #[serde(default)]
    pub update_window: Option<Duration>,
}

/// Rollup (pre-aggregation) definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupDefinition {
    pub name: String,

    /// Base table name; partition tables append a date suffix
    pub table_name: String,

    pub data_source: String,

    #[serde(default)]
    pub measures: Vec<String>,

    #[serde(default)]
    pub dimensions: Vec<String>,

    #[serde(default)]
    pub time_dimension: Option<String>,

    /// Row granularity of the rollup itself
    #[serde(default)]
    pub granularity: Option<Granularity>,

    /// Partition size; `None` builds a single table
    #[serde(default)]
    pub partition_granularity: Option<Granularity>,

    /// IANA timezone the calendar buckets are aligned in
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub refresh_key: RefreshKey,

    /// Explicit build range
    #[serde(default)]
    pub build_range: Option<TimeRange>,

    /// Queries returning the first and last source timestamp
    #[serde(default)]
    pub build_range_queries: Option<(CompiledQuery, CompiledQuery)>,

    /// Load SQL with `__FROM_PARTITION_RANGE` / `__TO_PARTITION_RANGE` placeholders
    pub load_query: CompiledQuery,

    /// Serve the tail past the last sealed partition from the source
    #[serde(default)]
    pub union_with_source_data: bool,

    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl RollupDefinition {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| CoreError::InvalidTimezone(self.timezone.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        crate::time::parse_local(s).unwrap()
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("Month".parse::<Granularity>().unwrap(), Granularity::Month);
        assert_eq!("quarter".parse::<Granularity>().unwrap(), Granularity::Quarter);
        assert!("decade".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_week_starts_on_monday() {
        // 2024-03-14 is a Thursday
        let bucket = Granularity::Week.bucket_of(at("2024-03-14T15:30:00"));
        assert_eq!(bucket.start, at("2024-03-11T00:00:00"));
        assert_eq!(bucket.end, at("2024-03-18T00:00:00"));
    }

    #[test]
    fn test_quarter_boundaries() {
        let bucket = Granularity::Quarter.bucket_of(at("2024-05-20T00:00:00"));
        assert_eq!(bucket.start, at("2024-04-01T00:00:00"));
        assert_eq!(bucket.end, at("2024-07-01T00:00:00"));

        let last = Granularity::Quarter.bucket_of(at("2024-12-31T23:59:59"));
        assert_eq!(last.end, at("2025-01-01T00:00:00"));
    }

    #[test]
    fn test_month_handles_varying_lengths() {
        let feb = Granularity::Month.bucket_of(at("2024-02-29T12:00:00"));
        assert_eq!(feb.start, at("2024-02-01T00:00:00"));
        assert_eq!(feb.end, at("2024-03-01T00:00:00"));
    }

    #[test]
    fn test_sub_day_truncation() {
        let t = at("2024-01-01T10:42:17.250");
        assert_eq!(Granularity::Hour.bucket_start(t), at("2024-01-01T10:00:00"));
        assert_eq!(Granularity::Minute.bucket_start(t), at("2024-01-01T10:42:00"));
        assert_eq!(Granularity::Second.bucket_start(t), at("2024-01-01T10:42:17"));
    }

    #[test]
    fn test_time_range_rejects_inverted() {
        assert!(TimeRange::parse("2024-02-01", "2024-01-01").is_err());

        let instant = TimeRange::parse("2024-01-01", "2024-01-01").unwrap();
        assert!(instant.is_instant());
        assert!(!instant.contains(instant.start));
    }

    #[test]
    fn test_rollup_timezone() {
        let json = serde_json::json!({
            "name": "orders_by_day",
            "table_name": "orders_by_day",
            "data_source": "main",
            "timezone": "America/New_York",
            "load_query": { "data_source": "main", "sql": "SELECT 1" }
        });
        let rollup: RollupDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(rollup.tz().unwrap(), chrono_tz::America::New_York);
        assert!(rollup.partition_granularity.is_none());

        let mut bad = rollup.clone();
        bad.timezone = "Mars/Olympus".to_string();
        assert!(bad.tz().is_err());
    }
}

//! Clock and timestamp helpers.
//!
//! Local timestamps are formatted as `YYYY-MM-DDTHH:MM:SS.sss` without an
//! offset. Conversion to UTC follows two rules around DST transitions:
//! ambiguous local times resolve to the earliest instant and local times that
//! fall into a gap move forward to the first valid instant.

use crate::error::{CoreError, Result};
use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike,
    Utc,
};
use chrono_tz::Tz;

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Longest DST gap we walk across before giving up.
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn format_local(t: NaiveDateTime) -> String {
    t.format(LOCAL_FORMAT).to_string()
}

/// UTC instant as `YYYY-MM-DDTHH:MM:SS.sssZ`, the form partition
/// parameters are bound with.
pub fn format_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp reported by a data source as a UTC instant.
///
/// RFC 3339 strings keep their offset; timestamps without one are UTC.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(t.with_timezone(&Utc));
    }
    parse_local(s).map(|t| t.and_utc())
}

/// Parse a local timestamp.
///
/// Accepts `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS[.fff]` and the same with a
/// space separator. A trailing `Z` is ignored.
pub fn parse_local(s: &str) -> Result<NaiveDateTime> {
    let trimmed = s.trim().trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(t);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| CoreError::InvalidTimestamp(s.to_string()))
}

/// Convert a local wall-clock time in `tz` to a UTC instant.
pub fn local_to_utc(t: NaiveDateTime, tz: Tz) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&t) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let mut probe = t.with_second(0).and_then(|p| p.with_nanosecond(0)).unwrap_or(t);
            for _ in 0..MAX_GAP_MINUTES {
                probe += Duration::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            Err(CoreError::InvalidTimestamp(format!(
                "{} does not exist in {}",
                format_local(t),
                tz
            )))
        }
    }
}

/// Wall-clock time of a UTC instant in `tz`.
pub fn utc_to_local(t: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    t.with_timezone(&tz).naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(10, 30, 0, 500)
            .unwrap();
        assert_eq!(parse_local("2024-03-01T10:30:00.500").unwrap(), expected);
        assert_eq!(parse_local("2024-03-01 10:30:00.5").unwrap(), expected);
        assert_eq!(parse_local("2024-03-01T10:30:00.500Z").unwrap(), expected);
        assert_eq!(
            parse_local("2024-03-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
        assert!(parse_local("yesterday").is_err());
    }

    #[test]
    fn test_format_local() {
        let t = parse_local("2024-03-01T10:30:00").unwrap();
        assert_eq!(format_local(t), "2024-03-01T10:30:00.000");
    }

    #[test]
    fn test_utc_formats() {
        let t = parse_utc("2024-03-01T10:30:00+02:00").unwrap();
        assert_eq!(format_utc(t), "2024-03-01T08:30:00.000Z");
        assert_eq!(
            format_utc(parse_utc("2024-03-01 08:30:00").unwrap()),
            "2024-03-01T08:30:00.000Z"
        );
        assert!(parse_utc("").is_err());
    }

    #[test]
    fn test_ambiguous_local_time_resolves_to_earliest() {
        // 01:30 happens twice on 2024-11-03 in New York
        let tz = chrono_tz::America::New_York;
        let utc = local_to_utc(parse_local("2024-11-03T01:30:00").unwrap(), tz).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-11-03T05:30:00+00:00");
    }

    #[test]
    fn test_gap_local_time_moves_forward() {
        // 02:30 does not exist on 2024-03-10 in New York; clocks jump to 03:00 EDT
        let tz = chrono_tz::America::New_York;
        let utc = local_to_utc(parse_local("2024-03-10T02:30:00").unwrap(), tz).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-03-10T07:00:00+00:00");
    }

    #[test]
    fn test_utc_round_trip_outside_transitions() {
        let tz = chrono_tz::Europe::Berlin;
        let local = parse_local("2024-06-15T12:00:00").unwrap();
        let utc = local_to_utc(local, tz).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-06-15T10:00:00+00:00");
        assert_eq!(utc_to_local(utc, tz), local);
    }
}

//! Service-date derivation and local time helpers.
//!
//! Transit service days run past midnight, so a timestamp before the
//! configured day-start hour belongs to the previous civil date.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Assigns a service date to a local wall-clock time.
pub fn derive_service_date(local: NaiveDateTime, day_start_hour: u32) -> NaiveDate {
    let date = local.date();
    if local.hour() >= day_start_hour {
        date
    } else {
        date.pred_opt().unwrap_or(date)
    }
}

/// Assigns a service date to a UTC instant as seen in `tz`.
pub fn service_date_of(instant: DateTime<Utc>, tz: Tz, day_start_hour: u32) -> NaiveDate {
    derive_service_date(instant.with_timezone(&tz).naive_local(), day_start_hour)
}

/// Parses a GTFS `YYYYMMDD` date.
pub fn parse_gtfs_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// Converts a naive local time to UTC.
///
/// Ambiguous times (clocks falling back) resolve to the earlier instant;
/// times skipped by a spring-forward transition have no instant.
pub fn local_to_utc(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolves a GTFS seconds-past-origin offset to an instant.
///
/// The origin is noon minus 12 hours on the service date, which keeps
/// offsets correct on daylight-saving transition days.
pub fn service_day_offset(service_date: NaiveDate, secs: i64, tz: Tz) -> Option<DateTime<Utc>> {
    let noon = service_date.and_hms_opt(12, 0, 0)?;
    let noon = tz.from_local_datetime(&noon).single()?;
    Some((noon - Duration::hours(12) + Duration::seconds(secs)).with_timezone(&Utc))
}

/// Whole seconds from `earlier` to `later`, differenced in local time.
pub fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>, tz: Tz) -> i64 {
    (later.with_timezone(&tz) - earlier.with_timezone(&tz)).num_seconds()
}

/// Inclusive list of dates from `start` to `end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_before_boundary_belongs_to_previous_day() {
        assert_eq!(
            derive_service_date(at("2024-06-02", "02:59:59"), 3),
            date("2024-06-01")
        );
    }

    #[test]
    fn test_at_boundary_belongs_to_same_day() {
        assert_eq!(derive_service_date(at("2024-06-02", "03:00:00"), 3), date("2024-06-02"));
        assert_eq!(derive_service_date(at("2024-06-02", "23:10:00"), 3), date("2024-06-02"));
    }

    #[test]
    fn test_service_date_of_utc_instant() {
        // 06:30 UTC is 02:30 EDT
        let instant = Utc.with_ymd_and_hms(2024, 6, 2, 6, 30, 0).unwrap();
        assert_eq!(service_date_of(instant, New_York, 3), date("2024-06-01"));
    }

    #[test]
    fn test_parse_gtfs_date() {
        assert_eq!(parse_gtfs_date("20240601"), Some(date("2024-06-01")));
        assert_eq!(parse_gtfs_date("2024-06-01"), None);
    }

    #[test]
    fn test_local_to_utc_ambiguous_takes_earlier() {
        // 01:30 happens twice on 2024-11-03 in New York
        let instant = local_to_utc(at("2024-11-03", "01:30:00"), New_York).unwrap();
        assert_eq!(instant, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_local_to_utc_skipped_time_is_none() {
        assert_eq!(local_to_utc(at("2024-03-10", "02:30:00"), New_York), None);
    }

    #[test]
    fn test_service_day_offset_on_spring_forward() {
        // noon local on the transition day is still 12h after the origin
        let noon = service_day_offset(date("2024-03-10"), 12 * 3600, New_York).unwrap();
        assert_eq!(noon, Utc.with_ymd_and_hms(2024, 3, 10, 16, 0, 0).unwrap());
    }

    #[test]
    fn test_seconds_between_across_dst() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 10, 6, 50, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 3, 10, 7, 10, 0).unwrap();
        assert_eq!(seconds_between(later, earlier, New_York), 1200);
    }

    #[test]
    fn test_date_range_inclusive() {
        let days = date_range(date("2024-06-01"), date("2024-06-03"));
        assert_eq!(days.len(), 3);
        assert!(date_range(date("2024-06-03"), date("2024-06-01")).is_empty());
    }
}

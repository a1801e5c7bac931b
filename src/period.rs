//! Day, week and month buckets in a fixed local offset.
//!
//! Raw timestamps are stored in UTC. A bucket is computed by moving the
//! reference instant into local time, truncating to the local boundary and
//! moving the boundary back to UTC, so records near local midnight land in
//! the right day regardless of the host locale.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StatsError;

/// Offsets outside UTC-14:00..UTC+14:00 do not exist.
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Day,
    Week,
    Month,
}

impl PeriodKind {
    pub const ALL: [PeriodKind; 3] = [PeriodKind::Day, PeriodKind::Week, PeriodKind::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodKind::Day => "day",
            PeriodKind::Week => "week",
            PeriodKind::Month => "month",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodKind {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(PeriodKind::Day),
            "week" => Ok(PeriodKind::Week),
            "month" => Ok(PeriodKind::Month),
            other => Err(StatsError::InvalidValue {
                kind: "period",
                value: other.to_string(),
            }),
        }
    }
}

/// Half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub kind: PeriodKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// The three windows of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodSet {
    pub day: PeriodWindow,
    pub week: PeriodWindow,
    pub month: PeriodWindow,
}

impl PeriodSet {
    pub fn get(&self, kind: PeriodKind) -> PeriodWindow {
        match kind {
            PeriodKind::Day => self.day,
            PeriodKind::Week => self.week,
            PeriodKind::Month => self.month,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PeriodWindow> + '_ {
        PeriodKind::ALL.into_iter().map(|kind| self.get(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodCalculator {
    offset: FixedOffset,
}

impl PeriodCalculator {
    pub fn new(offset_minutes: i32) -> Result<Self, StatsError> {
        if offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(StatsError::Config(format!(
                "timezone offset {offset_minutes} minutes is out of range"
            )));
        }
        let offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            StatsError::Config(format!("timezone offset {offset_minutes} minutes is invalid"))
        })?;
        Ok(Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    /// Calendar date of `at` in local time.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn windows(&self, at: DateTime<Utc>) -> PeriodSet {
        PeriodSet {
            day: self.window(PeriodKind::Day, at),
            week: self.window(PeriodKind::Week, at),
            month: self.window(PeriodKind::Month, at),
        }
    }

    pub fn window(&self, kind: PeriodKind, at: DateTime<Utc>) -> PeriodWindow {
        let today = self.local_date(at);
        let (first, next) = match kind {
            PeriodKind::Day => (today, today + Duration::days(1)),
            PeriodKind::Week => {
                let back = today.weekday().num_days_from_monday() as i64;
                let monday = today - Duration::days(back);
                (monday, monday + Duration::days(7))
            }
            PeriodKind::Month => {
                let first = today - Duration::days(today.day0() as i64);
                let next = first
                    .checked_add_months(Months::new(1))
                    .unwrap_or(NaiveDate::MAX);
                (first, next)
            }
        };
        PeriodWindow {
            kind,
            start: self.local_midnight_utc(first),
            end: self.local_midnight_utc(next),
        }
    }

    fn local_midnight_utc(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::MIN);
        (local - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn bangkok() -> PeriodCalculator {
        PeriodCalculator::new(7 * 60).unwrap()
    }

    #[test]
    fn day_window_follows_local_midnight() {
        // 2025-03-04 18:30 UTC is already 2025-03-05 01:30 in UTC+7.
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 18, 30, 0).unwrap();
        let day = bangkok().window(PeriodKind::Day, at);

        assert_eq!(day.start, Utc.with_ymd_and_hms(2025, 3, 4, 17, 0, 0).unwrap());
        assert_eq!(day.end, Utc.with_ymd_and_hms(2025, 3, 5, 17, 0, 0).unwrap());
    }

    #[test]
    fn half_open_boundaries() {
        let at = Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap();
        let day = bangkok().window(PeriodKind::Day, at);

        assert!(day.contains(day.start));
        assert!(!day.contains(day.end));
        assert!(!day.contains(day.start - Duration::seconds(1)));
        assert!(day.contains(day.end - Duration::seconds(1)));
    }

    #[test]
    fn week_starts_on_local_monday() {
        let calc = bangkok();
        let mut at = Utc.with_ymd_and_hms(2024, 12, 25, 0, 0, 0).unwrap();
        for _ in 0..40 {
            let week = calc.window(PeriodKind::Week, at);
            let local_start = week.start.with_timezone(&calc.offset);

            assert_eq!(local_start.weekday(), Weekday::Mon);
            assert_eq!(local_start.time(), NaiveTime::MIN);
            assert_eq!(week.end - week.start, Duration::days(7));
            assert!(week.contains(at));
            at += Duration::hours(13);
        }
    }

    #[test]
    fn sunday_late_night_belongs_to_previous_week() {
        // Sunday 2025-03-09 23:59 local.
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 16, 59, 0).unwrap();
        let week = bangkok().window(PeriodKind::Week, at);
        assert_eq!(week.start, Utc.with_ymd_and_hms(2025, 3, 2, 17, 0, 0).unwrap());
    }

    #[test]
    fn month_window_handles_year_end_and_leap_years() {
        let calc = bangkok();

        let dec = calc.window(
            PeriodKind::Month,
            Utc.with_ymd_and_hms(2024, 12, 31, 20, 0, 0).unwrap(),
        );
        // Already January 1st locally.
        assert_eq!(dec.start, Utc.with_ymd_and_hms(2024, 12, 31, 17, 0, 0).unwrap());
        assert_eq!(dec.end, Utc.with_ymd_and_hms(2025, 1, 31, 17, 0, 0).unwrap());

        let feb = calc.window(
            PeriodKind::Month,
            Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap(),
        );
        assert_eq!(feb.end - feb.start, Duration::days(29));

        let feb = calc.window(
            PeriodKind::Month,
            Utc.with_ymd_and_hms(2100, 2, 10, 0, 0, 0).unwrap(),
        );
        assert_eq!(feb.end - feb.start, Duration::days(28));

        let april = calc.window(
            PeriodKind::Month,
            Utc.with_ymd_and_hms(2025, 4, 30, 16, 59, 59).unwrap(),
        );
        assert_eq!(april.end, Utc.with_ymd_and_hms(2025, 4, 30, 17, 0, 0).unwrap());
        assert_eq!(april.end - april.start, Duration::days(30));
    }

    #[test]
    fn negative_offsets_work() {
        let calc = PeriodCalculator::new(-5 * 60).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        let day = calc.window(PeriodKind::Day, at);
        assert_eq!(day.start, Utc.with_ymd_and_hms(2025, 5, 31, 5, 0, 0).unwrap());
    }

    #[test]
    fn rejects_impossible_offsets() {
        assert!(PeriodCalculator::new(15 * 60).is_err());
    }

    #[test]
    fn windows_share_reference_instant() {
        let at = Utc.with_ymd_and_hms(2025, 3, 5, 3, 0, 0).unwrap();
        let set = bangkok().windows(at);
        for window in set.iter() {
            assert!(window.contains(at));
        }
        assert_eq!(set.get(PeriodKind::Week), set.week);
    }

    #[test]
    fn period_kind_parses() {
        assert_eq!("week".parse::<PeriodKind>().unwrap(), PeriodKind::Week);
        assert!("year".parse::<PeriodKind>().is_err());
    }
}

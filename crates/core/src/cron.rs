//! Five-field cron descriptors for scheduled services.
//!
//! Format: `minute hour day-of-month month day-of-week`, each field accepting
//! `*`, numbers, ranges (`a-b`), lists (`a,b`) and steps (`*/n`, `a-b/n`).
//! Day-of-week runs 0-7 with both 0 and 7 meaning Sunday. When both day fields
//! are restricted a day matches if either matches, as in classic cron.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Upper bound on the search for the next fire time.
const MAX_LOOKAHEAD_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
    source: String,
}

impl CronSchedule {
    pub fn parse(descriptor: &str) -> Result<Self, CoreError> {
        let fields: Vec<&str> = descriptor.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(CoreError::Validation(format!(
                "Cron descriptor '{descriptor}' must have 5 fields"
            )));
        };

        let mut days_of_week = parse_field(dow, 0, 7, "day-of-week")?;
        // 7 is an alias for Sunday.
        if days_of_week[7] {
            days_of_week[0] = true;
        }
        days_of_week.truncate(7);

        Ok(Self {
            minutes: parse_field(minute, 0, 59, "minute")?,
            hours: parse_field(hour, 0, 23, "hour")?,
            days_of_month: parse_field(dom, 1, 31, "day-of-month")?,
            months: parse_field(month, 1, 12, "month")?,
            days_of_week,
            dom_restricted: *dom != "*",
            dow_restricted: *dow != "*",
            source: descriptor.to_string(),
        })
    }

    pub fn descriptor(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .map(|t| t + Duration::minutes(1))?;

        let first_day = start.date_naive();
        for offset in 0..MAX_LOOKAHEAD_DAYS {
            let day = first_day + Duration::days(offset);
            if !self.day_matches(day) {
                continue;
            }
            let from = if offset == 0 {
                start.time()
            } else {
                NaiveTime::default()
            };
            if let Some(time) = self.first_time_from(from) {
                return Some(Utc.from_utc_datetime(&day.and_time(time)));
            }
        }
        None
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        if !self.months[day.month() as usize] {
            return false;
        }
        let dom = self.days_of_month[day.day() as usize];
        let dow = self.days_of_week[day.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn first_time_from(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in from.hour()..24 {
            if !self.hours[hour as usize] {
                continue;
            }
            let first_minute = if hour == from.hour() { from.minute() } else { 0 };
            for minute in first_minute..60 {
                if self.minutes[minute as usize] {
                    return NaiveTime::from_hms_opt(hour, minute, 0);
                }
            }
        }
        None
    }
}

/// Parse one field into a membership table indexed by value.
fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<Vec<bool>, CoreError> {
    let invalid = || CoreError::Validation(format!("Invalid cron {name} field '{field}'"));
    let mut table = vec![false; max as usize + 1];

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                lo.parse().map_err(|_| invalid())?,
                hi.parse().map_err(|_| invalid())?,
            )
        } else {
            let value: u32 = range.parse().map_err(|_| invalid())?;
            // `5/15` means "from 5 to the end, every 15".
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid());
        }
        for value in (lo..=hi).step_by(step as usize) {
            table[value as usize] = true;
        }
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    // -- parsing -------------------------------------------------------------

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("* * * * * *").is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * 13 *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
    }

    // -- next_after ----------------------------------------------------------

    #[test]
    fn every_minute_fires_next_minute() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let base = at(2024, 3, 1, 10, 15) + Duration::seconds(42);
        assert_eq!(cron.next_after(base), Some(at(2024, 3, 1, 10, 16)));
    }

    #[test]
    fn step_minutes() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 10, 15)), Some(at(2024, 3, 1, 10, 30)));
        assert_eq!(cron.next_after(at(2024, 3, 1, 10, 50)), Some(at(2024, 3, 1, 11, 0)));
    }

    #[test]
    fn daily_at_fixed_time_rolls_to_tomorrow() {
        let cron = CronSchedule::parse("30 2 * * *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 2, 30)), Some(at(2024, 3, 2, 2, 30)));
    }

    #[test]
    fn weekday_ranges() {
        // 2024-03-02 is a Saturday.
        let cron = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 2, 12, 0)), Some(at(2024, 3, 4, 9, 0)));
    }

    #[test]
    fn sunday_alias_seven() {
        let cron = CronSchedule::parse("0 0 * * 7").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 0, 0)), Some(at(2024, 3, 3, 0, 0)));
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        // 1st of the month OR any Monday.
        let cron = CronSchedule::parse("0 0 1 * 1").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 2, 0, 0)), Some(at(2024, 3, 4, 0, 0)));
        assert_eq!(cron.next_after(at(2024, 3, 29, 0, 0)), Some(at(2024, 4, 1, 0, 0)));
    }

    #[test]
    fn leap_day_schedule_skips_years() {
        let cron = CronSchedule::parse("0 12 29 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 12, 0)));
    }

    #[test]
    fn impossible_date_never_fires() {
        let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2024, 1, 1, 0, 0)), None);
    }
}

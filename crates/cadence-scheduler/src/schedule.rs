//! Recurrence arithmetic. Pure functions only: no clock reads, no I/O.
//!
//! All calendar fields are evaluated in the anchor's own offset and the
//! anchor's time of day is carried onto every computed occurrence.

use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, Utc, Weekday};

use crate::types::{MonthlyRule, Ordinal, RecurrencePattern, SeriesEnd};

/// Compute the occurrence that follows `anchor` under `pattern`.
///
/// Returns `None` for completion-driven patterns (they are re-armed by the
/// completion reactor, not by the calendar) and when the result would fall
/// outside chrono's representable range.
pub fn next_occurrence(
    pattern: &RecurrencePattern,
    anchor: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    let date = anchor.date_naive();

    let next_date = match pattern {
        RecurrencePattern::Daily { interval, .. } => {
            date.checked_add_days(Days::new(u64::from(*interval)))?
        }

        RecurrencePattern::Weekly {
            interval, weekdays, ..
        } => next_weekly_date(date, *interval, weekdays)?,

        RecurrencePattern::Monthly { interval, rule, .. } => {
            let (year, month) = shift_month(date.year(), date.month(), *interval)?;
            match rule {
                MonthlyRule::DayOfMonth { day } => {
                    // Clamp against the target month, never the anchor's.
                    let day = (*day).min(days_in_month(year, month)?);
                    NaiveDate::from_ymd_opt(year, month, day)?
                }
                MonthlyRule::OrdinalWeekday { ordinal, weekday } => {
                    ordinal_weekday(year, month, *ordinal, *weekday)?
                }
            }
        }

        // Feb 29 lands on Feb 28 in non-leap target years.
        RecurrencePattern::Yearly { interval, .. } => {
            date.checked_add_months(Months::new(interval.checked_mul(12)?))?
        }

        RecurrencePattern::RegenerateAfterCompletion { .. } => return None,
    };

    at_anchor_time(&anchor, next_date)
}

/// Decide whether the occurrence that would follow the current one ends the series.
///
/// `count_after` is the materialized count including the instance being
/// created now; `candidate` is the occurrence that would come next.
pub fn series_should_end(end: &SeriesEnd, count_after: u32, candidate: DateTime<Utc>) -> bool {
    match end {
        SeriesEnd::Never => false,
        SeriesEnd::EndBy { date } => candidate > *date,
        SeriesEnd::EndAfter { count } => count_after >= *count,
    }
}

/// First cursor for a series that may start at `start`.
///
/// Weekly patterns seek forward to the first listed weekday (`start` itself
/// qualifies); every other pattern starts exactly at `start`.
pub fn initial_occurrence(
    pattern: &RecurrencePattern,
    start: DateTime<FixedOffset>,
) -> DateTime<FixedOffset> {
    let RecurrencePattern::Weekly { weekdays, .. } = pattern else {
        return start;
    };
    let date = start.date_naive();
    (0..7u64)
        .filter_map(|n| date.checked_add_days(Days::new(n)))
        .find(|d| weekdays.contains(&d.weekday()))
        .and_then(|d| at_anchor_time(&start, d))
        .unwrap_or(start)
}

/// Add calendar months, clamping the day to the target month's length.
pub fn add_months(at: DateTime<FixedOffset>, months: u32) -> Option<DateTime<FixedOffset>> {
    at.checked_add_months(Months::new(months))
}

// --- private helpers -------------------------------------------------------

/// Remaining days of the anchor's (Monday-based) week first, then the week
/// `interval` weeks after the anchor's week.
fn next_weekly_date(date: NaiveDate, interval: u32, weekdays: &[Weekday]) -> Option<NaiveDate> {
    let from_monday = u64::from(date.weekday().num_days_from_monday());

    for n in 1..(7 - from_monday) {
        let d = date.checked_add_days(Days::new(n))?;
        if weekdays.contains(&d.weekday()) {
            return Some(d);
        }
    }

    let week_start = date
        .checked_sub_days(Days::new(from_monday))?
        .checked_add_days(Days::new(7 * u64::from(interval)))?;
    for n in 0..7 {
        let d = week_start.checked_add_days(Days::new(n))?;
        if weekdays.contains(&d.weekday()) {
            return Some(d);
        }
    }

    // Only reachable with an empty weekday set, which validation rejects.
    date.checked_add_days(Days::new(7 * u64::from(interval)))
}

fn ordinal_weekday(year: i32, month: u32, ordinal: Ordinal, weekday: Weekday) -> Option<NaiveDate> {
    let target = weekday.num_days_from_monday();

    match ordinal.week_index() {
        Some(index) => {
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            let lead = (target + 7 - first.weekday().num_days_from_monday()) % 7;
            // Worst case is day 1 + 6 + 21 = 28, always inside the month.
            first.checked_add_days(Days::new(u64::from(lead + index * 7)))
        }
        None => {
            let last = NaiveDate::from_ymd_opt(year, month, days_in_month(year, month)?)?;
            let back = (last.weekday().num_days_from_monday() + 7 - target) % 7;
            let candidate = last.checked_sub_days(Days::new(u64::from(back)))?;
            if candidate.month() == month {
                Some(candidate)
            } else {
                candidate.checked_sub_days(Days::new(7))
            }
        }
    }
}

fn shift_month(year: i32, month: u32, by: u32) -> Option<(i32, u32)> {
    let zero_based = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(by);
    let year = i32::try_from(zero_based.div_euclid(12)).ok()?;
    let month = u32::try_from(zero_based.rem_euclid(12)).ok()? + 1;
    Some((year, month))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = first.checked_add_months(Months::new(1))?;
    u32::try_from(next.signed_duration_since(first).num_days()).ok()
}

fn at_anchor_time(anchor: &DateTime<FixedOffset>, date: NaiveDate) -> Option<DateTime<FixedOffset>> {
    date.and_time(anchor.time())
        .and_local_timezone(*anchor.offset())
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(y, m, d, 9, 0, 0)
            .unwrap()
    }

    fn day_of_month(day: u32) -> RecurrencePattern {
        RecurrencePattern::Monthly {
            interval: 1,
            rule: MonthlyRule::DayOfMonth { day },
            end: SeriesEnd::Never,
        }
    }

    fn weekly(interval: u32, weekdays: &[Weekday]) -> RecurrencePattern {
        RecurrencePattern::Weekly {
            interval,
            weekdays: weekdays.to_vec(),
            end: SeriesEnd::Never,
        }
    }

    #[test]
    fn same_input_same_output() {
        let p = weekly(3, &[Weekday::Tue, Weekday::Sat]);
        let a = utc(2024, 5, 14);
        assert_eq!(next_occurrence(&p, a), next_occurrence(&p, a));
    }

    #[test]
    fn daily_adds_interval_days() {
        let p = RecurrencePattern::Daily {
            interval: 3,
            end: SeriesEnd::Never,
        };
        assert_eq!(next_occurrence(&p, utc(2024, 2, 27)), Some(utc(2024, 3, 1)));
    }

    #[test]
    fn month_end_clamps_then_recovers() {
        let p = day_of_month(31);
        let feb = next_occurrence(&p, utc(2024, 1, 31)).unwrap();
        assert_eq!(feb, utc(2024, 2, 29));
        // clamping must not stick
        assert_eq!(next_occurrence(&p, feb), Some(utc(2024, 3, 31)));

        assert_eq!(next_occurrence(&p, utc(2023, 1, 31)), Some(utc(2023, 2, 28)));
    }

    #[test]
    fn month_interval_crosses_year() {
        let p = RecurrencePattern::Monthly {
            interval: 3,
            rule: MonthlyRule::DayOfMonth { day: 30 },
            end: SeriesEnd::Never,
        };
        assert_eq!(next_occurrence(&p, utc(2023, 11, 30)), Some(utc(2024, 2, 29)));
    }

    #[test]
    fn last_friday_stays_in_target_month() {
        let p = RecurrencePattern::Monthly {
            interval: 1,
            rule: MonthlyRule::OrdinalWeekday {
                ordinal: Ordinal::Last,
                weekday: Weekday::Fri,
            },
            end: SeriesEnd::Never,
        };
        // Feb 2024: first Friday is the 2nd, so "first + 4 weeks" would be Mar 1.
        assert_eq!(next_occurrence(&p, utc(2024, 1, 26)), Some(utc(2024, 2, 23)));
        // May 2024 has five Fridays; the last one is the 31st.
        assert_eq!(next_occurrence(&p, utc(2024, 4, 26)), Some(utc(2024, 5, 31)));
    }

    #[test]
    fn second_tuesday_every_other_month() {
        let p = RecurrencePattern::Monthly {
            interval: 2,
            rule: MonthlyRule::OrdinalWeekday {
                ordinal: Ordinal::Second,
                weekday: Weekday::Tue,
            },
            end: SeriesEnd::Never,
        };
        // March 2024 starts on a Friday: Tuesdays are 5, 12, 19, 26.
        assert_eq!(next_occurrence(&p, utc(2024, 1, 9)), Some(utc(2024, 3, 12)));
    }

    #[test]
    fn fourth_weekday_when_month_starts_on_it() {
        let p = RecurrencePattern::Monthly {
            interval: 1,
            rule: MonthlyRule::OrdinalWeekday {
                ordinal: Ordinal::Fourth,
                weekday: Weekday::Mon,
            },
            end: SeriesEnd::Never,
        };
        // April 2024 starts on a Monday.
        assert_eq!(next_occurrence(&p, utc(2024, 3, 25)), Some(utc(2024, 4, 22)));
    }

    #[test]
    fn biweekly_monday_skips_a_full_week() {
        let p = weekly(2, &[Weekday::Mon]);
        // 2024-01-01 is a Monday
        assert_eq!(next_occurrence(&p, utc(2024, 1, 1)), Some(utc(2024, 1, 15)));
    }

    #[test]
    fn weekly_prefers_remaining_days_of_current_week() {
        let p = weekly(2, &[Weekday::Mon, Weekday::Wed]);
        assert_eq!(next_occurrence(&p, utc(2024, 1, 1)), Some(utc(2024, 1, 3)));
        assert_eq!(next_occurrence(&p, utc(2024, 1, 3)), Some(utc(2024, 1, 15)));
    }

    #[test]
    fn weekly_interval_one_matches_plain_scan() {
        let p = weekly(1, &[Weekday::Mon]);
        // Wednesday -> following Monday
        assert_eq!(next_occurrence(&p, utc(2024, 1, 3)), Some(utc(2024, 1, 8)));
        // Sunday -> next day
        assert_eq!(next_occurrence(&p, utc(2024, 1, 7)), Some(utc(2024, 1, 8)));
    }

    #[test]
    fn empty_weekday_set_falls_back_to_whole_weeks() {
        let p = weekly(2, &[]);
        assert_eq!(next_occurrence(&p, utc(2024, 1, 3)), Some(utc(2024, 1, 17)));
    }

    #[test]
    fn yearly_leap_day_clamps() {
        let p = RecurrencePattern::Yearly {
            interval: 1,
            end: SeriesEnd::Never,
        };
        assert_eq!(next_occurrence(&p, utc(2024, 2, 29)), Some(utc(2025, 2, 28)));
        assert_eq!(next_occurrence(&p, utc(2024, 7, 4)), Some(utc(2025, 7, 4)));
    }

    #[test]
    fn completion_driven_has_no_calendar_successor() {
        let p = RecurrencePattern::RegenerateAfterCompletion { months_after: 1 };
        assert_eq!(next_occurrence(&p, utc(2024, 1, 1)), None);
    }

    #[test]
    fn calendar_fields_follow_the_anchor_offset() {
        // 23:30 at -05:00 on Jan 31 is already Feb 1 in UTC.
        let est = FixedOffset::west_opt(5 * 3600).unwrap();
        let anchor = est.with_ymd_and_hms(2024, 1, 31, 23, 30, 0).unwrap();
        let next = next_occurrence(&day_of_month(31), anchor).unwrap();
        assert_eq!(next, est.with_ymd_and_hms(2024, 2, 29, 23, 30, 0).unwrap());
    }

    #[test]
    fn series_end_rules() {
        let c = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(!series_should_end(&SeriesEnd::Never, 1_000, c));

        let by = SeriesEnd::EndBy {
            date: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        };
        assert!(!series_should_end(&by, 1, c));
        assert!(series_should_end(&by, 1, c + chrono::Duration::seconds(1)));

        let after = SeriesEnd::EndAfter { count: 3 };
        assert!(!series_should_end(&after, 2, c));
        assert!(series_should_end(&after, 3, c));
    }

    #[test]
    fn initial_occurrence_seeks_weekday_for_weekly_only() {
        let p = weekly(1, &[Weekday::Fri]);
        // 2024-01-03 is a Wednesday
        assert_eq!(initial_occurrence(&p, utc(2024, 1, 3)), utc(2024, 1, 5));
        assert_eq!(initial_occurrence(&p, utc(2024, 1, 5)), utc(2024, 1, 5));

        let d = day_of_month(15);
        assert_eq!(initial_occurrence(&d, utc(2024, 1, 3)), utc(2024, 1, 3));
    }

    #[test]
    fn add_months_clamps_day() {
        assert_eq!(add_months(utc(2024, 1, 31), 1), Some(utc(2024, 2, 29)));
        assert_eq!(add_months(utc(2024, 11, 15), 2), Some(utc(2025, 1, 15)));
    }
}

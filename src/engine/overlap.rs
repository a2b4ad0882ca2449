//! Interval-intersection checks shared by slot creation, slot updates, and
//! config validation. Time windows are half-open `[start, end)`; date ranges
//! are inclusive on both ends.

use chrono::{NaiveDate, NaiveTime, Timelike};

/// Strict half-open overlap test for time-of-day windows.
pub fn times_overlap(
    a_start: NaiveTime,
    a_end: NaiveTime,
    b_start: NaiveTime,
    b_end: NaiveTime,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// Inclusive overlap test for date ranges. `None` ends mean open-ended and
/// resolve to the maximum representable date.
pub fn date_ranges_overlap(
    a_start: NaiveDate,
    a_end: Option<NaiveDate>,
    b_start: NaiveDate,
    b_end: Option<NaiveDate>,
) -> bool {
    let a_end = a_end.unwrap_or(NaiveDate::MAX);
    let b_end = b_end.unwrap_or(NaiveDate::MAX);
    a_start <= b_end && a_end >= b_start
}

/// Minutes since midnight. Sub-minute precision is dropped; the engine only
/// deals in whole-minute boundaries.
pub fn minutes_of(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

/// Inverse of `minutes_of`. `m` must be within a day.
pub fn time_from_minutes(m: u32) -> NaiveTime {
    NaiveTime::from_num_seconds_from_midnight_opt(m * 60, 0)
        .expect("minute offset within a day")
}

/// A minute-granular window `[start, end)` within one day.
pub type MinuteWindow = (u32, u32);

/// Subtract `blocked` windows from `base`, returning the remaining free
/// windows in order. `blocked` must be sorted by start.
pub fn subtract_windows(base: MinuteWindow, blocked: &[MinuteWindow]) -> Vec<MinuteWindow> {
    let (mut cursor, end) = base;
    let mut free = Vec::new();

    for &(b_start, b_end) in blocked {
        if b_end <= cursor {
            continue;
        }
        if b_start >= end {
            break;
        }
        if b_start > cursor {
            free.push((cursor, b_start));
        }
        cursor = cursor.max(b_end);
    }

    if cursor < end {
        free.push((cursor, end));
    }

    free
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn time_overlap_half_open() {
        assert!(times_overlap(t(9, 0), t(10, 0), t(9, 30), t(10, 30)));
        assert!(times_overlap(t(9, 0), t(10, 0), t(8, 0), t(9, 1)));
        // Adjacent windows share a boundary, not time
        assert!(!times_overlap(t(9, 0), t(10, 0), t(10, 0), t(11, 0)));
        assert!(!times_overlap(t(9, 0), t(10, 0), t(8, 0), t(9, 0)));
    }

    #[test]
    fn time_overlap_containment() {
        assert!(times_overlap(t(9, 0), t(17, 0), t(12, 0), t(13, 0)));
        assert!(times_overlap(t(12, 0), t(13, 0), t(9, 0), t(17, 0)));
    }

    #[test]
    fn date_overlap_inclusive() {
        // Ranges sharing a single day overlap
        assert!(date_ranges_overlap(
            d(2024, 1, 1),
            Some(d(2024, 1, 10)),
            d(2024, 1, 10),
            Some(d(2024, 1, 20)),
        ));
        assert!(!date_ranges_overlap(
            d(2024, 1, 1),
            Some(d(2024, 1, 9)),
            d(2024, 1, 10),
            Some(d(2024, 1, 20)),
        ));
    }

    #[test]
    fn date_overlap_open_ended() {
        // Open-ended range swallows any later start
        assert!(date_ranges_overlap(
            d(2024, 1, 1),
            None,
            d(2024, 6, 1),
            Some(d(2024, 6, 30)),
        ));
        // Two open-ended ranges always overlap
        assert!(date_ranges_overlap(d(2024, 1, 1), None, d(2030, 1, 1), None));
    }

    #[test]
    fn minutes_roundtrip() {
        assert_eq!(minutes_of(t(9, 30)), 570);
        assert_eq!(time_from_minutes(570), t(9, 30));
        assert_eq!(minutes_of(t(0, 0)), 0);
    }

    #[test]
    fn subtract_nothing() {
        assert_eq!(subtract_windows((540, 1020), &[]), vec![(540, 1020)]);
    }

    #[test]
    fn subtract_middle_punch() {
        // 09:00-17:00 minus 12:00-13:00
        assert_eq!(
            subtract_windows((540, 1020), &[(720, 780)]),
            vec![(540, 720), (780, 1020)]
        );
    }

    #[test]
    fn subtract_full_cover() {
        assert!(subtract_windows((540, 600), &[(500, 700)]).is_empty());
    }

    #[test]
    fn subtract_edges() {
        // Blocked window butting the start, then the end
        assert_eq!(subtract_windows((540, 1020), &[(480, 600)]), vec![(600, 1020)]);
        assert_eq!(subtract_windows((540, 1020), &[(960, 1080)]), vec![(540, 960)]);
    }

    #[test]
    fn subtract_multiple_sorted() {
        assert_eq!(
            subtract_windows((0, 1000), &[(100, 200), (400, 500), (800, 900)]),
            vec![(0, 100), (200, 400), (500, 800), (900, 1000)]
        );
    }

    #[test]
    fn subtract_disjoint_blocked() {
        // Blocked windows entirely outside the base
        assert_eq!(
            subtract_windows((540, 600), &[(0, 100), (700, 800)]),
            vec![(540, 600)]
        );
    }
}

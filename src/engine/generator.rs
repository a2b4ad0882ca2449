//! Pure slot-slicing. The engine wraps these with locking, idempotence
//! checks, and WAL writes; everything here is deterministic arithmetic.

use chrono::{Days, NaiveDate, NaiveTime};

use super::overlap::{MinuteWindow, minutes_of, time_from_minutes};

/// Walk a cursor from `daily_start` in steps of `duration_minutes`. Each step
/// yields `[cursor, cursor + duration)`. A final slice that would overrun
/// `daily_end` is dropped, never truncated.
pub fn day_slices(
    daily_start: NaiveTime,
    daily_end: NaiveTime,
    duration_minutes: u32,
) -> Vec<(NaiveTime, NaiveTime)> {
    window_slices((minutes_of(daily_start), minutes_of(daily_end)), duration_minutes)
        .into_iter()
        .map(|(s, e)| (time_from_minutes(s), time_from_minutes(e)))
        .collect()
}

/// Minute-window form of `day_slices`, used after blackout subtraction.
pub fn window_slices(window: MinuteWindow, duration_minutes: u32) -> Vec<MinuteWindow> {
    let (start, end) = window;
    if duration_minutes == 0 || start >= end {
        return Vec::new();
    }
    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor + duration_minutes <= end {
        slices.push((cursor, cursor + duration_minutes));
        cursor += duration_minutes;
    }
    slices
}

/// All dates from `start` to `end` inclusive. Caller validates `start <= end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        dates.push(cursor);
        match cursor.checked_add_days(Days::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    dates
}

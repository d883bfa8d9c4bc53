use chrono::{Datelike, Duration, Local, NaiveDate};

use crate::models::Timestamp;

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Monday-to-Sunday window `offset` weeks away from the week containing `today`.
pub fn week_window(today: NaiveDate, offset: i64) -> (NaiveDate, NaiveDate) {
    let since_monday = i64::from(today.weekday().num_days_from_monday());
    let start = today - Duration::days(since_monday) + Duration::weeks(offset);
    (start, start + Duration::days(6))
}

/// True when `date` lies inside `[start, end]`.
pub fn within(date: NaiveDate, (start, end): (NaiveDate, NaiveDate)) -> bool {
    start <= date && date <= end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn week_starts_on_monday() {
        // 2024-03-06 is a Wednesday.
        assert_eq!(
            week_window(date(2024, 3, 6), 0),
            (date(2024, 3, 4), date(2024, 3, 10))
        );
        assert_eq!(
            week_window(date(2024, 3, 4), 0),
            (date(2024, 3, 4), date(2024, 3, 10))
        );
        assert_eq!(
            week_window(date(2024, 3, 10), 0),
            (date(2024, 3, 4), date(2024, 3, 10))
        );
    }

    #[test]
    fn offsets_cross_month_and_year() {
        assert_eq!(
            week_window(date(2024, 3, 6), 1),
            (date(2024, 3, 11), date(2024, 3, 17))
        );
        assert_eq!(
            week_window(date(2024, 1, 3), -1),
            (date(2023, 12, 25), date(2023, 12, 31))
        );
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let window = week_window(date(2024, 3, 6), 0);
        assert!(within(date(2024, 3, 4), window));
        assert!(within(date(2024, 3, 10), window));
        assert!(!within(date(2024, 3, 11), window));
        assert!(!within(date(2024, 3, 3), window));
    }
}

//! Fetch interval estimation
//!
//! After a successful chapter update the item's release cadence is estimated
//! from its most recent upload dates and the next update is pushed to the
//! next expected release.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::FetchWindow;
use crate::models::{Chapter, LibraryItem};

/// Interval used when there is not enough history
pub const DEFAULT_INTERVAL_DAYS: i32 = 7;

/// Upper bound of an estimated interval
pub const MAX_INTERVAL_DAYS: i32 = 28;

/// Number of distinct recent dates considered
const SAMPLE_SIZE: usize = 10;

/// Recomputed schedule for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSchedule {
    /// Negative when set manually by the user
    pub interval_days: i32,
    pub next_update: DateTime<Utc>,
}

/// Estimate the release interval in days from a chapter set
pub fn estimate_interval(chapters: &[Chapter]) -> i32 {
    let upload_dates = recent_distinct_days(chapters.iter().filter_map(|c| c.date_upload));
    let fetch_dates = recent_distinct_days(chapters.iter().map(|c| c.date_fetch));

    let interval = if upload_dates.len() >= 3 {
        median_gap(&upload_dates)
    } else if fetch_dates.len() >= 3 {
        median_gap(&fetch_dates)
    } else {
        DEFAULT_INTERVAL_DAYS as i64
    };

    interval.clamp(1, MAX_INTERVAL_DAYS as i64) as i32
}

fn recent_distinct_days(dates: impl Iterator<Item = DateTime<Utc>>) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = dates.map(|d| d.date_naive()).collect();
    days.sort_unstable_by(|a, b| b.cmp(a));
    days.dedup();
    days.truncate(SAMPLE_SIZE);
    days
}

fn median_gap(days: &[NaiveDate]) -> i64 {
    let mut gaps: Vec<i64> = days
        .windows(2)
        .map(|pair| (pair[0] - pair[1]).num_days())
        .collect();
    gaps.sort_unstable();
    gaps[(gaps.len() - 1) / 2]
}

/// Compute the item's next schedule after an update
///
/// Returns `None` when the stored next update lies outside the run's window,
/// in which case the item keeps its schedule.
pub fn next_schedule(
    item: &LibraryItem,
    chapters: &[Chapter],
    now: DateTime<Utc>,
    window: &FetchWindow,
) -> Option<FetchSchedule> {
    let due = match item.next_update {
        None => true,
        Some(next) => window.contains(next) || item.fetch_interval_days == 0,
    };
    if !due {
        return None;
    }

    let interval_days = if item.fetch_interval_days < 0 {
        item.fetch_interval_days
    } else {
        estimate_interval(chapters)
    };
    let step = i64::from(interval_days.unsigned_abs().max(1));

    let latest = item.last_update.unwrap_or(now).date_naive();
    let elapsed = (now.date_naive() - latest).num_days().max(0);
    let cycles = elapsed / step;
    let next_day = latest + Duration::days((cycles + 1) * step);

    Some(FetchSchedule {
        interval_days,
        next_update: next_day.and_time(NaiveTime::MIN).and_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteChapter;
    use chrono::TimeZone;

    fn uploaded(days: &[u32]) -> Vec<Chapter> {
        days.iter()
            .enumerate()
            .map(|(i, day)| {
                let at = Utc.with_ymd_and_hms(2024, 1, *day, 12, 0, 0).unwrap();
                let mut remote = RemoteChapter::new(format!("/c/{i}"), format!("Ch. {i}"), i as f64);
                remote.date_upload = Some(at);
                Chapter::from_remote(&remote, i, at)
            })
            .collect()
    }

    #[test]
    fn test_weekly_interval() {
        let chapters = uploaded(&[1, 8, 15, 22]);
        assert_eq!(estimate_interval(&chapters), 7);
    }

    #[test]
    fn test_median_ignores_outlier() {
        let chapters = uploaded(&[1, 3, 5, 7, 30]);
        assert_eq!(estimate_interval(&chapters), 2);
    }

    #[test]
    fn test_default_without_history() {
        let chapters = uploaded(&[1, 2]);
        let fetch_only: Vec<Chapter> = chapters
            .into_iter()
            .map(|mut c| {
                c.date_upload = None;
                c
            })
            .collect();
        assert_eq!(estimate_interval(&fetch_only), DEFAULT_INTERVAL_DAYS);
        assert_eq!(estimate_interval(&[]), DEFAULT_INTERVAL_DAYS);
    }

    #[test]
    fn test_interval_clamped() {
        let mut chapters = uploaded(&[1]);
        for (i, month) in [3u32, 6].iter().enumerate() {
            let at = Utc.with_ymd_and_hms(2024, *month, 1, 0, 0, 0).unwrap();
            let mut remote = RemoteChapter::new(format!("/m/{i}"), "late", 1.0);
            remote.date_upload = Some(at);
            chapters.push(Chapter::from_remote(&remote, 0, at));
        }
        assert_eq!(estimate_interval(&chapters), MAX_INTERVAL_DAYS);
    }

    #[test]
    fn test_next_schedule_advances_cycles() {
        let now = Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap();
        let window = FetchWindow::around(now);
        let mut item = LibraryItem::new(1, 1, "Weekly");
        item.last_update = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let schedule = next_schedule(&item, &uploaded(&[1, 8, 15]), now, &window).unwrap();

        assert_eq!(schedule.interval_days, 7);
        assert_eq!(
            schedule.next_update,
            Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_schedule_keeps_manual_interval() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let window = FetchWindow::around(now);
        let mut item = LibraryItem::new(1, 1, "Manual");
        item.fetch_interval_days = -3;
        item.last_update = Some(now);
        item.next_update = Some(now);

        let schedule = next_schedule(&item, &[], now, &window).unwrap();
        assert_eq!(schedule.interval_days, -3);
        assert_eq!(
            schedule.next_update,
            Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_schedule_outside_window_untouched() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let window = FetchWindow::around(now);
        let mut item = LibraryItem::new(1, 1, "Later");
        item.fetch_interval_days = 7;
        item.next_update = Some(now + Duration::days(10));

        assert!(next_schedule(&item, &[], now, &window).is_none());
    }
}

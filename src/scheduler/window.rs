//! Clock and fetch window
//!
//! A run computes its [`FetchWindow`] once from the injected [`Clock`]. The
//! window spans the current UTC day widened by a grace period on each side.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Days added on each side of the current day
pub const GRACE_PERIOD_DAYS: i64 = 1;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Time range within which items are due for update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub lower: DateTime<Utc>,
    pub upper: DateTime<Utc>,
}

impl FetchWindow {
    /// Window around the day containing `now`
    pub fn around(now: DateTime<Utc>) -> Self {
        let today = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        Self {
            lower: today - Duration::days(GRACE_PERIOD_DAYS),
            upper: today + Duration::days(GRACE_PERIOD_DAYS),
        }
    }

    /// Whether a timestamp falls inside the window, bounds included
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.lower && at <= self.upper
    }

    /// Whether an item scheduled at `next_update` is already past the window
    pub fn is_beyond(&self, next_update: DateTime<Utc>) -> bool {
        next_update > self.upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 30, 0).unwrap();
        let window = FetchWindow::around(now);

        assert_eq!(window.lower, Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap());
        assert_eq!(window.upper, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_window_contains() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let window = FetchWindow::around(now);

        assert!(window.contains(now));
        assert!(window.contains(window.upper));
        assert!(!window.contains(window.upper + Duration::seconds(1)));
        assert!(window.is_beyond(window.upper + Duration::days(3)));
        assert!(!window.is_beyond(window.lower - Duration::days(30)));
    }

    #[test]
    fn test_fixed_clock() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(FixedClock(at).now(), at);
    }
}

use std::fmt::{self, Display};
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Time bucket granularity for usage counters.
///
/// Minute/hour/day bound rate limits; day/month additionally bound calendar
/// quotas. Window starts are truncated UTC timestamps, so every caller
/// observing the same instant lands on the same bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
    Month,
}

impl WindowKind {
    /// All granularities tracked for an admitted request.
    pub const ALL: [WindowKind; 4] = [
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Day,
        WindowKind::Month,
    ];

    /// Granularities evaluated by the rate limiter, tightest first.
    pub const RATE: [WindowKind; 3] = [WindowKind::Minute, WindowKind::Hour, WindowKind::Day];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
            WindowKind::Month => "month",
        }
    }

    /// Truncate `now` to the start of the window containing it.
    pub fn truncate(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let naive = match self {
            WindowKind::Minute => date.and_hms_opt(now.hour(), now.minute(), 0),
            WindowKind::Hour => date.and_hms_opt(now.hour(), 0, 0),
            WindowKind::Day => date.and_hms_opt(0, 0, 0),
            WindowKind::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        // Truncation of a representable datetime always succeeds.
        naive
            .map(|n| Utc.from_utc_datetime(&n))
            .unwrap_or(now)
    }

    /// The first instant past the window that contains `now`.
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end_of(self.truncate(now))
    }

    /// The first instant past a window starting at `window_start`.
    ///
    /// Also the natural expiry for the window's counter record: stale
    /// windows self-clean one window length past their start.
    pub fn end_of(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WindowKind::Minute => window_start + chrono::Duration::seconds(60),
            WindowKind::Hour => window_start + chrono::Duration::seconds(3600),
            WindowKind::Day => window_start + chrono::Duration::seconds(86_400),
            WindowKind::Month => window_start
                .checked_add_months(Months::new(1))
                .unwrap_or(window_start + chrono::Duration::days(31)),
        }
    }

    /// Seconds until the window containing `now` rolls over, rounded up.
    /// Never zero for an instant inside the window.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.next_boundary(now) - now;
        let secs = remaining.num_seconds().max(0) as u64;
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }

    /// Remaining lifetime of the window containing `now`.
    pub fn ttl_from(&self, now: DateTime<Utc>) -> Duration {
        (self.next_boundary(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WindowKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(WindowKind::Minute),
            "hour" => Ok(WindowKind::Hour),
            "day" => Ok(WindowKind::Day),
            "month" => Ok(WindowKind::Month),
            other => Err(crate::error::Error::new(
                crate::error::ErrorDetails::InternalError {
                    message: format!("Unknown window kind: {other}"),
                },
            )),
        }
    }
}

/// Cache key for a window counter: `wc:{identity}:{kind}:{start-epoch}`.
pub fn counter_key(identity: &str, kind: WindowKind, window_start: DateTime<Utc>) -> String {
    format!(
        "wc:{identity}:{}:{}",
        kind.as_str(),
        window_start.timestamp()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_truncation() {
        let now = at(2025, 3, 15, 10, 42, 37);
        assert_eq!(WindowKind::Minute.truncate(now), at(2025, 3, 15, 10, 42, 0));
        assert_eq!(WindowKind::Hour.truncate(now), at(2025, 3, 15, 10, 0, 0));
        assert_eq!(WindowKind::Day.truncate(now), at(2025, 3, 15, 0, 0, 0));
        assert_eq!(WindowKind::Month.truncate(now), at(2025, 3, 1, 0, 0, 0));
    }

    #[test]
    fn test_month_boundary_rollover() {
        let now = at(2025, 12, 31, 23, 59, 59);
        assert_eq!(
            WindowKind::Month.next_boundary(now),
            at(2026, 1, 1, 0, 0, 0)
        );
        // February keeps its real length.
        let feb = at(2025, 2, 10, 5, 0, 0);
        assert_eq!(WindowKind::Month.next_boundary(feb), at(2025, 3, 1, 0, 0, 0));
    }

    #[test]
    fn test_retry_after_bounds() {
        let now = at(2025, 3, 15, 10, 42, 37);
        let retry = WindowKind::Minute.retry_after_seconds(now);
        assert!(retry > 0 && retry <= 60, "retry_after {retry} out of range");
        assert_eq!(retry, 23);

        // Exactly on a boundary the next window has just begun.
        let boundary = at(2025, 3, 15, 10, 42, 0);
        assert_eq!(WindowKind::Minute.retry_after_seconds(boundary), 60);
    }

    #[test]
    fn test_counter_key_is_stable_within_window() {
        let a = at(2025, 3, 15, 10, 42, 1);
        let b = at(2025, 3, 15, 10, 42, 59);
        assert_eq!(
            counter_key("user-1", WindowKind::Minute, WindowKind::Minute.truncate(a)),
            counter_key("user-1", WindowKind::Minute, WindowKind::Minute.truncate(b)),
        );
    }
}

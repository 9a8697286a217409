use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};

use crate::error::DoseError;
use crate::model::{DoseKey, DoseTime};

/// Tolerances around a dose's scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoseWindows {
    /// `|now - scheduled|` must not exceed this to take or undo a dose.
    pub confirm: Duration,
    /// `now - scheduled` must exceed this before a pending dose is missed.
    pub miss: Duration,
}

impl Default for DoseWindows {
    fn default() -> Self {
        Self {
            confirm: Duration::hours(1),
            miss: Duration::hours(2),
        }
    }
}

impl DoseWindows {
    pub fn new(confirm: Duration, miss: Duration) -> Self {
        Self { confirm, miss }
    }

    /// Whether `now` is inside the confirmation window of `scheduled`.
    pub fn within_confirm(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - scheduled).abs() <= self.confirm
    }

    /// Whether the miss window has fully elapsed.
    pub fn miss_elapsed(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - scheduled > self.miss
    }
}

/// Resolve the absolute instant a dose is scheduled for.
///
/// `time` is the dose's `HH:MM:SS` string, interpreted on `key.date` in the user's
/// local `offset`. A malformed time is an `InvalidReference`.
pub fn scheduled_at(
    key: &DoseKey,
    time: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, DoseError> {
    let time = DoseTime::parse(time)
        .map_err(|_| DoseError::InvalidReference(format!("dose {key} has malformed time '{time}'")))?;
    offset
        .from_local_datetime(&key.date.and_time(time.as_naive()))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| DoseError::InvalidReference(format!("dose {key} has no local instant")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 9, h, m, 0).unwrap()
    }

    #[test]
    fn confirm_window_is_symmetric_and_inclusive() {
        let w = DoseWindows::default();
        let scheduled = utc(8, 0);
        assert!(w.within_confirm(scheduled, utc(7, 0)));
        assert!(w.within_confirm(scheduled, utc(9, 0)));
        assert!(!w.within_confirm(scheduled, utc(9, 1)));
        assert!(!w.within_confirm(scheduled, utc(6, 59)));
    }

    #[test]
    fn miss_window_is_strict() {
        let w = DoseWindows::default();
        let scheduled = utc(8, 0);
        assert!(!w.miss_elapsed(scheduled, utc(10, 0)));
        assert!(w.miss_elapsed(scheduled, utc(10, 1)));
    }

    #[test]
    fn scheduled_at_uses_local_offset() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 9).unwrap();
        let key = DoseKey::new(1, date, 0);
        let east = FixedOffset::east_opt(9 * 3600).unwrap();
        assert_eq!(
            scheduled_at(&key, "17:00:00", east).unwrap(),
            utc(8, 0)
        );
        assert!(matches!(
            scheduled_at(&key, "25:00", east),
            Err(DoseError::InvalidReference(_))
        ));
    }
}

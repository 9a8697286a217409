use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

/// Consecutive local calendar days with at least one taken dose, counted
/// backward from the most recent taken date and stopping at the first gap.
///
/// Returns 0 when there is no taken history.
pub fn compute_streak(taken: &[DateTime<Utc>], offset: FixedOffset) -> u32 {
    let dates: BTreeSet<NaiveDate> = taken
        .iter()
        .map(|ts| ts.with_timezone(&offset).date_naive())
        .collect();

    let mut iter = dates.iter().rev();
    let Some(mut current) = iter.next().copied() else {
        return 0;
    };
    let mut streak = 1;
    for &date in iter {
        if current.pred_opt() != Some(date) {
            break;
        }
        streak += 1;
        current = date;
    }
    streak
}

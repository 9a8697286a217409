//! Pure transition checks.
//!
//! Each function inspects one dose record and either returns the
//! [`Transition`] that would be applied or the reason it is illegal. Nothing
//! here mutates state; the ledger applies a transition only after the
//! Authoritative Store has confirmed it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::window::DoseWindows;
use crate::error::DoseError;
use crate::model::{DoseKey, DoseRecord, DoseState};

/// A validated, not yet persisted, state change of one dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub key: DoseKey,
    pub from: DoseState,
    pub to: DoseState,
    pub scheduled: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

impl Transition {
    pub(crate) fn apply(&self, record: &mut DoseRecord) {
        record.set_state(self.to, self.at);
    }
}

fn offset_secs(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - scheduled).num_seconds()
}

fn require_state(
    record: &DoseRecord,
    key: DoseKey,
    expected: DoseState,
    to: DoseState,
) -> Result<(), DoseError> {
    let from = record.state();
    if from == expected {
        Ok(())
    } else {
        Err(DoseError::InvalidTransition { key, from, to })
    }
}

/// `Pending -> Taken`, legal while `now` is inside the confirmation window.
pub fn mark_taken(
    record: &DoseRecord,
    key: DoseKey,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    windows: &DoseWindows,
) -> Result<Transition, DoseError> {
    require_state(record, key, DoseState::Pending, DoseState::Taken)?;
    if !windows.within_confirm(scheduled, now) {
        return Err(DoseError::OutOfWindow {
            key,
            offset_secs: offset_secs(scheduled, now),
            window_secs: windows.confirm.num_seconds(),
        });
    }
    Ok(Transition {
        key,
        from: DoseState::Pending,
        to: DoseState::Taken,
        scheduled,
        at: now,
    })
}

/// `Taken -> Pending`, under the same confirmation window as taking.
pub fn undo_taken(
    record: &DoseRecord,
    key: DoseKey,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    windows: &DoseWindows,
) -> Result<Transition, DoseError> {
    require_state(record, key, DoseState::Taken, DoseState::Pending)?;
    if !windows.within_confirm(scheduled, now) {
        return Err(DoseError::OutOfWindow {
            key,
            offset_secs: offset_secs(scheduled, now),
            window_secs: windows.confirm.num_seconds(),
        });
    }
    Ok(Transition {
        key,
        from: DoseState::Taken,
        to: DoseState::Pending,
        scheduled,
        at: now,
    })
}

/// `Pending -> Missed`, legal once the miss window has fully elapsed.
pub fn auto_miss(
    record: &DoseRecord,
    key: DoseKey,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    windows: &DoseWindows,
) -> Result<Transition, DoseError> {
    require_state(record, key, DoseState::Pending, DoseState::Missed)?;
    if !windows.miss_elapsed(scheduled, now) {
        return Err(DoseError::OutOfWindow {
            key,
            offset_secs: offset_secs(scheduled, now),
            window_secs: windows.miss.num_seconds(),
        });
    }
    Ok(Transition {
        key,
        from: DoseState::Pending,
        to: DoseState::Missed,
        scheduled,
        at: now,
    })
}

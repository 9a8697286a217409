//! Shared types for store synchronization.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::dose::Transition;
use crate::model::{DoseState, MedicationId, ReminderId, ReminderStatus};

/// Location of a record in the Mirror Store tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MirrorPath(String);

impl MirrorPath {
    /// `medications/{user}/{medicationId}`: full medication + doses snapshot.
    pub fn medication(user: &str, id: MedicationId) -> Self {
        Self(format!("medications/{user}/{id}"))
    }

    /// `reminders/{user}/{reminderId}`
    pub fn reminder(user: &str, id: ReminderId) -> Self {
        Self(format!("reminders/{user}/{id}"))
    }

    /// `medication_history/{user}`: append-only list.
    pub fn history(user: &str) -> Self {
        Self(format!("medication_history/{user}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MirrorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to set one dose's status on the Authoritative Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseStatusUpdate {
    pub medication_id: MedicationId,
    pub date: NaiveDate,
    pub dose_index: usize,
    pub status: DoseState,
    pub at: DateTime<Utc>,
}

impl From<&Transition> for DoseStatusUpdate {
    fn from(t: &Transition) -> Self {
        Self {
            medication_id: t.key.medication_id,
            date: t.key.date,
            dose_index: t.key.dose_index,
            status: t.to,
            at: t.at,
        }
    }
}

/// Request to record a reminder delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderStatusUpdate {
    pub reminder_id: ReminderId,
    pub status: ReminderStatus,
    /// Local date of the occurrence being marked.
    pub date: NaiveDate,
}

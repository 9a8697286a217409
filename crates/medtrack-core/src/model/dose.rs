use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::medication::{Medication, MedicationId};

/// Status of one scheduled dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DoseState {
    Pending,
    Taken,
    Missed,
}

impl DoseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoseState::Pending => "Pending",
            DoseState::Taken => "Taken",
            DoseState::Missed => "Missed",
        }
    }
}

/// Identity of one dose: `(medication, date, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseKey {
    pub medication_id: MedicationId,
    pub date: NaiveDate,
    pub dose_index: usize,
}

impl DoseKey {
    pub fn new(medication_id: MedicationId, date: NaiveDate, dose_index: usize) -> Self {
        Self {
            medication_id,
            date,
            dose_index,
        }
    }
}

impl fmt::Display for DoseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.medication_id, self.date, self.dose_index)
    }
}

/// One dose slot on one date.
///
/// Status fields are read-only outside the crate; they change only through the
/// dose state machine or a confirmed store snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseRecord {
    #[serde(default)]
    dose_index: usize,
    time: String,
    #[serde(default)]
    taken: bool,
    #[serde(default)]
    missed: bool,
    #[serde(default)]
    taken_at: Option<DateTime<Utc>>,
}

impl DoseRecord {
    pub(crate) fn new(dose_index: usize, time: impl Into<String>) -> Self {
        Self {
            dose_index,
            time: time.into(),
            taken: false,
            missed: false,
            taken_at: None,
        }
    }

    pub fn dose_index(&self) -> usize {
        self.dose_index
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn taken(&self) -> bool {
        self.taken
    }

    pub fn missed(&self) -> bool {
        self.missed
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    pub fn state(&self) -> DoseState {
        if self.taken {
            DoseState::Taken
        } else if self.missed {
            DoseState::Missed
        } else {
            DoseState::Pending
        }
    }

    /// Overwrite the status fields for `state`. Callers are responsible for
    /// having checked that the transition is legal.
    pub(crate) fn set_state(&mut self, state: DoseState, at: DateTime<Utc>) {
        match state {
            DoseState::Taken => {
                self.taken = true;
                self.missed = false;
                self.taken_at = Some(at);
            }
            DoseState::Pending => {
                self.taken = false;
                self.missed = false;
                self.taken_at = None;
            }
            DoseState::Missed => {
                self.taken = false;
                self.missed = true;
                self.taken_at = None;
            }
        }
    }

    pub(crate) fn normalize(&mut self, index: usize) {
        self.dose_index = index;
        if self.taken {
            self.missed = false;
        } else {
            self.taken_at = None;
        }
    }
}

/// Build a fresh all-pending dose array for `date` from the medication's times.
///
/// A date outside the medication's active range has no doses.
pub fn materialize_day(medication: &Medication, date: NaiveDate) -> Vec<DoseRecord> {
    if !medication.is_active_on(date) {
        return Vec::new();
    }
    medication
        .times
        .iter()
        .enumerate()
        .map(|(index, time)| DoseRecord::new(index, time.clone()))
        .collect()
}

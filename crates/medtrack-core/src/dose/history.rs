use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::machine::Transition;
use crate::model::{DoseState, Medication, MedicationId};

/// Append-only record of a confirmed transition, mirrored to
/// `medication_history/{user}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub medication_id: MedicationId,
    pub medication_name: String,
    pub date: NaiveDate,
    pub dose_index: usize,
    pub status: DoseState,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_transition(transition: &Transition, medication: &Medication) -> Self {
        Self {
            medication_id: transition.key.medication_id,
            medication_name: medication.name.clone(),
            date: transition.key.date,
            dose_index: transition.key.dose_index,
            status: transition.to,
            timestamp: transition.at,
        }
    }
}

/// One row of the flattened dose history view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub medication_id: MedicationId,
    pub medication_name: String,
    pub date: NaiveDate,
    pub time: String,
    pub dose_index: usize,
    pub status: DoseState,
}

/// Flatten every materialized day of `medications`, ordered by date then time.
pub fn history_rows<'a>(medications: impl IntoIterator<Item = &'a Medication>) -> Vec<HistoryRow> {
    let mut rows: Vec<HistoryRow> = medications
        .into_iter()
        .flat_map(|med| {
            med.dose_days().flat_map(move |(date, day)| {
                day.iter().map(move |dose| HistoryRow {
                    medication_id: med.id,
                    medication_name: med.name.clone(),
                    date,
                    time: dose.time().to_string(),
                    dose_index: dose.dose_index(),
                    status: dose.state(),
                })
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.time.cmp(&b.time))
            .then_with(|| a.medication_id.cmp(&b.medication_id))
    });
    rows
}

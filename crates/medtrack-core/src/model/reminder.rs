use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::medication::{DoseTime, Medication, MedicationId};
use crate::error::ValidationError;

pub type ReminderId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderKind {
    /// Fires once, on `date`.
    Single,
    /// Fires every day from `date` onward.
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderStatus {
    Pending,
    Sent,
}

/// A notification attached to one dose index of a medication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: ReminderId,
    pub medication_id: MedicationId,
    pub dose_index: usize,
    pub reminder_time: String,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub kind: ReminderKind,
    pub status: ReminderStatus,
    /// Local date of the last delivery; daily reminders re-arm on later dates.
    #[serde(default)]
    pub last_sent_on: Option<NaiveDate>,
}

impl Reminder {
    /// The local date this reminder targets when evaluated on `today`.
    pub fn occurrence_on(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self.kind {
            ReminderKind::Single => Some(self.date),
            ReminderKind::Daily if today >= self.date => Some(today),
            ReminderKind::Daily => None,
        }
    }

    /// Whether the occurrence on `day` has already been delivered.
    pub fn is_sent_for(&self, day: NaiveDate) -> bool {
        match self.kind {
            ReminderKind::Single => self.status == ReminderStatus::Sent,
            ReminderKind::Daily => self.last_sent_on == Some(day),
        }
    }

    /// Absolute trigger instant for the occurrence on `day`, or `None` when
    /// `reminder_time` is malformed.
    pub fn trigger_at(&self, day: NaiveDate, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let time = DoseTime::parse(&self.reminder_time).ok()?;
        offset
            .from_local_datetime(&day.and_time(time.as_naive()))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Copy of this reminder with the occurrence on `day` recorded as sent.
    pub fn marked_sent(&self, day: NaiveDate) -> Self {
        Self {
            status: ReminderStatus::Sent,
            last_sent_on: Some(day),
            ..self.clone()
        }
    }
}

/// User input for creating or updating a reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderDraft {
    pub medication_id: MedicationId,
    pub dose_index: usize,
    pub reminder_time: String,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub kind: ReminderKind,
}

impl ReminderDraft {
    /// Validate against the target medication.
    ///
    /// The reminder must fall within `lead` before the dose time and not after
    /// it. Single reminders may not be scheduled in the past.
    pub fn validate(
        mut self,
        medication: &Medication,
        now: DateTime<Utc>,
        offset: FixedOffset,
        lead: Duration,
    ) -> Result<Self, ValidationError> {
        if medication.id != self.medication_id {
            return Err(ValidationError::invalid(
                "medicationId",
                format!(
                    "reminder targets medication {}, got {}",
                    self.medication_id, medication.id
                ),
            ));
        }
        let dose_time = medication.times.get(self.dose_index).ok_or_else(|| {
            ValidationError::invalid(
                "doseIndex",
                format!(
                    "medication {} has {} doses, index {} is out of range",
                    medication.id,
                    medication.times.len(),
                    self.dose_index
                ),
            )
        })?;
        let dose_time = DoseTime::parse(dose_time)?;
        let reminder_time = DoseTime::parse_lenient(&self.reminder_time)
            .map_err(|_| ValidationError::invalid("reminderTime", "expected HH:MM:SS"))?;
        self.reminder_time = reminder_time.to_string();

        let before = dose_time.as_naive() - reminder_time.as_naive();
        if before < Duration::zero() {
            return Err(ValidationError::invalid(
                "reminderTime",
                "reminder cannot be after the dose time",
            ));
        }
        if before > lead {
            return Err(ValidationError::invalid(
                "reminderTime",
                format!(
                    "reminder must be within {} minutes before the dose",
                    lead.num_minutes()
                ),
            ));
        }

        if self.kind == ReminderKind::Single {
            let at = offset
                .from_local_datetime(&self.date.and_time(reminder_time.as_naive()))
                .single()
                .map(|dt| dt.with_timezone(&Utc));
            if at.map_or(true, |at| at < now) {
                return Err(ValidationError::invalid(
                    "date",
                    "reminder cannot be scheduled in the past",
                ));
            }
        }
        Ok(self)
    }
}

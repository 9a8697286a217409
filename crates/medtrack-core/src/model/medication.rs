use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::dose::{materialize_day, DoseRecord};
use crate::error::ValidationError;

pub type MedicationId = i64;

/// A validated `HH:MM:SS` time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DoseTime(NaiveTime);

impl DoseTime {
    /// Parse a strict `HH:MM:SS` (hours may be a single digit).
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let parts: Vec<&str> = s.split(':').collect();
        let well_formed = parts.len() == 3
            && (1..=2).contains(&parts[0].len())
            && parts[1].len() == 2
            && parts[2].len() == 2
            && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()));
        if !well_formed {
            return Err(ValidationError::invalid(
                "time",
                format!("'{s}' is not in HH:MM:SS format"),
            ));
        }
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .map(DoseTime)
            .map_err(|e| ValidationError::invalid("time", format!("'{s}': {e}")))
    }

    /// Accept `HH:MM` as well, treating it as `HH:MM:00`.
    pub fn parse_lenient(s: &str) -> Result<Self, ValidationError> {
        if s.split(':').count() == 2 {
            Self::parse(&format!("{s}:00"))
        } else {
            Self::parse(s)
        }
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl fmt::Display for DoseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S"))
    }
}

/// Coarse grouping used by dose lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    /// Morning is [05:00, 12:00), afternoon [12:00, 17:00), evening otherwise.
    pub fn of(time: DoseTime) -> Self {
        match time.as_naive().hour() {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            _ => TimeOfDay::Evening,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

/// A medication with its nested per-date dose map, as confirmed by the
/// Authoritative Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: MedicationId,
    #[serde(default, alias = "userId")]
    pub user_id: Option<i64>,
    #[serde(rename = "medication_name")]
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub times_per_day: u32,
    pub times: Vec<String>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub(crate) doses: BTreeMap<NaiveDate, Vec<DoseRecord>>,
    /// Revision stamp assigned by the Authoritative Store.
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Medication {
    /// Build a medication from a validated draft (used by stores that assign ids).
    pub fn from_draft(id: MedicationId, draft: &MedicationDraft) -> Self {
        Self {
            id,
            user_id: None,
            name: draft.name.clone(),
            dosage: draft.dosage.clone(),
            frequency: draft.frequency.as_str().to_string(),
            times_per_day: draft.times_per_day,
            times: draft.times.clone(),
            start_date: draft.start_date,
            end_date: draft.end_date,
            notes: draft.notes.clone(),
            doses: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// Whether the medication is scheduled on `date`.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| date <= end)
    }

    /// The materialized dose array for `date`, if one exists.
    pub fn day(&self, date: NaiveDate) -> Option<&[DoseRecord]> {
        self.doses.get(&date).map(Vec::as_slice)
    }

    /// The dose array for `date`: the materialized one, or a fresh day built
    /// from `times`.
    pub fn doses_on(&self, date: NaiveDate) -> Cow<'_, [DoseRecord]> {
        match self.doses.get(&date) {
            Some(day) => Cow::Borrowed(day.as_slice()),
            None => Cow::Owned(materialize_day(self, date)),
        }
    }

    /// All materialized dates with their dose arrays.
    pub fn dose_days(&self) -> impl Iterator<Item = (NaiveDate, &[DoseRecord])> {
        self.doses.iter().map(|(d, v)| (*d, v.as_slice()))
    }

    /// Repair shapes coming off the wire: dose indexes follow array position,
    /// and `taken`/`missed`/`takenAt` are made mutually consistent.
    pub fn normalize(mut self) -> Self {
        for day in self.doses.values_mut() {
            for (index, dose) in day.iter_mut().enumerate() {
                dose.normalize(index);
            }
        }
        self
    }
}

/// User input for creating or updating a medication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationDraft {
    #[serde(rename = "medication_name")]
    pub name: String,
    pub dosage: String,
    pub frequency: Frequency,
    pub times_per_day: u32,
    pub times: Vec<String>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MedicationDraft {
    /// Check the draft and normalise `HH:MM` times to `HH:MM:SS`.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("medication_name".into()));
        }
        if self.dosage.trim().is_empty() {
            return Err(ValidationError::MissingField("dosage".into()));
        }
        if self.times_per_day == 0 {
            return Err(ValidationError::invalid(
                "times_per_day",
                "must be a positive integer",
            ));
        }
        if self.times.len() != self.times_per_day as usize {
            return Err(ValidationError::invalid(
                "times",
                format!(
                    "expected {} times, got {}",
                    self.times_per_day,
                    self.times.len()
                ),
            ));
        }
        self.times = self
            .times
            .iter()
            .map(|t| DoseTime::parse_lenient(t).map(|dt| dt.to_string()))
            .collect::<Result<_, _>>()?;
        if let Some(end) = self.end_date {
            if end < self.start_date {
                return Err(ValidationError::invalid(
                    "end_date",
                    format!("{end} is before start_date {}", self.start_date),
                ));
            }
        }
        Ok(self)
    }
}

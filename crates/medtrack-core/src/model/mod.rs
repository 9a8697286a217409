//! Data shapes shared by every component: medications, per-date dose records
//! and reminders.
//!
//! Wire names follow the Authoritative Store's JSON (`medication_name`,
//! `times_per_day`, `takenAt`, `doseIndex`, ...), so the same types are used for
//! REST bodies, mirror snapshots and in-memory state.

mod dose;
mod medication;
mod reminder;

pub use dose::{materialize_day, DoseKey, DoseRecord, DoseState};
pub use medication::{
    DoseTime, Frequency, Medication, MedicationDraft, MedicationId, TimeOfDay,
};
pub use reminder::{Reminder, ReminderDraft, ReminderId, ReminderKind, ReminderStatus};

//! Store seams.
//!
//! The tracker talks to both stores only through these traits, so the REST and
//! HTTP mirror clients can be swapped for the in-memory stores in tests.

use async_trait::async_trait;

use super::types::{DoseStatusUpdate, MirrorPath, ReminderStatusUpdate};
use crate::error::StoreError;
use crate::model::{Medication, MedicationDraft, MedicationId, Reminder, ReminderDraft, ReminderId};

/// System of record for medications, doses and reminders.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn fetch_medications(&self) -> Result<Vec<Medication>, StoreError>;

    async fn create_medication(&self, draft: &MedicationDraft) -> Result<Medication, StoreError>;

    async fn update_medication(
        &self,
        id: MedicationId,
        draft: &MedicationDraft,
    ) -> Result<Medication, StoreError>;

    async fn delete_medication(&self, id: MedicationId) -> Result<(), StoreError>;

    /// Set one dose's status; returns the medication as stored afterwards.
    async fn set_dose_status(&self, update: &DoseStatusUpdate) -> Result<Medication, StoreError>;

    async fn fetch_reminders(&self) -> Result<Vec<Reminder>, StoreError>;

    async fn create_reminder(&self, draft: &ReminderDraft) -> Result<Reminder, StoreError>;

    async fn update_reminder_status(
        &self,
        update: &ReminderStatusUpdate,
    ) -> Result<Reminder, StoreError>;

    async fn delete_reminder(&self, id: ReminderId) -> Result<(), StoreError>;
}

/// Secondary keyed store used for live propagation. Never authoritative.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Upsert the record at `path`.
    async fn put(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError>;

    async fn remove(&self, path: &MirrorPath) -> Result<(), StoreError>;

    /// Append a child to the list at `path`.
    async fn append(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError>;
}

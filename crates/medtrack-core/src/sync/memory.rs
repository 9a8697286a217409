//! In-memory stores.
//!
//! Both stores keep their records behind a mutex and can be told to fail the
//! next N calls, which is how the retry and no-partial-transition paths are
//! exercised without a network.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::store::{AuthoritativeStore, MirrorStore};
use super::types::{DoseStatusUpdate, MirrorPath, ReminderStatusUpdate};
use crate::error::StoreError;
use crate::model::{
    Medication, MedicationDraft, MedicationId, Reminder, ReminderDraft, ReminderId,
    ReminderKind, ReminderStatus,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct AuthorityState {
    medications: BTreeMap<MedicationId, Medication>,
    reminders: BTreeMap<ReminderId, Reminder>,
    next_id: i64,
    revision: Option<DateTime<Utc>>,
    failures: VecDeque<StoreError>,
    calls: u32,
}

impl AuthorityState {
    fn enter(&mut self) -> Result<(), StoreError> {
        self.calls += 1;
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Strictly increasing revision stamps, never behind the wall clock.
    fn next_revision(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let rev = match self.revision {
            Some(last) if last >= now => last + Duration::milliseconds(1),
            _ => now,
        };
        self.revision = Some(rev);
        rev
    }
}

/// Authoritative Store kept in memory.
///
/// Applies the same dose-status semantics as the REST API: the day is
/// materialized on first reference and the dose index is validated.
#[derive(Debug, Default)]
pub struct MemoryAuthoritativeStore {
    state: Mutex<AuthorityState>,
}

impl MemoryAuthoritativeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a medication directly, bypassing call counting.
    pub fn insert_medication(&self, mut medication: Medication) -> Medication {
        let mut state = lock(&self.state);
        if medication.id == 0 {
            medication.id = state.next_id();
        } else {
            state.next_id = state.next_id.max(medication.id);
        }
        medication.updated_at = Some(state.next_revision());
        state.medications.insert(medication.id, medication.clone());
        medication
    }

    pub fn insert_reminder(&self, mut reminder: Reminder) -> Reminder {
        let mut state = lock(&self.state);
        if reminder.id == 0 {
            reminder.id = state.next_id();
        } else {
            state.next_id = state.next_id.max(reminder.id);
        }
        state.reminders.insert(reminder.id, reminder.clone());
        reminder
    }

    /// Fail the next call with each of `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        lock(&self.state).failures.extend(errors);
    }

    /// Number of trait calls received, including failed ones.
    pub fn calls(&self) -> u32 {
        lock(&self.state).calls
    }

    pub fn medication(&self, id: MedicationId) -> Option<Medication> {
        lock(&self.state).medications.get(&id).cloned()
    }

    pub fn reminder(&self, id: ReminderId) -> Option<Reminder> {
        lock(&self.state).reminders.get(&id).cloned()
    }
}

#[async_trait]
impl AuthoritativeStore for MemoryAuthoritativeStore {
    async fn fetch_medications(&self) -> Result<Vec<Medication>, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        Ok(state.medications.values().cloned().collect())
    }

    async fn create_medication(&self, draft: &MedicationDraft) -> Result<Medication, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        let id = state.next_id();
        let mut med = Medication::from_draft(id, draft);
        med.updated_at = Some(state.next_revision());
        state.medications.insert(id, med.clone());
        Ok(med)
    }

    async fn update_medication(
        &self,
        id: MedicationId,
        draft: &MedicationDraft,
    ) -> Result<Medication, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        let rev = state.next_revision();
        let existing = state
            .medications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("medication {id}")))?;
        let mut updated = Medication::from_draft(id, draft);
        updated.user_id = existing.user_id;
        // Days already materialized keep their records when the count still matches.
        updated.doses = std::mem::take(&mut existing.doses)
            .into_iter()
            .filter(|(_, day)| day.len() == updated.times.len())
            .collect();
        updated.updated_at = Some(rev);
        *existing = updated.clone();
        Ok(updated)
    }

    async fn delete_medication(&self, id: MedicationId) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        state
            .medications
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("medication {id}")))
    }

    async fn set_dose_status(&self, update: &DoseStatusUpdate) -> Result<Medication, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        let rev = state.next_revision();
        let med = state
            .medications
            .get_mut(&update.medication_id)
            .ok_or_else(|| StoreError::NotFound(format!("medication {}", update.medication_id)))?;
        let mut day = med.doses_on(update.date).into_owned();
        let record = day.get_mut(update.dose_index).ok_or_else(|| StoreError::Rejected {
            status: 400,
            message: format!("Invalid doseIndex: {}", update.dose_index),
        })?;
        record.set_state(update.status, update.at);
        med.doses.insert(update.date, day);
        med.updated_at = Some(rev);
        Ok(med.clone())
    }

    async fn fetch_reminders(&self) -> Result<Vec<Reminder>, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        Ok(state.reminders.values().cloned().collect())
    }

    async fn create_reminder(&self, draft: &ReminderDraft) -> Result<Reminder, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        if !state.medications.contains_key(&draft.medication_id) {
            return Err(StoreError::NotFound("Medication not found".into()));
        }
        let same_slot = state
            .reminders
            .values()
            .find(|r| {
                r.medication_id == draft.medication_id
                    && r.dose_index == draft.dose_index
                    && r.date == draft.date
            })
            .cloned();
        // One reminder per dose slot: same kind replaces, a different kind is refused.
        if let Some(existing) = same_slot {
            if existing.kind != draft.kind {
                return Err(StoreError::Rejected {
                    status: 400,
                    message: format!(
                        "A {} reminder exists for this dose",
                        match existing.kind {
                            ReminderKind::Single => "single",
                            ReminderKind::Daily => "daily",
                        }
                    ),
                });
            }
            let updated = Reminder {
                reminder_time: draft.reminder_time.clone(),
                status: ReminderStatus::Pending,
                last_sent_on: None,
                ..existing
            };
            state.reminders.insert(updated.id, updated.clone());
            return Ok(updated);
        }
        let id = state.next_id();
        let reminder = Reminder {
            id,
            medication_id: draft.medication_id,
            dose_index: draft.dose_index,
            reminder_time: draft.reminder_time.clone(),
            date: draft.date,
            kind: draft.kind,
            status: ReminderStatus::Pending,
            last_sent_on: None,
        };
        state.reminders.insert(id, reminder.clone());
        Ok(reminder)
    }

    async fn update_reminder_status(
        &self,
        update: &ReminderStatusUpdate,
    ) -> Result<Reminder, StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        let reminder = state
            .reminders
            .get_mut(&update.reminder_id)
            .ok_or_else(|| StoreError::NotFound(format!("reminder {}", update.reminder_id)))?;
        reminder.status = update.status;
        if update.status == ReminderStatus::Sent {
            reminder.last_sent_on = Some(update.date);
        }
        Ok(reminder.clone())
    }

    async fn delete_reminder(&self, id: ReminderId) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        state
            .reminders
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("reminder {id}")))
    }
}

/// One call observed by [`MemoryMirror`].
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOp {
    Put(MirrorPath, serde_json::Value),
    Remove(MirrorPath),
    Append(MirrorPath, serde_json::Value),
}

#[derive(Debug, Default)]
struct MirrorState {
    records: BTreeMap<MirrorPath, serde_json::Value>,
    lists: BTreeMap<MirrorPath, Vec<serde_json::Value>>,
    ops: Vec<MirrorOp>,
    failures: VecDeque<StoreError>,
}

/// Mirror Store kept in memory, recording every successful operation.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    state: Mutex<MirrorState>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        lock(&self.state).failures.extend(errors);
    }

    pub fn get(&self, path: &MirrorPath) -> Option<serde_json::Value> {
        lock(&self.state).records.get(path).cloned()
    }

    pub fn list(&self, path: &MirrorPath) -> Vec<serde_json::Value> {
        lock(&self.state).lists.get(path).cloned().unwrap_or_default()
    }

    pub fn ops(&self) -> Vec<MirrorOp> {
        lock(&self.state).ops.clone()
    }

    /// Number of `put`s that reached `path`.
    pub fn put_count(&self, path: &MirrorPath) -> usize {
        lock(&self.state)
            .ops
            .iter()
            .filter(|op| matches!(op, MirrorOp::Put(p, _) if p == path))
            .count()
    }
}

impl MirrorState {
    fn enter(&mut self) -> Result<(), StoreError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    async fn put(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        state.records.insert(path.clone(), value.clone());
        state.ops.push(MirrorOp::Put(path.clone(), value.clone()));
        Ok(())
    }

    async fn remove(&self, path: &MirrorPath) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        state.records.remove(path);
        state.ops.push(MirrorOp::Remove(path.clone()));
        Ok(())
    }

    async fn append(&self, path: &MirrorPath, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        state.enter()?;
        state.lists.entry(path.clone()).or_default().push(value.clone());
        state.ops.push(MirrorOp::Append(path.clone(), value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DoseState, Frequency};
    use chrono::{NaiveDate, TimeZone};

    fn draft() -> MedicationDraft {
        MedicationDraft {
            name: "Aspirin".into(),
            dosage: "81mg".into(),
            frequency: Frequency::Daily,
            times_per_day: 2,
            times: vec!["08:00:00".into(), "20:00:00".into()],
            start_date: NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            end_date: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn dose_status_materializes_day_and_bumps_revision() {
        let store = MemoryAuthoritativeStore::new();
        let created = store.create_medication(&draft()).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 4, 9).unwrap();
        let updated = store
            .set_dose_status(&DoseStatusUpdate {
                medication_id: created.id,
                date,
                dose_index: 1,
                status: DoseState::Taken,
                at: Utc.with_ymd_and_hms(2025, 4, 9, 20, 0, 0).unwrap(),
            })
            .await
            .unwrap();

        let day = updated.day(date).unwrap();
        assert_eq!(day.len(), 2);
        assert!(day[1].taken());
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryAuthoritativeStore::new();
        store.fail_next([StoreError::RateLimited { retry_after: None }, StoreError::Unauthorized]);
        assert!(matches!(
            store.fetch_medications().await,
            Err(StoreError::RateLimited { .. })
        ));
        assert_eq!(store.fetch_medications().await, Err(StoreError::Unauthorized));
        assert!(store.fetch_medications().await.is_ok());
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn reminder_slot_conflicts() {
        let store = MemoryAuthoritativeStore::new();
        let med = store.create_medication(&draft()).await.unwrap();
        let single = ReminderDraft {
            medication_id: med.id,
            dose_index: 0,
            reminder_time: "07:30:00".into(),
            date: NaiveDate::from_ymd_opt(2025, 4, 9).unwrap(),
            kind: ReminderKind::Single,
        };
        let first = store.create_reminder(&single).await.unwrap();

        let moved = ReminderDraft {
            reminder_time: "07:45:00".into(),
            ..single.clone()
        };
        let second = store.create_reminder(&moved).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.reminder_time, "07:45:00");

        let daily = ReminderDraft {
            kind: ReminderKind::Daily,
            ..single
        };
        assert!(matches!(
            store.create_reminder(&daily).await,
            Err(StoreError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn mirror_records_operations() {
        let mirror = MemoryMirror::new();
        let path = MirrorPath::medication("u1", 1);
        mirror.put(&path, &serde_json::json!({"v": 1})).await.unwrap();
        mirror.fail_next([StoreError::TransientIo("down".into())]);
        assert!(mirror.remove(&path).await.is_err());
        assert_eq!(mirror.get(&path), Some(serde_json::json!({"v": 1})));
        assert_eq!(mirror.put_count(&path), 1);
    }
}

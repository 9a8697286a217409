//! The in-memory medication collection.
//!
//! `DoseLedger` is a plain state container: callers plan a transition against
//! it, persist the plan through the Synchronizer, and hand the confirmed
//! medication back with [`DoseLedger::commit`]. Dose status fields are never
//! written from anywhere else.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::{debug, warn};

use super::history::{history_rows, HistoryEntry, HistoryRow};
use super::machine::{auto_miss, mark_taken, undo_taken, Transition};
use super::window::{scheduled_at, DoseWindows};
use crate::error::DoseError;
use crate::model::{DoseKey, DoseRecord, DoseState, Medication, MedicationId};
use crate::stats::DatedDose;

#[derive(Debug, Clone)]
pub struct DoseLedger {
    medications: BTreeMap<MedicationId, Medication>,
    in_flight: HashMap<MedicationId, u32>,
    windows: DoseWindows,
    offset: FixedOffset,
    log: Vec<HistoryEntry>,
}

impl DoseLedger {
    pub fn new(windows: DoseWindows, offset: FixedOffset) -> Self {
        Self {
            medications: BTreeMap::new(),
            in_flight: HashMap::new(),
            windows,
            offset,
            log: Vec::new(),
        }
    }

    pub fn windows(&self) -> &DoseWindows {
        &self.windows
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The user's calendar date at `now`.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn medication(&self, id: MedicationId) -> Option<&Medication> {
        self.medications.get(&id)
    }

    pub fn medications(&self) -> impl Iterator<Item = &Medication> {
        self.medications.values()
    }

    pub fn len(&self) -> usize {
        self.medications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.medications.is_empty()
    }

    /// The dose at `key`, materializing a fresh record if its day has none yet.
    pub fn dose(&self, key: &DoseKey) -> Option<DoseRecord> {
        let med = self.medications.get(&key.medication_id)?;
        med.doses_on(key.date).get(key.dose_index).cloned()
    }

    pub fn state_of(&self, key: &DoseKey) -> Option<DoseState> {
        self.dose(key).map(|d| d.state())
    }

    /// Every `takenAt` currently recorded, oldest first.
    pub fn taken_timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut stamps: Vec<DateTime<Utc>> = self
            .medications
            .values()
            .flat_map(|med| med.dose_days())
            .flat_map(|(_, day)| day.iter().filter_map(DoseRecord::taken_at))
            .collect();
        stamps.sort();
        stamps
    }

    /// One entry per dose scheduled in `[start, end]` for medications active
    /// on each day.
    pub fn scheduled_doses(&self, start: NaiveDate, end: NaiveDate) -> Vec<DatedDose> {
        let mut out = Vec::new();
        for med in self.medications.values() {
            for date in start.iter_days().take_while(|d| *d <= end) {
                if !med.is_active_on(date) {
                    continue;
                }
                out.extend(med.doses_on(date).iter().map(|dose| DatedDose {
                    medication_id: med.id,
                    date,
                    taken: dose.taken(),
                    missed: dose.missed(),
                }));
            }
        }
        out
    }

    pub fn history_rows(&self) -> Vec<HistoryRow> {
        history_rows(self.medications.values())
    }

    /// Entries appended by confirmed transitions in this process.
    pub fn history_log(&self) -> &[HistoryEntry] {
        &self.log
    }

    /// Today's pending doses whose confirmation window contains `now`.
    pub fn due_doses(&self, now: DateTime<Utc>) -> Vec<DoseKey> {
        let today = self.local_date(now);
        let mut due = Vec::new();
        for med in self.medications.values().filter(|m| m.is_active_on(today)) {
            for dose in med.doses_on(today).iter() {
                if dose.state() != DoseState::Pending {
                    continue;
                }
                let key = DoseKey::new(med.id, today, dose.dose_index());
                match scheduled_at(&key, dose.time(), self.offset) {
                    Ok(scheduled) if self.windows.within_confirm(scheduled, now) => due.push(key),
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "skipping dose with malformed time"),
                }
            }
        }
        due
    }

    // ── Planning ────────────────────────────────────────────────────

    /// Validate moving the dose at `key` to `to` at `now`.
    ///
    /// Only `Taken` (from `Pending`), `Pending` (undo from `Taken`) and
    /// `Missed` (from `Pending`) targets exist.
    pub fn plan(
        &self,
        key: DoseKey,
        to: DoseState,
        now: DateTime<Utc>,
    ) -> Result<Transition, DoseError> {
        let med = self.medications.get(&key.medication_id).ok_or_else(|| {
            DoseError::InvalidReference(format!("medication {} not found", key.medication_id))
        })?;
        let day = med.doses_on(key.date);
        let record = day.get(key.dose_index).ok_or_else(|| {
            DoseError::InvalidReference(format!(
                "medication {} has no dose index {} on {}",
                key.medication_id, key.dose_index, key.date
            ))
        })?;
        let scheduled = scheduled_at(&key, record.time(), self.offset)?;

        let transition = match to {
            DoseState::Taken => mark_taken(record, key, scheduled, now, &self.windows),
            DoseState::Pending => undo_taken(record, key, scheduled, now, &self.windows),
            DoseState::Missed => auto_miss(record, key, scheduled, now, &self.windows),
        }?;
        debug!(
            medication_id = key.medication_id,
            date = %key.date,
            dose_index = key.dose_index,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            "transition planned"
        );
        Ok(transition)
    }

    /// Every pending dose whose miss window has elapsed at `now`.
    ///
    /// Scans materialized days plus today for active medications; doses with
    /// malformed times are skipped.
    pub fn miss_candidates(&self, now: DateTime<Utc>) -> Vec<Transition> {
        let today = self.local_date(now);
        let mut out = Vec::new();
        for med in self.medications.values() {
            let mut dates: Vec<NaiveDate> = med.dose_days().map(|(d, _)| d).collect();
            if med.is_active_on(today) && med.day(today).is_none() {
                dates.push(today);
            }
            for date in dates {
                for dose in med.doses_on(date).iter() {
                    if dose.state() != DoseState::Pending {
                        continue;
                    }
                    let key = DoseKey::new(med.id, date, dose.dose_index());
                    let scheduled = match scheduled_at(&key, dose.time(), self.offset) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "miss sweep skipping dose");
                            continue;
                        }
                    };
                    if let Ok(t) = auto_miss(dose, key, scheduled, now, &self.windows) {
                        out.push(t);
                    }
                }
            }
        }
        out
    }

    // ── Commit ──────────────────────────────────────────────────────

    /// Mark a mutation of `id` as in flight; mirror pushes for it are ignored
    /// until [`finish`](Self::finish).
    pub fn begin(&mut self, id: MedicationId) {
        *self.in_flight.entry(id).or_insert(0) += 1;
    }

    pub fn finish(&mut self, id: MedicationId) {
        if let Some(count) = self.in_flight.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&id);
            }
        }
    }

    pub fn is_in_flight(&self, id: MedicationId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Land a confirmed transition.
    ///
    /// `confirmed` is the Authoritative Store's response and replaces the
    /// local medication. If the response did not echo the affected day, the
    /// transition is applied to it locally.
    pub fn commit(&mut self, transition: &Transition, confirmed: Medication) -> HistoryEntry {
        let key = transition.key;
        let mut confirmed = confirmed.normalize();
        let echoed = confirmed
            .day(key.date)
            .and_then(|day| day.get(key.dose_index))
            .map(DoseRecord::state);
        match echoed {
            Some(state) if state != transition.to => {
                debug!(
                    medication_id = key.medication_id,
                    dose_index = key.dose_index,
                    confirmed = state.as_str(),
                    planned = transition.to.as_str(),
                    "store resolved a concurrent write"
                );
            }
            Some(_) => {}
            None => {
                let mut day = confirmed.doses_on(key.date).into_owned();
                if let Some(record) = day.get_mut(key.dose_index) {
                    transition.apply(record);
                }
                confirmed.doses.insert(key.date, day);
            }
        }

        let entry = HistoryEntry::from_transition(transition, &confirmed);
        self.log.push(entry.clone());
        self.medications.insert(confirmed.id, confirmed);
        entry
    }

    /// Insert or replace a confirmed medication (create, update, refresh).
    pub fn upsert(&mut self, medication: Medication) {
        let medication = medication.normalize();
        self.medications.insert(medication.id, medication);
    }

    pub fn replace_all(&mut self, medications: impl IntoIterator<Item = Medication>) {
        self.medications = medications
            .into_iter()
            .map(|m| {
                let m = m.normalize();
                (m.id, m)
            })
            .collect();
    }

    pub fn remove(&mut self, id: MedicationId) -> Option<Medication> {
        self.medications.remove(&id)
    }

    /// Apply a medication snapshot pushed by the Mirror Store.
    ///
    /// Accepted only when no local mutation of that medication is in flight
    /// and the push is strictly newer than the local confirmed revision.
    pub fn apply_mirror_push(&mut self, pushed: Medication) -> bool {
        if self.is_in_flight(pushed.id) {
            debug!(medication_id = pushed.id, "mirror push ignored: mutation in flight");
            return false;
        }
        let newer = match self.medications.get(&pushed.id) {
            None => true,
            Some(local) => match (pushed.updated_at, local.updated_at) {
                (Some(p), Some(l)) => p > l,
                (Some(_), None) => true,
                (None, _) => false,
            },
        };
        if !newer {
            debug!(medication_id = pushed.id, "mirror push ignored: not newer");
            return false;
        }
        self.upsert(pushed);
        true
    }
}

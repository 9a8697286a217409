//! Medication tracker service.
//!
//! `MedicationTracker` owns the dose ledger, the reminder set and the reminder
//! engine, and routes every mutation through the [`Synchronizer`]:
//!
//! 1. plan the change against local state (validation errors stop here)
//! 2. write it to the Authoritative Store (retried on rate limits)
//! 3. land the confirmed response locally, publish an [`Event`]
//! 4. replicate the confirmed response to the Mirror Store in the background
//!
//! A failure at step 2 leaves local state exactly as it was.
//!
//! The periodic tick (miss sweep followed by the reminder check) is driven by a
//! [`Scheduler`], so tests can run it by hand.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::dose::{DoseLedger, HistoryEntry, HistoryRow, Transition};
use crate::error::{ConfigError, CoreError, DoseError, Result, StoreError};
use crate::events::{Event, EventBus};
use crate::model::{
    DoseKey, DoseRecord, DoseState, Medication, MedicationDraft, MedicationId, Reminder,
    ReminderDraft, ReminderId, ReminderStatus,
};
use crate::reminder::{
    CancelHandle, ReminderEngine, ReminderPrompt, ReminderSettings, Scheduler, Task, TaskFuture,
};
use crate::stats::{compute_adherence, compute_streak, AdherenceReport};
use crate::sync::{
    AuthoritativeStore, DoseStatusUpdate, HttpMirror, MirrorStore, ReminderStatusUpdate,
    RestStore, Synchronizer,
};

const DEFAULT_USER: &str = "local";

pub struct MedicationTracker {
    ledger: Mutex<DoseLedger>,
    reminders: Mutex<BTreeMap<ReminderId, Reminder>>,
    engine: Mutex<ReminderEngine>,
    sync: Synchronizer,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: TrackerConfig,
}

impl MedicationTracker {
    /// Build a tracker over the given stores. The configuration is validated
    /// first.
    pub fn new(
        config: TrackerConfig,
        authority: Arc<dyn AuthoritativeStore>,
        mirror: Arc<dyn MirrorStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let user = config
            .store
            .user_id
            .clone()
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        let sync = Synchronizer::new(
            authority,
            mirror,
            config.retry_policy(),
            config.coalesce_window(),
            user,
        );
        let engine = ReminderEngine::with_settings(ReminderSettings {
            trigger_window: config.trigger_window(),
            prompt_due_doses: config.reminders.prompt_due_doses,
        });
        Ok(Self {
            ledger: Mutex::new(DoseLedger::new(config.dose_windows(), config.local_offset())),
            reminders: Mutex::new(BTreeMap::new()),
            engine: Mutex::new(engine),
            sync,
            events: EventBus::default(),
            clock,
            config,
        })
    }

    /// Build a tracker talking to the REST API and HTTP mirror named in
    /// `config.store`, authenticated with `token`.
    pub fn connect(config: TrackerConfig, token: &str, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let timeout = config.request_timeout();
        let authority = RestStore::new(&config.store.api_base_url, token, timeout)?;
        let mirror_url = config
            .store
            .mirror_base_url
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "store.mirror_base_url".into(),
                message: "required to connect".into(),
            })?;
        let mirror = HttpMirror::new(mirror_url, Some(token.to_string()), timeout)?;
        Self::new(config, Arc::new(authority), Arc::new(mirror), clock)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The user's calendar date right now.
    pub fn today(&self) -> NaiveDate {
        self.clock
            .now()
            .with_timezone(&self.config.local_offset())
            .date_naive()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn medications(&self) -> Vec<Medication> {
        self.ledger.lock().await.medications().cloned().collect()
    }

    pub async fn medication(&self, id: MedicationId) -> Option<Medication> {
        self.ledger.lock().await.medication(id).cloned()
    }

    pub async fn reminders(&self) -> Vec<Reminder> {
        self.reminders.lock().await.values().cloned().collect()
    }

    pub async fn dose(&self, key: &DoseKey) -> Option<DoseRecord> {
        self.ledger.lock().await.dose(key)
    }

    pub async fn history_rows(&self) -> Vec<HistoryRow> {
        self.ledger.lock().await.history_rows()
    }

    /// History entries confirmed by this process, oldest first.
    pub async fn history_log(&self) -> Vec<HistoryEntry> {
        self.ledger.lock().await.history_log().to_vec()
    }

    /// Adherence over the inclusive range `[start, end]`.
    pub async fn adherence(&self, start: NaiveDate, end: NaiveDate) -> AdherenceReport {
        let doses = self.ledger.lock().await.scheduled_doses(start, end);
        AdherenceReport::from_days(compute_adherence(&doses, start, end))
    }

    /// Consecutive local days with at least one taken dose, ending at the
    /// most recent one.
    pub async fn streak(&self) -> u32 {
        let stamps = self.ledger.lock().await.taken_timestamps();
        compute_streak(&stamps, self.config.local_offset())
    }

    // ── Dose transitions ────────────────────────────────────────────

    /// `Pending -> Taken` for the dose at `key`.
    pub async fn mark_taken(&self, key: DoseKey) -> Result<HistoryEntry> {
        self.transition(key, DoseState::Taken).await
    }

    /// `Taken -> Pending` for the dose at `key`.
    pub async fn undo_taken(&self, key: DoseKey) -> Result<HistoryEntry> {
        self.transition(key, DoseState::Pending).await
    }

    async fn transition(&self, key: DoseKey, to: DoseState) -> Result<HistoryEntry> {
        let now = self.clock.now();
        let planned = {
            let mut ledger = self.ledger.lock().await;
            let planned = ledger.plan(key, to, now)?;
            ledger.begin(key.medication_id);
            planned
        };
        let entry = self.persist(&planned).await?;
        // User actions are discrete events and skip coalescing.
        self.replicate(&planned, &entry, true).await;
        Ok(entry)
    }

    /// Send a planned transition to the Authoritative Store and land the
    /// confirmed response. The ledger must have been `begin`-marked for the
    /// medication.
    async fn persist(&self, planned: &Transition) -> Result<HistoryEntry> {
        let key = planned.key;
        let result = self
            .sync
            .set_dose_status(&DoseStatusUpdate::from(planned))
            .await;

        let mut ledger = self.ledger.lock().await;
        ledger.finish(key.medication_id);
        let confirmed = match result {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(
                    medication_id = key.medication_id,
                    date = %key.date,
                    dose_index = key.dose_index,
                    to = planned.to.as_str(),
                    error = %e,
                    "dose transition not confirmed"
                );
                return Err(e.into());
            }
        };
        let entry = ledger.commit(planned, confirmed);
        info!(
            medication_id = key.medication_id,
            date = %key.date,
            dose_index = key.dose_index,
            from = planned.from.as_str(),
            to = planned.to.as_str(),
            "dose transition confirmed"
        );
        Ok(entry)
    }

    async fn replicate(&self, planned: &Transition, entry: &HistoryEntry, immediate: bool) {
        let key = planned.key;
        let snapshot = self.ledger.lock().await.medication(key.medication_id).cloned();
        if let Some(snapshot) = snapshot {
            if immediate {
                self.sync.replicate_medication_now(&snapshot).await;
            } else {
                self.sync.replicate_medication(&snapshot).await;
            }
        }
        if planned.to != DoseState::Pending {
            self.sync.replicate_history(entry).await;
        }
        self.events.publish(Event::MedicationUpdated {
            medication_id: key.medication_id,
            date: key.date,
            dose_index: key.dose_index,
            status: entry.status,
            at: entry.timestamp,
        });
    }

    /// Move every pending dose whose miss window has elapsed to `Missed`.
    ///
    /// Each miss is persisted on its own; a failed one is logged and left
    /// pending for the next sweep. An expired session aborts the sweep.
    pub async fn sweep_missed(&self) -> Result<usize> {
        let now = self.clock.now();
        let candidates = self.ledger.lock().await.miss_candidates(now);
        let mut missed = 0;

        for candidate in candidates {
            let key = candidate.key;
            let planned = {
                let mut ledger = self.ledger.lock().await;
                // A user action may have landed since the scan.
                match ledger.plan(key, DoseState::Missed, now) {
                    Ok(planned) => {
                        ledger.begin(key.medication_id);
                        planned
                    }
                    Err(_) => continue,
                }
            };
            match self.persist(&planned).await {
                Ok(entry) => {
                    self.replicate(&planned, &entry, false).await;
                    missed += 1;
                }
                Err(CoreError::Store(StoreError::Unauthorized)) => {
                    error!("miss sweep stopped: session expired");
                    return Err(StoreError::Unauthorized.into());
                }
                Err(_) => {}
            }
        }

        if missed > 0 {
            info!(count = missed, "miss sweep confirmed misses");
            self.events.publish(Event::DosesMissed { count: missed, at: now });
        }
        Ok(missed)
    }

    // ── Reminders ───────────────────────────────────────────────────

    /// Evaluate reminders and due doses now, publish prompts and record
    /// delivered reminders as sent.
    ///
    /// A reminder whose status update fails stays pending locally and is
    /// marked again on the next tick; it is not prompted twice.
    pub async fn check_reminders(&self) -> Result<Vec<ReminderPrompt>> {
        let now = self.clock.now();
        let reminders = self.reminders().await;
        let outcome = {
            let ledger = self.ledger.lock().await;
            self.engine.lock().await.evaluate(now, &reminders, &ledger)
        };

        for prompt in &outcome.prompts {
            self.events.publish(Event::DosePrompt {
                prompt: prompt.clone(),
                at: now,
            });
        }

        for (reminder_id, day) in outcome.to_mark_sent {
            let update = ReminderStatusUpdate {
                reminder_id,
                status: ReminderStatus::Sent,
                date: day,
            };
            match self.sync.update_reminder_status(&update).await {
                Ok(confirmed) => {
                    let confirmed = if confirmed.is_sent_for(day) {
                        confirmed
                    } else {
                        confirmed.marked_sent(day)
                    };
                    self.reminders.lock().await.insert(confirmed.id, confirmed.clone());
                    self.sync.replicate_reminder(&confirmed).await;
                    self.events.publish(Event::ReminderSent {
                        reminder_id,
                        date: day,
                        at: now,
                    });
                }
                Err(StoreError::Unauthorized) => return Err(StoreError::Unauthorized.into()),
                Err(e) => {
                    warn!(reminder_id, date = %day, error = %e, "could not mark reminder sent");
                }
            }
        }

        Ok(outcome.prompts)
    }

    /// Validate and create a reminder, then run the trigger check once.
    pub async fn create_reminder(&self, draft: ReminderDraft) -> Result<Reminder> {
        let now = self.clock.now();
        let draft = {
            let ledger = self.ledger.lock().await;
            let med = ledger.medication(draft.medication_id).ok_or_else(|| {
                DoseError::InvalidReference(format!("medication {} not found", draft.medication_id))
            })?;
            draft.validate(med, now, ledger.offset(), self.config.reminder_lead())?
        };
        let reminder = self.sync.create_reminder(&draft).await?;
        info!(
            reminder_id = reminder.id,
            medication_id = reminder.medication_id,
            dose_index = reminder.dose_index,
            "reminder created"
        );
        self.reminders.lock().await.insert(reminder.id, reminder.clone());
        self.sync.replicate_reminder(&reminder).await;
        self.recheck_reminders().await;
        Ok(reminder)
    }

    pub async fn delete_reminder(&self, id: ReminderId) -> Result<()> {
        self.sync.delete_reminder(id).await?;
        self.reminders.lock().await.remove(&id);
        self.sync.remove_reminder(id).await;
        info!(reminder_id = id, "reminder deleted");
        Ok(())
    }

    async fn recheck_reminders(&self) {
        if let Err(e) = self.check_reminders().await {
            warn!(error = %e, "reminder check after change failed");
        }
    }

    // ── Medication lifecycle ────────────────────────────────────────

    pub async fn add_medication(&self, draft: MedicationDraft) -> Result<Medication> {
        let draft = draft.validate()?;
        let created = self.sync.create_medication(&draft).await?;
        self.ledger.lock().await.upsert(created.clone());
        info!(medication_id = created.id, "medication added");
        self.sync.replicate_medication(&created).await;
        self.events.publish(Event::MedicationAdded {
            medication_id: created.id,
            at: self.clock.now(),
        });
        Ok(created)
    }

    pub async fn update_medication(
        &self,
        id: MedicationId,
        draft: MedicationDraft,
    ) -> Result<Medication> {
        let draft = draft.validate()?;
        {
            let mut ledger = self.ledger.lock().await;
            if ledger.medication(id).is_none() {
                return Err(DoseError::InvalidReference(format!("medication {id} not found")).into());
            }
            ledger.begin(id);
        }
        let result = self.sync.update_medication(id, &draft).await;
        let updated = {
            let mut ledger = self.ledger.lock().await;
            ledger.finish(id);
            let updated = result?;
            ledger.upsert(updated.clone());
            updated
        };
        info!(medication_id = id, "medication updated");
        self.sync.replicate_medication(&updated).await;
        self.events.publish(Event::MedicationEdited {
            medication_id: id,
            at: self.clock.now(),
        });
        Ok(updated)
    }

    /// Delete a medication. Its reminders are left in place and skipped as
    /// orphans by the reminder engine.
    pub async fn delete_medication(&self, id: MedicationId) -> Result<()> {
        self.ledger.lock().await.begin(id);
        let result = self.sync.delete_medication(id).await;
        {
            let mut ledger = self.ledger.lock().await;
            ledger.finish(id);
            result?;
            ledger.remove(id);
        }
        info!(medication_id = id, "medication deleted");
        self.sync.remove_medication(id).await;
        self.events.publish(Event::MedicationRemoved {
            medication_id: id,
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Replace local state with the Authoritative Store's and re-mirror it.
    pub async fn refresh(&self) -> Result<()> {
        let medications = self.sync.fetch_medications().await?;
        let reminders = self.sync.fetch_reminders().await?;
        info!(
            medications = medications.len(),
            reminders = reminders.len(),
            "refreshed from authoritative store"
        );

        let snapshots = {
            let mut ledger = self.ledger.lock().await;
            ledger.replace_all(medications);
            ledger.medications().cloned().collect::<Vec<_>>()
        };
        *self.reminders.lock().await = reminders.into_iter().map(|r| (r.id, r)).collect();

        for snapshot in &snapshots {
            self.sync.replicate_medication(snapshot).await;
        }
        self.recheck_reminders().await;
        Ok(())
    }

    /// Apply a medication snapshot pushed by another client through the
    /// Mirror Store. Returns whether local state changed.
    pub async fn apply_mirror_push(&self, pushed: Medication) -> bool {
        let id = pushed.id;
        let applied = self.ledger.lock().await.apply_mirror_push(pushed);
        if applied {
            info!(medication_id = id, "mirror push applied");
            self.events.publish(Event::MirrorApplied {
                medication_id: id,
                at: self.clock.now(),
            });
        }
        applied
    }

    // ── Periodic work ───────────────────────────────────────────────

    /// One poll: the miss sweep, then the reminder check.
    pub async fn tick(&self) {
        if let Err(e) = self.sweep_missed().await {
            warn!(error = %e, "miss sweep failed");
        }
        if let Err(e) = self.check_reminders().await {
            warn!(error = %e, "reminder check failed");
        }
    }

    /// Schedule [`tick`](Self::tick) every poll period. The task holds a weak
    /// reference and stops doing work once the tracker is dropped.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler) -> CancelHandle {
        let weak = Arc::downgrade(self);
        let task: Task = Arc::new(move || -> TaskFuture {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(tracker) = weak.upgrade() {
                    tracker.tick().await;
                }
            })
        });
        let period = self.config.poll_period();
        info!(period_secs = period.as_secs(), "tracker polling started");
        scheduler.schedule(period, task)
    }
}

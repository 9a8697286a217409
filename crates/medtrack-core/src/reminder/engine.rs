//! Reminder engine.
//!
//! Evaluates reminders (and, optionally, due doses without a reminder) against
//! the current time and decides which prompts to raise. The engine owns the
//! prompted-key set that keeps every occurrence to a single prompt for the
//! lifetime of the process; it performs no I/O itself.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dose::DoseLedger;
use crate::model::{DoseKey, DoseState, Reminder, ReminderId};

/// Identity of a prompt: one per `(medication, date, dose index)`.
pub type PromptKey = DoseKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PromptSource {
    Reminder { reminder_id: ReminderId },
    DueDose,
}

/// A request to surface a dose to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPrompt {
    pub key: PromptKey,
    pub medication_name: String,
    pub dosage: String,
    pub dose_time: String,
    pub source: PromptSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderSettings {
    /// Half-width of the window around a reminder's trigger time.
    pub trigger_window: Duration,
    pub prompt_due_doses: bool,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            trigger_window: Duration::seconds(30),
            prompt_due_doses: true,
        }
    }
}

/// What a tick decided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub prompts: Vec<ReminderPrompt>,
    /// Reminders whose occurrence on the given date should be marked sent.
    pub to_mark_sent: Vec<(ReminderId, NaiveDate)>,
}

#[derive(Debug, Clone, Default)]
pub struct ReminderEngine {
    settings: ReminderSettings,
    prompted: HashSet<PromptKey>,
}

impl ReminderEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: ReminderSettings) -> Self {
        Self {
            settings,
            prompted: HashSet::new(),
        }
    }

    pub fn settings(&self) -> &ReminderSettings {
        &self.settings
    }

    pub fn was_prompted(&self, key: &PromptKey) -> bool {
        self.prompted.contains(key)
    }

    pub fn prompted_count(&self) -> usize {
        self.prompted.len()
    }

    /// Drop prompt keys older than yesterday. Yesterday's keys stay while a
    /// late-evening trigger window can still reach past midnight.
    pub fn prune(&mut self, today: NaiveDate) {
        let keep_from = today.pred_opt().unwrap_or(today);
        self.prompted.retain(|key| key.date >= keep_from);
    }

    /// Evaluate `reminders` and the ledger's due doses at `now`.
    pub fn evaluate(
        &mut self,
        now: DateTime<Utc>,
        reminders: &[Reminder],
        ledger: &DoseLedger,
    ) -> TickOutcome {
        let today = ledger.local_date(now);
        self.prune(today);

        let mut outcome = TickOutcome::default();
        let mut armed_today: HashSet<PromptKey> = HashSet::new();

        for reminder in reminders {
            // Yesterday's occurrence is still live when its window crosses midnight.
            let mut days: Vec<NaiveDate> = [Some(today), today.pred_opt()]
                .into_iter()
                .flatten()
                .filter_map(|date| reminder.occurrence_on(date))
                .filter(|day| !reminder.is_sent_for(*day))
                .collect();
            days.dedup();
            if days.is_empty() {
                continue;
            }
            let Some(med) = ledger.medication(reminder.medication_id) else {
                warn!(
                    reminder_id = reminder.id,
                    medication_id = reminder.medication_id,
                    "skipping orphaned reminder"
                );
                continue;
            };
            let Some(dose_time) = med.times.get(reminder.dose_index) else {
                warn!(
                    reminder_id = reminder.id,
                    dose_index = reminder.dose_index,
                    "skipping reminder for unknown dose"
                );
                continue;
            };

            for day in days {
                let Some(trigger) = reminder.trigger_at(day, ledger.offset()) else {
                    warn!(reminder_id = reminder.id, time = %reminder.reminder_time, "skipping reminder with malformed time");
                    break;
                };

                let key = PromptKey::new(med.id, day, reminder.dose_index);
                if day == today {
                    armed_today.insert(key);
                }
                if (now - trigger).abs() > self.settings.trigger_window {
                    continue;
                }

                // A dose already taken is not prompted, but the occurrence is still consumed.
                let taken = ledger.state_of(&key) == Some(DoseState::Taken);
                if !taken && self.prompted.insert(key) {
                    info!(
                        reminder_id = reminder.id,
                        medication_id = med.id,
                        date = %day,
                        dose_index = reminder.dose_index,
                        "reminder fired"
                    );
                    outcome.prompts.push(ReminderPrompt {
                        key,
                        medication_name: med.name.clone(),
                        dosage: med.dosage.clone(),
                        dose_time: dose_time.clone(),
                        source: PromptSource::Reminder {
                            reminder_id: reminder.id,
                        },
                    });
                }
                outcome.to_mark_sent.push((reminder.id, day));
            }
        }

        if self.settings.prompt_due_doses {
            for key in ledger.due_doses(now) {
                if armed_today.contains(&key) || !self.prompted.insert(key) {
                    continue;
                }
                let Some(med) = ledger.medication(key.medication_id) else {
                    continue;
                };
                debug!(medication_id = key.medication_id, dose_index = key.dose_index, "due dose prompted");
                outcome.prompts.push(ReminderPrompt {
                    key,
                    medication_name: med.name.clone(),
                    dosage: med.dosage.clone(),
                    dose_time: med.times.get(key.dose_index).cloned().unwrap_or_default(),
                    source: PromptSource::DueDose,
                });
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dose::DoseWindows;
    use crate::model::{Frequency, Medication, MedicationDraft, ReminderKind, ReminderStatus};
    use chrono::{FixedOffset, TimeZone};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, day).unwrap()
    }

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, day, h, m, s).unwrap()
    }

    fn ledger() -> DoseLedger {
        let mut ledger = DoseLedger::new(DoseWindows::default(), FixedOffset::east_opt(0).unwrap());
        let draft = MedicationDraft {
            name: "Lisinopril".into(),
            dosage: "10mg".into(),
            frequency: Frequency::Daily,
            times_per_day: 2,
            times: vec!["09:00:00".into(), "21:00:00".into()],
            start_date: d(1),
            end_date: None,
            notes: None,
        };
        ledger.upsert(Medication::from_draft(5, &draft));
        ledger
    }

    fn reminder(kind: ReminderKind) -> Reminder {
        Reminder {
            id: 11,
            medication_id: 5,
            dose_index: 0,
            reminder_time: "08:30:00".into(),
            date: d(9),
            kind,
            status: ReminderStatus::Pending,
            last_sent_on: None,
        }
    }

    fn reminder_only() -> ReminderEngine {
        ReminderEngine::with_settings(ReminderSettings {
            prompt_due_doses: false,
            ..ReminderSettings::default()
        })
    }

    #[test]
    fn fires_once_across_ticks_inside_window() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let reminders = vec![reminder(ReminderKind::Single)];

        let mut prompts = 0;
        for offset in [-30i64, -20, -10, 0, 10, 20, 30] {
            let now = at(9, 8, 30, 0) + Duration::seconds(offset);
            prompts += engine.evaluate(now, &reminders, &ledger).prompts.len();
        }
        assert_eq!(prompts, 1);
        assert!(engine.was_prompted(&PromptKey::new(5, d(9), 0)));
    }

    #[test]
    fn outside_window_does_nothing() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let reminders = vec![reminder(ReminderKind::Single)];
        let out = engine.evaluate(at(9, 8, 30, 31), &reminders, &ledger);
        assert!(out.prompts.is_empty());
        assert!(out.to_mark_sent.is_empty());
        let out = engine.evaluate(at(9, 8, 29, 29), &reminders, &ledger);
        assert!(out.prompts.is_empty());
    }

    #[test]
    fn mark_sent_is_requested_until_confirmed() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let reminders = vec![reminder(ReminderKind::Single)];
        let first = engine.evaluate(at(9, 8, 30, 0), &reminders, &ledger);
        let second = engine.evaluate(at(9, 8, 30, 10), &reminders, &ledger);
        assert_eq!(first.to_mark_sent, vec![(11, d(9))]);
        assert_eq!(second.to_mark_sent, vec![(11, d(9))]);
        assert!(second.prompts.is_empty());

        let sent = vec![reminders[0].marked_sent(d(9))];
        assert!(engine.evaluate(at(9, 8, 30, 20), &sent, &ledger).to_mark_sent.is_empty());
    }

    #[test]
    fn daily_reminder_fires_again_next_day() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let daily = reminder(ReminderKind::Daily);
        assert_eq!(engine.evaluate(at(9, 8, 30, 0), &[daily.clone()], &ledger).prompts.len(), 1);

        let sent = daily.marked_sent(d(9));
        let next = engine.evaluate(at(10, 8, 30, 5), &[sent], &ledger);
        assert_eq!(next.prompts.len(), 1);
        assert_eq!(next.prompts[0].key.date, d(10));
        assert_eq!(engine.prompted_count(), 2);

        engine.prune(d(12));
        assert_eq!(engine.prompted_count(), 0);
    }

    #[test]
    fn daily_trigger_just_before_midnight_fires_after_it() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let mut late = reminder(ReminderKind::Daily);
        late.reminder_time = "23:59:50".into();

        assert!(engine.evaluate(at(9, 23, 59, 10), &[late.clone()], &ledger).prompts.is_empty());
        let out = engine.evaluate(at(10, 0, 0, 10), &[late.clone()], &ledger);
        assert_eq!(out.prompts.len(), 1);
        assert_eq!(out.prompts[0].key.date, d(9));
        assert_eq!(out.to_mark_sent, vec![(11, d(9))]);

        // Until the mark-sent lands, the next tick must not prompt again.
        assert!(engine.evaluate(at(10, 0, 0, 20), &[late.clone()], &ledger).prompts.is_empty());
        let sent = late.marked_sent(d(9));
        assert!(engine.evaluate(at(10, 0, 0, 30), &[sent], &ledger).to_mark_sent.is_empty());
    }

    #[test]
    fn orphaned_reminder_is_skipped() {
        let ledger = ledger();
        let mut engine = reminder_only();
        let mut orphan = reminder(ReminderKind::Single);
        orphan.medication_id = 404;
        let out = engine.evaluate(at(9, 8, 30, 0), &[orphan], &ledger);
        assert_eq!(out, TickOutcome::default());
    }

    #[test]
    fn due_dose_prompted_once_when_no_reminder() {
        let ledger = ledger();
        let mut engine = ReminderEngine::new();
        let first = engine.evaluate(at(9, 8, 15, 0), &[], &ledger);
        assert_eq!(first.prompts.len(), 1);
        assert_eq!(first.prompts[0].source, PromptSource::DueDose);
        assert!(engine.evaluate(at(9, 8, 16, 0), &[], &ledger).prompts.is_empty());
    }

    #[test]
    fn due_dose_defers_to_pending_reminder() {
        let ledger = ledger();
        let mut engine = ReminderEngine::new();
        let reminders = vec![reminder(ReminderKind::Single)];
        // 08:15 is inside the dose's confirmation window but before the reminder.
        assert!(engine.evaluate(at(9, 8, 15, 0), &reminders, &ledger).prompts.is_empty());
        let fired = engine.evaluate(at(9, 8, 30, 0), &reminders, &ledger);
        assert_eq!(fired.prompts.len(), 1);
        assert!(matches!(fired.prompts[0].source, PromptSource::Reminder { reminder_id: 11 }));
    }
}

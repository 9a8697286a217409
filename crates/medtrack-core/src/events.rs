use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{DoseState, MedicationId, ReminderId};
use crate::reminder::ReminderPrompt;

/// Every confirmed change in the tracker produces an Event.
/// Connected views subscribe to refresh without polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A dose transition was confirmed by the Authoritative Store.
    MedicationUpdated {
        medication_id: MedicationId,
        date: NaiveDate,
        dose_index: usize,
        status: DoseState,
        at: DateTime<Utc>,
    },
    MedicationAdded {
        medication_id: MedicationId,
        at: DateTime<Utc>,
    },
    MedicationEdited {
        medication_id: MedicationId,
        at: DateTime<Utc>,
    },
    MedicationRemoved {
        medication_id: MedicationId,
        at: DateTime<Utc>,
    },
    /// A reminder or due dose needs the user's attention.
    DosePrompt {
        prompt: ReminderPrompt,
        at: DateTime<Utc>,
    },
    ReminderSent {
        reminder_id: ReminderId,
        date: NaiveDate,
        at: DateTime<Utc>,
    },
    /// The miss sweep confirmed one or more misses.
    DosesMissed {
        count: usize,
        at: DateTime<Utc>,
    },
    /// A mirror push from another client replaced local state.
    MirrorApplied {
        medication_id: MedicationId,
        at: DateTime<Utc>,
    },
}

/// Fan-out channel for [`Event`]s.
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn medication_updated_wire_tag() {
        let event = Event::MedicationUpdated {
            medication_id: 3,
            date: NaiveDate::from_ymd_opt(2025, 4, 9).unwrap(),
            dose_index: 0,
            status: DoseState::Taken,
            at: Utc.with_ymd_and_hms(2025, 4, 9, 8, 5, 0).unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "medicationUpdated");
        assert_eq!(json["status"], "Taken");
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let at = Utc.with_ymd_and_hms(2025, 4, 9, 8, 5, 0).unwrap();
        assert_eq!(bus.publish(Event::MedicationRemoved { medication_id: 1, at }), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::MedicationRemoved { medication_id: 1, at }
        );
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        let at = Utc.with_ymd_and_hms(2025, 4, 9, 8, 5, 0).unwrap();
        assert_eq!(bus.publish(Event::DosesMissed { count: 2, at }), 0);
    }
}

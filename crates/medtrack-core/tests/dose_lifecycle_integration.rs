//! Integration tests for the dose lifecycle.
//!
//! Drives a tracker over in-memory stores through a two-day schedule: taking,
//! undoing and auto-missing doses, then reading adherence and streak back.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use medtrack_core::{
    CoreError, DoseError, DoseKey, DoseState, Frequency, ManualClock, MedicationDraft,
    MedicationTracker, MemoryAuthoritativeStore, MemoryMirror, Medication, TrackerConfig,
};

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, n).unwrap()
}

fn at(n: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, n, h, m, 0).unwrap()
}

fn twice_daily() -> MedicationDraft {
    MedicationDraft {
        name: "Metformin".into(),
        dosage: "500mg".into(),
        frequency: Frequency::Daily,
        times_per_day: 2,
        times: vec!["08:00:00".into(), "20:00:00".into()],
        start_date: day(9),
        end_date: None,
        notes: None,
    }
}

struct Harness {
    tracker: MedicationTracker,
    clock: Arc<ManualClock>,
    med_id: i64,
}

async fn harness() -> Harness {
    let authority = Arc::new(MemoryAuthoritativeStore::new());
    let med = authority.insert_medication(Medication::from_draft(0, &twice_daily()));
    let clock = Arc::new(ManualClock::new(at(9, 7, 0)));
    let mut config = TrackerConfig::default();
    config.store.user_id = Some("u1".into());
    let tracker = MedicationTracker::new(
        config,
        authority,
        Arc::new(MemoryMirror::new()),
        clock.clone(),
    )
    .unwrap();
    tracker.refresh().await.unwrap();
    Harness {
        tracker,
        clock,
        med_id: med.id,
    }
}

#[tokio::test(start_paused = true)]
async fn take_undo_and_sweep_over_one_day() {
    let h = harness().await;
    let first = DoseKey::new(h.med_id, day(9), 0);
    let second = DoseKey::new(h.med_id, day(9), 1);

    h.clock.set(at(9, 8, 5));
    h.tracker.mark_taken(first).await.unwrap();
    let dose = h.tracker.dose(&first).await.unwrap();
    assert!(dose.taken());
    assert_eq!(dose.taken_at(), Some(at(9, 8, 5)));

    h.clock.set(at(9, 11, 0));
    let err = h.tracker.undo_taken(first).await.unwrap_err();
    assert!(err.is_timing_rule());
    assert!(matches!(
        err,
        CoreError::Dose(DoseError::OutOfWindow { offset_secs: 10_800, .. })
    ));
    assert_eq!(h.tracker.dose(&first).await.unwrap().state(), DoseState::Taken);

    h.clock.set(at(9, 22, 30));
    assert_eq!(h.tracker.sweep_missed().await.unwrap(), 1);
    assert_eq!(h.tracker.dose(&second).await.unwrap().state(), DoseState::Missed);
    assert_eq!(h.tracker.dose(&first).await.unwrap().state(), DoseState::Taken);

    // A second sweep finds nothing left to miss.
    assert_eq!(h.tracker.sweep_missed().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn take_outside_window_leaves_dose_pending() {
    let h = harness().await;
    let key = DoseKey::new(h.med_id, day(9), 0);

    h.clock.set(at(9, 9, 1));
    assert!(h.tracker.mark_taken(key).await.unwrap_err().is_timing_rule());
    assert_eq!(h.tracker.dose(&key).await.unwrap().state(), DoseState::Pending);

    h.clock.set(at(9, 6, 59));
    assert!(h.tracker.mark_taken(key).await.is_err());
    assert!(h.tracker.history_log().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn undo_inside_window_clears_taken_at() {
    let h = harness().await;
    let key = DoseKey::new(h.med_id, day(9), 0);

    h.clock.set(at(9, 7, 55));
    h.tracker.mark_taken(key).await.unwrap();
    h.clock.set(at(9, 8, 30));
    let entry = h.tracker.undo_taken(key).await.unwrap();
    assert_eq!(entry.status, DoseState::Pending);

    let dose = h.tracker.dose(&key).await.unwrap();
    assert_eq!(dose.state(), DoseState::Pending);
    assert_eq!(dose.taken_at(), None);
    assert_eq!(h.tracker.streak().await, 0);
}

#[tokio::test(start_paused = true)]
async fn taking_twice_is_an_invalid_transition() {
    let h = harness().await;
    let key = DoseKey::new(h.med_id, day(9), 0);
    h.clock.set(at(9, 8, 0));
    h.tracker.mark_taken(key).await.unwrap();
    assert!(matches!(
        h.tracker.mark_taken(key).await,
        Err(CoreError::Dose(DoseError::InvalidTransition { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_dose_index_is_invalid_reference() {
    let h = harness().await;
    h.clock.set(at(9, 8, 0));
    assert!(matches!(
        h.tracker.mark_taken(DoseKey::new(h.med_id, day(9), 2)).await,
        Err(CoreError::Dose(DoseError::InvalidReference(_)))
    ));
    assert!(matches!(
        h.tracker.mark_taken(DoseKey::new(9_999, day(9), 0)).await,
        Err(CoreError::Dose(DoseError::InvalidReference(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn dose_before_start_date_does_not_exist() {
    let h = harness().await;
    let key = DoseKey::new(h.med_id, day(8), 0);
    h.clock.set(at(8, 8, 0));
    assert!(h.tracker.dose(&key).await.is_none());
    assert!(matches!(
        h.tracker.mark_taken(key).await,
        Err(CoreError::Dose(DoseError::InvalidReference(_)))
    ));
    assert_eq!(h.tracker.sweep_missed().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn two_day_adherence_and_streak() {
    let h = harness().await;
    let key = |d: u32, i: usize| DoseKey::new(h.med_id, day(d), i);

    h.clock.set(at(9, 8, 5));
    h.tracker.mark_taken(key(9, 0)).await.unwrap();
    h.clock.set(at(9, 22, 30));
    h.tracker.sweep_missed().await.unwrap();

    h.clock.set(at(10, 8, 10));
    h.tracker.mark_taken(key(10, 0)).await.unwrap();
    h.clock.set(at(10, 20, 10));
    h.tracker.mark_taken(key(10, 1)).await.unwrap();

    let report = h.tracker.adherence(day(9), day(10)).await;
    assert_eq!(report.total_doses, 4);
    assert_eq!(report.taken_doses, 3);
    assert_eq!(report.missed_doses, 1);
    assert!((report.percentage - 75.0).abs() < f64::EPSILON);
    assert_eq!(report.days[0].flagged_missed, 1);
    assert_eq!(report.perfect_days(), 1);

    assert_eq!(h.tracker.streak().await, 2);

    // Undo the evening dose: day 10 still has its morning dose.
    h.clock.set(at(10, 20, 20));
    h.tracker.undo_taken(key(10, 1)).await.unwrap();
    assert_eq!(h.tracker.streak().await, 2);

    let rows = h.tracker.history_rows().await;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].date, day(9));
    assert_eq!(rows[1].status, DoseState::Missed);
}

#[tokio::test(start_paused = true)]
async fn empty_range_has_zero_percentage() {
    let h = harness().await;
    let report = h.tracker.adherence(day(1), day(3)).await;
    assert_eq!(report.total_doses, 0);
    assert_eq!(report.percentage, 0.0);
    assert!(report.days.iter().all(|d| d.percentage == 0.0));
}

#[tokio::test(start_paused = true)]
async fn sweep_reaches_back_to_unvisited_today() {
    let h = harness().await;
    // Nothing has been materialized for day 9; the sweep still sees it.
    h.clock.set(at(9, 23, 0) + Duration::minutes(30));
    assert_eq!(h.tracker.sweep_missed().await.unwrap(), 2);
}

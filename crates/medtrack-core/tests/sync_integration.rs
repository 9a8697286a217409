//! Integration tests for the two-phase store protocol.
//!
//! Confirmed transitions must reach the Mirror Store, failed ones must leave no
//! trace anywhere, and mirror trouble must never reach the caller.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use medtrack_core::sync::MirrorPath;
use medtrack_core::{
    CoreError, DoseKey, DoseState, Event, Frequency, ManualClock, Medication, MedicationDraft,
    MedicationTracker, MemoryAuthoritativeStore, MemoryMirror, StoreError, TrackerConfig,
};
use mockito::Matcher;
use serde_json::json;

fn day(n: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, n).unwrap()
}

fn at(n: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, n, h, m, 0).unwrap()
}

fn draft() -> MedicationDraft {
    MedicationDraft {
        name: "Amlodipine".into(),
        dosage: "5mg".into(),
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
    authority: Arc<MemoryAuthoritativeStore>,
    mirror: Arc<MemoryMirror>,
    clock: Arc<ManualClock>,
    med_id: i64,
}

impl Harness {
    fn key(&self, index: usize) -> DoseKey {
        DoseKey::new(self.med_id, day(9), index)
    }

    fn snapshot_path(&self) -> MirrorPath {
        MirrorPath::medication("u1", self.med_id)
    }
}

async fn harness() -> Harness {
    let authority = Arc::new(MemoryAuthoritativeStore::new());
    let mirror = Arc::new(MemoryMirror::new());
    let med = authority.insert_medication(Medication::from_draft(0, &draft()));
    let clock = Arc::new(ManualClock::new(at(9, 8, 5)));
    let mut config = TrackerConfig::default();
    config.store.user_id = Some("u1".into());
    let tracker =
        MedicationTracker::new(config, authority.clone(), mirror.clone(), clock.clone()).unwrap();
    tracker.refresh().await.unwrap();
    Harness {
        tracker,
        authority,
        mirror,
        clock,
        med_id: med.id,
    }
}

#[tokio::test(start_paused = true)]
async fn confirmed_take_is_mirrored_with_history() {
    let h = harness().await;
    let mut rx = h.tracker.subscribe();
    h.tracker.mark_taken(h.key(0)).await.unwrap();
    h.tracker.synchronizer().settle().await;

    let snapshot = h.mirror.get(&h.snapshot_path()).unwrap();
    assert_eq!(snapshot["doses"]["2025-04-09"][0]["taken"], true);
    assert_eq!(snapshot["doses"]["2025-04-09"][0]["takenAt"], "2025-04-09T08:05:00Z");
    // The refresh snapshot still queued was superseded by the immediate one.
    assert_eq!(h.mirror.put_count(&h.snapshot_path()), 1);

    let history = h.mirror.list(&MirrorPath::history("u1"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["status"], "Taken");
    assert_eq!(history[0]["medicationName"], "Amlodipine");

    assert_eq!(
        rx.recv().await.unwrap(),
        Event::MedicationUpdated {
            medication_id: h.med_id,
            date: day(9),
            dose_index: 0,
            status: DoseState::Taken,
            at: at(9, 8, 5),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn sweep_snapshots_are_coalesced() {
    let h = harness().await;
    h.clock.set(at(9, 23, 30));
    assert_eq!(h.tracker.sweep_missed().await.unwrap(), 2);
    assert_eq!(h.mirror.put_count(&h.snapshot_path()), 0);

    h.tracker.synchronizer().settle().await;
    assert_eq!(h.mirror.put_count(&h.snapshot_path()), 1);
    let snapshot = h.mirror.get(&h.snapshot_path()).unwrap();
    assert_eq!(snapshot["doses"]["2025-04-09"][0]["missed"], true);
    assert_eq!(snapshot["doses"]["2025-04-09"][1]["missed"], true);
    assert_eq!(h.mirror.list(&MirrorPath::history("u1")).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_no_partial_transition() {
    let h = harness().await;
    let calls_before = h.authority.calls();
    h.authority
        .fail_next((0..4).map(|n| StoreError::TransientIo(format!("reset {n}"))));

    let err = h.tracker.mark_taken(h.key(0)).await.unwrap_err();
    assert!(matches!(err, CoreError::Store(StoreError::TransientIo(_))));
    assert!(!err.is_timing_rule());
    assert!(err.user_message().contains("try again"));
    assert_eq!(h.authority.calls() - calls_before, 4);

    assert_eq!(h.tracker.dose(&h.key(0)).await.unwrap().state(), DoseState::Pending);
    assert!(h.tracker.history_log().await.is_empty());
    assert!(h.authority.medication(h.med_id).unwrap().day(day(9)).is_none());
    h.tracker.synchronizer().settle().await;
    assert!(h.mirror.list(&MirrorPath::history("u1")).is_empty());

    // The failed mutation is no longer in flight.
    let mut pushed = h.tracker.medication(h.med_id).await.unwrap();
    pushed.updated_at = pushed.updated_at.map(|t| t + Duration::seconds(1));
    assert!(h.tracker.apply_mirror_push(pushed).await);
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_not_retried() {
    let h = harness().await;
    let calls_before = h.authority.calls();
    h.authority.fail_next([StoreError::Unauthorized]);

    let err = h.tracker.mark_taken(h.key(0)).await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(h.authority.calls() - calls_before, 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_for_retry_after() {
    let h = harness().await;
    let calls_before = h.authority.calls();
    h.authority.fail_next([StoreError::RateLimited {
        retry_after: Some(StdDuration::from_secs(3)),
    }]);

    let started = tokio::time::Instant::now();
    h.tracker.mark_taken(h.key(0)).await.unwrap();
    assert!(started.elapsed() >= StdDuration::from_secs(3));
    assert_eq!(h.authority.calls() - calls_before, 2);
    assert!(h.tracker.dose(&h.key(0)).await.unwrap().taken());
}

#[tokio::test(start_paused = true)]
async fn mirror_failures_do_not_reach_the_caller() {
    let h = harness().await;
    h.mirror
        .fail_next((0..16).map(|_| StoreError::TransientIo("mirror down".into())));

    h.tracker.mark_taken(h.key(0)).await.unwrap();
    h.tracker.synchronizer().settle().await;
    assert!(h.tracker.dose(&h.key(0)).await.unwrap().taken());
    assert!(h.authority.medication(h.med_id).unwrap().day(day(9)).unwrap()[0].taken());
}

#[tokio::test(start_paused = true)]
async fn mirror_push_must_be_newer() {
    let h = harness().await;
    let mut rx = h.tracker.subscribe();
    let local = h.tracker.medication(h.med_id).await.unwrap();

    let mut stale = local.clone();
    stale.notes = Some("stale".into());
    assert!(!h.tracker.apply_mirror_push(stale).await);

    let mut newer = local.clone();
    newer.notes = Some("from another device".into());
    newer.updated_at = local.updated_at.map(|t| t + Duration::seconds(5));
    assert!(h.tracker.apply_mirror_push(newer).await);
    assert_eq!(
        h.tracker.medication(h.med_id).await.unwrap().notes.as_deref(),
        Some("from another device")
    );
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::MirrorApplied { medication_id, .. } if medication_id == h.med_id
    ));
}

#[tokio::test(start_paused = true)]
async fn medication_lifecycle_is_mirrored() {
    let h = harness().await;
    let created = h.tracker.add_medication(draft()).await.unwrap();
    let mut edit = draft();
    edit.notes = Some("with food".into());
    let updated = h.tracker.update_medication(created.id, edit).await.unwrap();
    assert_eq!(updated.notes.as_deref(), Some("with food"));

    h.tracker.synchronizer().flush_mirror().await;
    let path = MirrorPath::medication("u1", created.id);
    assert_eq!(h.mirror.get(&path).unwrap()["notes"], "with food");

    h.tracker.delete_medication(created.id).await.unwrap();
    h.tracker.synchronizer().settle().await;
    assert!(h.mirror.get(&path).is_none());
    assert!(h.tracker.medication(created.id).await.is_none());
}

#[tokio::test]
async fn connect_talks_to_rest_and_mirror() {
    let mut server = mockito::Server::new_async().await;
    let med = json!({
        "id": 4,
        "medication_name": "Amlodipine",
        "dosage": "5mg",
        "frequency": "daily",
        "times_per_day": 1,
        "times": ["08:00:00"],
        "start_date": "2025-04-01",
        "updated_at": "2025-04-08T10:00:00Z"
    });
    let mut confirmed = med.clone();
    confirmed["doses"] = json!({
        "2025-04-09": [{ "time": "08:00:00", "taken": true, "missed": false, "takenAt": "2025-04-09T08:05:00Z" }]
    });
    confirmed["updated_at"] = json!("2025-04-09T08:05:01Z");

    let _meds = server
        .mock("GET", "/api/medications/get-medications")
        .match_header("authorization", "Bearer tok")
        .with_status(200)
        .with_body(json!([med]).to_string())
        .create_async()
        .await;
    let _reminders = server
        .mock("GET", "/api/reminders/get-reminders")
        .with_status(200)
        .with_body(json!({ "reminders": [] }).to_string())
        .create_async()
        .await;
    let taken = server
        .mock("PUT", "/api/medications/4/taken")
        .match_body(Matcher::PartialJson(json!({ "date": "2025-04-09", "doseIndex": 0, "taken": true })))
        .with_status(200)
        .with_body(confirmed.to_string())
        .create_async()
        .await;
    let snapshot = server
        .mock("PUT", "/mirror/medications/u1/4.json")
        .match_query(Matcher::UrlEncoded("auth".into(), "tok".into()))
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;
    let history = server
        .mock("POST", "/mirror/medication_history/u1.json")
        .match_query(Matcher::Any)
        .with_status(200)
        .create_async()
        .await;

    let mut config = TrackerConfig::default();
    config.store.api_base_url = format!("{}/api", server.url());
    config.store.mirror_base_url = Some(format!("{}/mirror", server.url()));
    config.store.user_id = Some("u1".into());
    config.sync.coalesce_window_ms = 50;
    let clock = Arc::new(ManualClock::new(at(9, 8, 5)));
    let tracker = MedicationTracker::connect(config, "tok", clock).unwrap();

    tracker.refresh().await.unwrap();
    tracker.mark_taken(DoseKey::new(4, day(9), 0)).await.unwrap();
    tracker.synchronizer().settle().await;

    taken.assert_async().await;
    snapshot.assert_async().await;
    history.assert_async().await;
    assert_eq!(tracker.streak().await, 1);
}

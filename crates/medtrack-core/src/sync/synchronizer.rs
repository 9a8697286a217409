//! Two-phase store synchronization.
//!
//! Phase 1 sends a mutation to the Authoritative Store under the retry policy
//! and returns its confirmed result (or error) to the caller. Phase 2
//! replicates that confirmed result to the Mirror Store in background tasks;
//! mirror failures are logged and never reach the caller.
//!
//! Medication snapshots go through the [`MirrorQueue`] and are coalesced per
//! path. History entries, reminder snapshots and deletions are sent at once.
//!
//! Writes to one path are applied one at a time, in the order they were
//! issued. A snapshot or deletion that has been superseded by a later write to
//! the same path is dropped, including between retries, so the mirror never
//! goes back to an older value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::queue::{MirrorQueue, MirrorWrite};
use super::retry::RetryPolicy;
use super::store::{AuthoritativeStore, MirrorStore};
use super::types::{DoseStatusUpdate, MirrorPath, ReminderStatusUpdate};
use crate::dose::HistoryEntry;
use crate::error::StoreError;
use crate::model::{Medication, MedicationDraft, MedicationId, Reminder, ReminderDraft, ReminderId};

struct QueueState {
    queue: MirrorQueue,
    flusher_running: bool,
}

pub struct Synchronizer {
    authority: Arc<dyn AuthoritativeStore>,
    mirror: Arc<dyn MirrorStore>,
    retry: RetryPolicy,
    user: String,
    queue: Arc<Mutex<QueueState>>,
    lanes: Arc<Lanes>,
    tasks: StdMutex<JoinSet<()>>,
}

/// Ordering state for one mirror path. Writes are numbered from 1 as they
/// are issued and run strictly in that order.
#[derive(Debug, Default)]
struct Lane {
    issued: AtomicU64,
    finished: AtomicU64,
    turn: Notify,
}

/// A write's place in its path's lane.
struct Ticket {
    lane: Arc<Lane>,
    seq: u64,
}

impl Ticket {
    fn superseded(&self) -> bool {
        self.lane.issued.load(Ordering::SeqCst) > self.seq
    }

    /// Wait until every earlier write to the path has finished.
    async fn wait_turn(&self) -> Turn<'_> {
        loop {
            let notified = self.lane.turn.notified();
            if self.lane.finished.load(Ordering::SeqCst) + 1 == self.seq {
                return Turn(self);
            }
            notified.await;
        }
    }
}

/// Hands the lane to the next write when dropped, even if the write was
/// cancelled.
struct Turn<'a>(&'a Ticket);

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.0.lane.finished.store(self.0.seq, Ordering::SeqCst);
        self.0.lane.turn.notify_waiters();
    }
}

#[derive(Debug, Default)]
struct Lanes(StdMutex<HashMap<MirrorPath, Arc<Lane>>>);

impl Lanes {
    /// Number the next write to `path`. Idle lanes are dropped on the way.
    fn issue(&self, path: &MirrorPath) -> Ticket {
        let mut lanes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        let lane = Arc::clone(lanes.entry(path.clone()).or_default());
        let seq = lane.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket { lane, seq }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Synchronizer {
    pub fn new(
        authority: Arc<dyn AuthoritativeStore>,
        mirror: Arc<dyn MirrorStore>,
        retry: RetryPolicy,
        coalesce_window: std::time::Duration,
        user: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            mirror,
            retry,
            user: user.into(),
            queue: Arc::new(Mutex::new(QueueState {
                queue: MirrorQueue::new(coalesce_window),
                flusher_running: false,
            })),
            lanes: Arc::new(Lanes::default()),
            tasks: StdMutex::new(JoinSet::new()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ── Phase 1: Authoritative Store ────────────────────────────────

    pub async fn fetch_medications(&self) -> Result<Vec<Medication>, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("fetch_medications", || authority.fetch_medications())
            .await
    }

    pub async fn fetch_reminders(&self) -> Result<Vec<Reminder>, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("fetch_reminders", || authority.fetch_reminders())
            .await
    }

    pub async fn create_medication(&self, draft: &MedicationDraft) -> Result<Medication, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("create_medication", || authority.create_medication(draft))
            .await
    }

    pub async fn update_medication(
        &self,
        id: MedicationId,
        draft: &MedicationDraft,
    ) -> Result<Medication, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("update_medication", || authority.update_medication(id, draft))
            .await
    }

    pub async fn delete_medication(&self, id: MedicationId) -> Result<(), StoreError> {
        let authority = &self.authority;
        self.retry
            .run("delete_medication", || authority.delete_medication(id))
            .await
    }

    pub async fn set_dose_status(&self, update: &DoseStatusUpdate) -> Result<Medication, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("set_dose_status", || authority.set_dose_status(update))
            .await
    }

    pub async fn create_reminder(&self, draft: &ReminderDraft) -> Result<Reminder, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("create_reminder", || authority.create_reminder(draft))
            .await
    }

    pub async fn update_reminder_status(
        &self,
        update: &ReminderStatusUpdate,
    ) -> Result<Reminder, StoreError> {
        let authority = &self.authority;
        self.retry
            .run("update_reminder_status", || authority.update_reminder_status(update))
            .await
    }

    pub async fn delete_reminder(&self, id: ReminderId) -> Result<(), StoreError> {
        let authority = &self.authority;
        self.retry
            .run("delete_reminder", || authority.delete_reminder(id))
            .await
    }

    // ── Phase 2: Mirror Store ───────────────────────────────────────

    /// Queue a confirmed medication snapshot for coalesced replication.
    pub async fn replicate_medication(&self, medication: &Medication) {
        let payload = match serde_json::to_value(medication) {
            Ok(v) => v,
            Err(e) => {
                warn!(medication_id = medication.id, error = %e, "cannot encode mirror snapshot");
                return;
            }
        };
        let path = MirrorPath::medication(&self.user, medication.id);
        let start_flusher = {
            let mut state = self.queue.lock().await;
            state.queue.enqueue(path, payload, Instant::now());
            let start = !state.flusher_running;
            state.flusher_running = true;
            start
        };
        if start_flusher {
            self.spawn_flusher();
        }
    }

    /// Replicate a confirmed medication snapshot immediately, superseding any
    /// queued snapshot for the same path.
    pub async fn replicate_medication_now(&self, medication: &Medication) {
        let payload = match serde_json::to_value(medication) {
            Ok(v) => v,
            Err(e) => {
                warn!(medication_id = medication.id, error = %e, "cannot encode mirror snapshot");
                return;
            }
        };
        let path = MirrorPath::medication(&self.user, medication.id);
        let superseded = self.queue.lock().await.queue.cancel(&path);
        self.spawn_write(MirrorWrite {
            path,
            payload,
            coalesced: 1 + u32::from(superseded),
        }, WriteKind::Put);
    }

    /// Replicate a confirmed reminder immediately.
    pub async fn replicate_reminder(&self, reminder: &Reminder) {
        match serde_json::to_value(reminder) {
            Ok(payload) => {
                let path = MirrorPath::reminder(&self.user, reminder.id);
                self.spawn_write(MirrorWrite {
                    path,
                    payload,
                    coalesced: 1,
                }, WriteKind::Put);
            }
            Err(e) => warn!(reminder_id = reminder.id, error = %e, "cannot encode mirror reminder"),
        }
    }

    /// Append a history entry immediately.
    pub async fn replicate_history(&self, entry: &HistoryEntry) {
        match serde_json::to_value(entry) {
            Ok(payload) => {
                let path = MirrorPath::history(&self.user);
                self.spawn_write(MirrorWrite {
                    path,
                    payload,
                    coalesced: 1,
                }, WriteKind::Append);
            }
            Err(e) => warn!(error = %e, "cannot encode mirror history entry"),
        }
    }

    /// Drop any queued snapshot and remove the medication from the mirror.
    pub async fn remove_medication(&self, id: MedicationId) {
        let path = MirrorPath::medication(&self.user, id);
        self.queue.lock().await.queue.cancel(&path);
        self.spawn_write(MirrorWrite {
            path,
            payload: serde_json::Value::Null,
            coalesced: 1,
        }, WriteKind::Remove);
    }

    pub async fn remove_reminder(&self, id: ReminderId) {
        let path = MirrorPath::reminder(&self.user, id);
        self.spawn_write(MirrorWrite {
            path,
            payload: serde_json::Value::Null,
            coalesced: 1,
        }, WriteKind::Remove);
    }

    /// Send every queued snapshot now, regardless of its window.
    pub async fn flush_mirror(&self) {
        let writes: Vec<_> = {
            let mut state = self.queue.lock().await;
            state
                .queue
                .flush()
                .into_iter()
                .map(|write| (self.lanes.issue(&write.path), write))
                .collect()
        };
        for (ticket, write) in writes {
            mirror_write(self.mirror.as_ref(), &self.retry, ticket, write, WriteKind::Put).await;
        }
    }

    /// Number of snapshots waiting in the coalescing queue.
    pub async fn pending_mirror_writes(&self) -> usize {
        self.queue.lock().await.queue.len()
    }

    /// Wait for every background mirror task spawned so far, including
    /// tasks spawned while waiting.
    pub async fn settle(&self) {
        loop {
            let mut batch = Detaching(std::mem::take(&mut *self.lock_tasks()));
            if batch.0.is_empty() {
                break;
            }
            while let Some(done) = batch.0.join_next().await {
                report_task(done);
            }
        }
    }

    /// Background mirror tasks not yet reaped.
    pub fn background_tasks(&self) -> usize {
        self.lock_tasks().len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.lock_tasks();
        while let Some(done) = tasks.try_join_next() {
            report_task(done);
        }
        tasks.spawn(task);
    }

    fn spawn_write(&self, write: MirrorWrite, kind: WriteKind) {
        let mirror = Arc::clone(&self.mirror);
        let retry = self.retry;
        let ticket = self.lanes.issue(&write.path);
        self.spawn(async move {
            mirror_write(mirror.as_ref(), &retry, ticket, write, kind).await;
        });
    }

    fn spawn_flusher(&self) {
        let mirror = Arc::clone(&self.mirror);
        let retry = self.retry;
        let queue = Arc::clone(&self.queue);
        let lanes = Arc::clone(&self.lanes);
        self.spawn(async move {
            loop {
                let next = queue.lock().await.queue.next_ready_at();
                let Some(ready_at) = next else {
                    let mut state = queue.lock().await;
                    if state.queue.is_empty() {
                        state.flusher_running = false;
                        return;
                    }
                    continue;
                };
                tokio::time::sleep_until(ready_at).await;
                let writes: Vec<_> = {
                    let mut state = queue.lock().await;
                    state
                        .queue
                        .drain_ready(Instant::now())
                        .into_iter()
                        .map(|write| (lanes.issue(&write.path), write))
                        .collect()
                };
                for (ticket, write) in writes {
                    mirror_write(mirror.as_ref(), &retry, ticket, write, WriteKind::Put).await;
                }
            }
        });
    }
}

/// Tasks taken out for [`Synchronizer::settle`]. If the wait is dropped early
/// the remaining writes keep running.
struct Detaching(JoinSet<()>);

impl Drop for Detaching {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}

fn report_task(done: Result<(), JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            warn!(error = %e, "mirror task panicked");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Put,
    Append,
    Remove,
}

impl WriteKind {
    fn operation(self) -> &'static str {
        match self {
            WriteKind::Put => "mirror_put",
            WriteKind::Append => "mirror_append",
            WriteKind::Remove => "mirror_remove",
        }
    }
}

async fn mirror_write(
    mirror: &dyn MirrorStore,
    retry: &RetryPolicy,
    ticket: Ticket,
    write: MirrorWrite,
    kind: WriteKind,
) {
    let _turn = ticket.wait_turn().await;
    // Appends are independent records and never replace each other.
    let replaceable = !matches!(kind, WriteKind::Append);
    let ticket = &ticket;
    let path = &write.path;
    let payload = &write.payload;
    let result = retry
        .run(kind.operation(), || async move {
            if replaceable && ticket.superseded() {
                return Ok(false);
            }
            match kind {
                WriteKind::Put => mirror.put(path, payload).await,
                WriteKind::Append => mirror.append(path, payload).await,
                WriteKind::Remove => mirror.remove(path).await,
            }
            .map(|()| true)
        })
        .await;
    match result {
        Ok(true) => debug!(path = %path, coalesced = write.coalesced, ?kind, "mirror write sent"),
        Ok(false) => debug!(path = %path, seq = ticket.seq, ?kind, "mirror write superseded"),
        Err(e) => warn!(path = %path, ?kind, error = %e, "mirror replication failed"),
    }
}

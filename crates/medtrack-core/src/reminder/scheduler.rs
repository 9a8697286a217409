//! Periodic task scheduling.
//!
//! `schedule(period, task)` runs `task` every `period` until the returned
//! [`CancelHandle`] is cancelled. [`TokioScheduler`] drives tasks from a tokio
//! interval; [`ManualScheduler`] only runs them when told to, for tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A repeatable unit of work.
pub type Task = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub trait Scheduler: Send + Sync {
    fn schedule(&self, period: Duration, task: Task) -> CancelHandle;
}

/// Stops a scheduled task. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl CancelHandle {
    fn new(abort: Option<AbortHandle>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs tasks on the current tokio runtime. The first run happens immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, period: Duration, task: Task) -> CancelHandle {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, periodic task not started");
            let cancel = CancelHandle::new(None);
            cancel.cancel();
            return cancel;
        };
        let join = handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                task().await;
            }
        });
        CancelHandle::new(Some(join.abort_handle()))
    }
}

struct ManualEntry {
    period: Duration,
    task: Task,
    handle: CancelHandle,
}

/// Holds scheduled tasks and runs them on [`run_pending`](Self::run_pending).
#[derive(Default)]
pub struct ManualScheduler {
    entries: Mutex<Vec<ManualEntry>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every non-cancelled task once, in scheduling order.
    pub async fn run_pending(&self) -> usize {
        let tasks: Vec<Task> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .map(|e| Arc::clone(&e.task))
            .collect();
        for task in &tasks {
            task().await;
        }
        tasks.len()
    }

    /// Periods of the tasks still scheduled.
    pub fn periods(&self) -> Vec<Duration> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.handle.is_cancelled())
            .map(|e| e.period)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, period: Duration, task: Task) -> CancelHandle {
        let handle = CancelHandle::new(None);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ManualEntry {
                period,
                task,
                handle: handle.clone(),
            });
        handle
    }
}

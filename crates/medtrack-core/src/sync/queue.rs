//! Coalescing queue for mirror snapshot writes.
//!
//! Snapshots are keyed by mirror path. Enqueuing a path that is already
//! pending replaces its payload but keeps the original ready time, so a record
//! that changes continuously is still written at most once per window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::types::MirrorPath;

/// A write ready to be sent to the Mirror Store.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorWrite {
    pub path: MirrorPath,
    pub payload: serde_json::Value,
    /// How many enqueues collapsed into this write.
    pub coalesced: u32,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    payload: serde_json::Value,
    ready_at: Instant,
    coalesced: u32,
}

#[derive(Debug)]
pub struct MirrorQueue {
    pending: HashMap<MirrorPath, PendingWrite>,
    window: Duration,
}

impl MirrorQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Queue a snapshot for `path`. Returns `true` if it replaced a pending one.
    pub fn enqueue(&mut self, path: MirrorPath, payload: serde_json::Value, now: Instant) -> bool {
        match self.pending.get_mut(&path) {
            Some(pending) => {
                pending.payload = payload;
                pending.coalesced += 1;
                debug!(path = %path, coalesced = pending.coalesced, "mirror write coalesced");
                true
            }
            None => {
                self.pending.insert(
                    path,
                    PendingWrite {
                        payload,
                        ready_at: now + self.window,
                        coalesced: 1,
                    },
                );
                false
            }
        }
    }

    /// Drop a pending write, e.g. because the record was deleted.
    pub fn cancel(&mut self, path: &MirrorPath) -> bool {
        self.pending.remove(path).is_some()
    }

    /// Remove and return every write whose window has elapsed, ordered by path.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<MirrorWrite> {
        let mut ready = Vec::new();
        self.pending.retain(|path, pending| {
            if pending.ready_at <= now {
                ready.push(MirrorWrite {
                    path: path.clone(),
                    payload: pending.payload.clone(),
                    coalesced: pending.coalesced,
                });
                false
            } else {
                true
            }
        });
        ready.sort_by(|a, b| a.path.cmp(&b.path));
        ready
    }

    /// Remove and return every pending write regardless of its window.
    pub fn flush(&mut self) -> Vec<MirrorWrite> {
        let mut all: Vec<MirrorWrite> = self
            .pending
            .drain()
            .map(|(path, pending)| MirrorWrite {
                path,
                payload: pending.payload,
                coalesced: pending.coalesced,
            })
            .collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Earliest instant at which a pending write becomes ready.
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.ready_at).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

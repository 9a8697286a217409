//! # Medtrack Core Library
//!
//! This library provides the core logic for tracking scheduled medication doses:
//! which doses were taken or missed, when to remind the user, how adherent they
//! have been, and how every confirmed change reaches the two backing stores.
//!
//! ## Architecture
//!
//! - **Dose State Machine**: pure transition checks under a confirmation window
//!   and a longer auto-miss window; the caller supplies `now`
//! - **Reminder Engine**: a periodic tick that fires each reminder occurrence at
//!   most once inside a ±30s trigger window
//! - **Adherence & Streak**: derived statistics computed on demand
//! - **Dual-Store Synchronizer**: write-through to the Authoritative Store, then
//!   best-effort (and for dose maps, coalesced) replication to the Mirror Store
//!
//! ## Key Components
//!
//! - [`MedicationTracker`]: the service tying everything together
//! - [`DoseLedger`]: in-memory medication collection, mutated only by confirmed transitions
//! - [`ReminderEngine`]: reminder evaluation with idempotent prompting
//! - [`Synchronizer`]: two-phase store protocol with retry and coalescing
//! - [`TrackerConfig`]: TOML configuration

pub mod clock;
pub mod config;
pub mod dose;
pub mod error;
pub mod events;
pub mod model;
pub mod reminder;
pub mod stats;
pub mod sync;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use dose::{DoseLedger, DoseWindows, HistoryEntry, HistoryRow, Transition};
pub use error::{ConfigError, CoreError, DoseError, StoreError, ValidationError};
pub use events::{Event, EventBus};
pub use model::{
    materialize_day, DoseKey, DoseRecord, DoseState, Frequency, Medication, MedicationDraft,
    MedicationId, Reminder, ReminderDraft, ReminderId, ReminderKind, ReminderStatus,
};
pub use reminder::{ManualScheduler, ReminderEngine, ReminderPrompt, Scheduler, TokioScheduler};
pub use stats::{compute_adherence, compute_streak, AdherenceDay, AdherenceReport};
pub use sync::{
    AuthoritativeStore, MemoryAuthoritativeStore, MemoryMirror, MirrorStore, RetryPolicy,
    Synchronizer,
};
pub use tracker::MedicationTracker;

//! Reminder evaluation and periodic task scheduling.

pub mod engine;
pub mod scheduler;

pub use engine::{PromptKey, PromptSource, ReminderEngine, ReminderPrompt, ReminderSettings, TickOutcome};
pub use scheduler::{CancelHandle, ManualScheduler, Scheduler, Task, TaskFuture, TokioScheduler};

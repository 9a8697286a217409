//! Dose state machine.
//!
//! - [`window`]: the confirmation and miss windows, scheduled-time resolution
//! - [`machine`]: pure transition checks (`Pending -> Taken`, `Taken -> Pending`,
//!   `Pending -> Missed`)
//! - [`ledger`]: the in-memory medication collection; the only place a
//!   confirmed transition lands
//! - [`history`]: take/miss history entries and flattened history rows

pub mod history;
pub mod ledger;
pub mod machine;
pub mod window;

pub use history::{HistoryEntry, HistoryRow};
pub use ledger::DoseLedger;
pub use machine::{auto_miss, mark_taken, undo_taken, Transition};
pub use window::{scheduled_at, DoseWindows};

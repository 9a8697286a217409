//! Derived statistics over dose records.

pub mod adherence;
pub mod streak;

pub use adherence::{compute_adherence, AdherenceDay, AdherenceReport, DatedDose};
pub use streak::compute_streak;

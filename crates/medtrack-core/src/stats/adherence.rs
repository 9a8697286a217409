//! Daily adherence aggregation
//!
//! For each calendar day in a range this counts scheduled doses and taken
//! doses. `missed_doses` is the complement `total - taken`: a dose that has not
//! been confirmed yet counts as missed for reporting. Doses explicitly flagged
//! missed by the sweep are counted separately in `flagged_missed`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::MedicationId;

/// One scheduled dose on one date, reduced to what adherence needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatedDose {
    pub medication_id: MedicationId,
    pub date: NaiveDate,
    pub taken: bool,
    pub missed: bool,
}

/// Adherence for a single day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdherenceDay {
    pub date: NaiveDate,
    /// Doses scheduled that day across all active medications
    pub total_doses: u32,
    /// Doses with `taken = true`
    pub taken_doses: u32,
    /// `total_doses - taken_doses`
    pub missed_doses: u32,
    /// Doses with `missed = true`
    pub flagged_missed: u32,
    /// `taken / total * 100`, or 0 when nothing was scheduled
    pub percentage: f64,
}

fn percentage(taken: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(taken) / f64::from(total) * 100.0
    }
}

/// Per-day adherence for every date in `[start, end]` (empty if inverted).
pub fn compute_adherence(doses: &[DatedDose], start: NaiveDate, end: NaiveDate) -> Vec<AdherenceDay> {
    start
        .iter_days()
        .take_while(|date| *date <= end)
        .map(|date| {
            let (mut total, mut taken, mut flagged) = (0u32, 0u32, 0u32);
            for dose in doses.iter().filter(|d| d.date == date) {
                total += 1;
                if dose.taken {
                    taken += 1;
                }
                if dose.missed {
                    flagged += 1;
                }
            }
            AdherenceDay {
                date,
                total_doses: total,
                taken_doses: taken,
                missed_doses: total - taken,
                flagged_missed: flagged,
                percentage: percentage(taken, total),
            }
        })
        .collect()
}

/// Totals over a range of days
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdherenceReport {
    pub days: Vec<AdherenceDay>,
    pub total_doses: u32,
    pub taken_doses: u32,
    pub missed_doses: u32,
    pub percentage: f64,
}

impl AdherenceReport {
    pub fn from_days(days: Vec<AdherenceDay>) -> Self {
        let total: u32 = days.iter().map(|d| d.total_doses).sum();
        let taken: u32 = days.iter().map(|d| d.taken_doses).sum();
        Self {
            days,
            total_doses: total,
            taken_doses: taken,
            missed_doses: total - taken,
            percentage: percentage(taken, total),
        }
    }

    /// Days on which every scheduled dose was taken.
    pub fn perfect_days(&self) -> usize {
        self.days
            .iter()
            .filter(|d| d.total_doses > 0 && d.taken_doses == d.total_doses)
            .count()
    }
}

//! Power aggregation over completed replications
//!
//! Results are grouped by design cell (participants, trials, effect size)
//! regardless of arrival order. Failed replications are counted but never
//! enter a power estimate; a cell with no successful replication is listed
//! separately instead of being given a power of zero.

use crate::config::validate_threshold;
use crate::error::InputError;
use crate::task::{DesignPoint, TaskResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Design cell a replication belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CellKey {
    pub participants: usize,
    pub trials: usize,
    pub effect_size: f64,
}

impl From<&DesignPoint> for CellKey {
    fn from(point: &DesignPoint) -> Self {
        Self {
            participants: point.participants,
            trials: point.trials,
            // adding +0.0 folds -0.0 into 0.0
            effect_size: point.effect_size + 0.0,
        }
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.participants
            .cmp(&other.participants)
            .then(self.trials.cmp(&other.trials))
            .then(self.effect_size.total_cmp(&other.effect_size))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CellKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CellKey {}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "participants={} trials={} effect={}",
            self.participants, self.trials, self.effect_size
        )
    }
}

/// Detection rate of one decision rule within a cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionPower {
    pub detections: usize,
    pub power: f64,
    /// Binomial standard error sqrt(p(1-p)/n)
    pub std_error: f64,
}

impl DecisionPower {
    fn from_counts(detections: usize, n: usize) -> Self {
        let p = detections as f64 / n as f64;
        Self {
            detections,
            power: p,
            std_error: (p * (1.0 - p) / n as f64).sqrt(),
        }
    }
}

/// Power estimates for one design cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCell {
    pub key: CellKey,
    pub n_attempted: usize,
    pub n_succeeded: usize,
    pub n_failed: usize,
    pub two_sided: DecisionPower,
    pub one_sided: DecisionPower,
}

/// A cell where every replication failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyCell {
    pub key: CellKey,
    pub n_attempted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerTable {
    pub threshold: f64,
    /// Cells with at least one successful replication, sorted by key
    pub cells: Vec<AggregatedCell>,
    pub empty_cells: Vec<EmptyCell>,
    pub total_attempted: usize,
    pub total_failed: usize,
}

impl PowerTable {
    pub fn cell(&self, key: &CellKey) -> Option<&AggregatedCell> {
        self.cells.iter().find(|c| &c.key == key)
    }
}

#[derive(Default)]
struct Tally {
    attempted: usize,
    succeeded: usize,
    two_sided: usize,
    one_sided: usize,
}

/// Aggregate task results into per-cell power at `threshold`.
///
/// A replication detects the effect when its ratio is at least `threshold`.
pub fn aggregate<'a, I>(results: I, threshold: f64) -> Result<PowerTable, InputError>
where
    I: IntoIterator<Item = &'a (DesignPoint, TaskResult)>,
{
    validate_threshold(threshold)?;

    let mut tallies: BTreeMap<CellKey, Tally> = BTreeMap::new();
    for (point, result) in results {
        let tally = tallies.entry(CellKey::from(point)).or_default();
        tally.attempted += 1;
        if let Ok(ratios) = result {
            tally.succeeded += 1;
            if ratios.two_sided >= threshold {
                tally.two_sided += 1;
            }
            if ratios.one_sided >= threshold {
                tally.one_sided += 1;
            }
        }
    }

    let mut table = PowerTable {
        threshold,
        cells: Vec::new(),
        empty_cells: Vec::new(),
        total_attempted: 0,
        total_failed: 0,
    };

    for (key, tally) in tallies {
        table.total_attempted += tally.attempted;
        table.total_failed += tally.attempted - tally.succeeded;

        if tally.succeeded == 0 {
            warn!(%key, attempted = tally.attempted, "no successful replications; cell excluded from power table");
            table.empty_cells.push(EmptyCell {
                key,
                n_attempted: tally.attempted,
            });
            continue;
        }

        table.cells.push(AggregatedCell {
            key,
            n_attempted: tally.attempted,
            n_succeeded: tally.succeeded,
            n_failed: tally.attempted - tally.succeeded,
            two_sided: DecisionPower::from_counts(tally.two_sided, tally.succeeded),
            one_sided: DecisionPower::from_counts(tally.one_sided, tally.succeeded),
        });
    }

    Ok(table)
}

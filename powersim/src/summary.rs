//! Binomial summary of raw trials: one row per participant × context × task,
//! the sufficient statistic consumed by the model fit.

use crate::contrast::{Cell, Level};
use crate::datagen::SimulatedTrialRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Successes out of trials for one participant in one cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinomialCell {
    /// 1-based participant index, as the sampler expects
    pub participant: usize,
    pub participant_id: String,
    pub context: Level,
    pub task: Level,
    pub context_code: f64,
    pub task_code: f64,
    pub successes: usize,
    pub trials: usize,
}

impl BinomialCell {
    pub fn cell(&self) -> Cell {
        Cell {
            context: self.context,
            task: self.task,
        }
    }

    pub fn rate(&self) -> f64 {
        self.successes as f64 / self.trials as f64
    }
}

/// Aggregated dataset handed to the model fit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinomialTable {
    pub rows: Vec<BinomialCell>,
    pub n_participants: usize,
}

impl BinomialTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pooled success rate per cell, in `Cell::ALL` order
    pub fn cell_rates(&self) -> [f64; 4] {
        let mut successes = [0usize; 4];
        let mut trials = [0usize; 4];
        for row in &self.rows {
            let i = row.cell().index();
            successes[i] += row.successes;
            trials[i] += row.trials;
        }
        let mut rates = [f64::NAN; 4];
        for i in 0..4 {
            if trials[i] > 0 {
                rates[i] = successes[i] as f64 / trials[i] as f64;
            }
        }
        rates
    }

    /// Sample interaction contrast aligned with the interaction code
    pub fn interaction_contrast(&self) -> f64 {
        interaction_contrast(&self.cell_rates())
    }

    /// Stan data block for the hierarchical binomial-logit model
    pub fn to_stan_json(&self) -> serde_json::Value {
        serde_json::json!({
            "N": self.rows.len(),
            "J": self.n_participants,
            "participant": self.rows.iter().map(|r| r.participant).collect::<Vec<_>>(),
            "context": self.rows.iter().map(|r| r.context_code).collect::<Vec<_>>(),
            "task": self.rows.iter().map(|r| r.task_code).collect::<Vec<_>>(),
            "successes": self.rows.iter().map(|r| r.successes).collect::<Vec<_>>(),
            "trials": self.rows.iter().map(|r| r.trials).collect::<Vec<_>>(),
        })
    }
}

/// `(AB + BA) - (AA + BB)` over per-cell values in `Cell::ALL` order.
///
/// Cells AB and BA carry interaction code +0.25, AA and BB carry -0.25, so a
/// positive interaction coefficient makes this positive.
pub fn interaction_contrast(values: &[f64; 4]) -> f64 {
    (values[1] + values[2]) - (values[0] + values[3])
}

/// Collapse raw trials into per-participant × cell binomial counts
pub fn summarize(records: &[SimulatedTrialRecord]) -> BinomialTable {
    let mut counts: BTreeMap<(usize, Cell), (String, usize, usize)> = BTreeMap::new();

    for rec in records {
        let entry = counts
            .entry((rec.participant, rec.cell()))
            .or_insert_with(|| (rec.participant_id.clone(), 0, 0));
        entry.1 += usize::from(rec.outcome);
        entry.2 += 1;
    }

    let mut n_participants = 0;
    let rows = counts
        .into_iter()
        .map(|((participant, cell), (participant_id, successes, trials))| {
            n_participants = n_participants.max(participant + 1);
            BinomialCell {
                participant: participant + 1,
                participant_id,
                context: cell.context,
                task: cell.task,
                context_code: cell.context_code(),
                task_code: cell.task_code(),
                successes,
                trials,
            }
        })
        .collect();

    BinomialTable {
        rows,
        n_participants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FixedEffects, RandomEffectSds};
    use crate::covariance::Correlations;
    use crate::datagen::generate;

    fn dataset(n: usize, trials: usize, seed: u64) -> Vec<SimulatedTrialRecord> {
        let fixed = FixedEffects {
            intercept: 0.0,
            context: 0.0,
            task: 0.0,
            interaction: 0.5,
        };
        generate(
            n,
            trials,
            &fixed,
            &RandomEffectSds::default(),
            &Correlations::independent(),
            seed,
        )
        .unwrap()
    }

    #[test]
    fn test_one_row_per_participant_cell() {
        let data = dataset(6, 10, 3);
        let table = summarize(&data);

        assert_eq!(table.n_participants, 6);
        assert_eq!(table.len(), 6 * 4);
        assert!(table.rows.iter().all(|r| r.trials == 10));
        assert_eq!(table.rows[0].participant, 1);
        assert_eq!(table.rows[0].participant_id, "p001");
    }

    #[test]
    fn test_successes_preserved() {
        let data = dataset(5, 20, 11);
        let table = summarize(&data);

        let raw: usize = data.iter().map(|r| r.outcome as usize).sum();
        let summed: usize = table.rows.iter().map(|r| r.successes).sum();
        assert_eq!(raw, summed);
    }

    #[test]
    fn test_codes_follow_contrast_scheme() {
        let table = summarize(&dataset(2, 1, 1));
        for row in &table.rows {
            assert_eq!(row.context_code, if row.context == Level::A { -0.5 } else { 0.5 });
            assert_eq!(row.task_code, if row.task == Level::A { 0.5 } else { -0.5 });
        }
    }

    #[test]
    fn test_interaction_contrast_sign() {
        assert!(interaction_contrast(&[0.4, 0.6, 0.6, 0.4]) > 0.0);
        assert!(interaction_contrast(&[0.6, 0.4, 0.4, 0.6]) < 0.0);
        assert_eq!(interaction_contrast(&[0.5; 4]), 0.0);
    }

    #[test]
    fn test_stan_json_shape() {
        let table = summarize(&dataset(3, 4, 2));
        let json = table.to_stan_json();
        assert_eq!(json["N"], 12);
        assert_eq!(json["J"], 3);
        assert_eq!(json["participant"].as_array().unwrap().len(), 12);
        assert_eq!(json["trials"][0], 4);
    }
}

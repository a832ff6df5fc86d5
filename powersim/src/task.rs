//! One simulation-fit task: simulate a dataset for a design point, summarise
//! it to binomial counts, re-fit the model and extract the evidence ratios.

use crate::config::SimulationParams;
use crate::datagen::generate;
use crate::error::TaskFailure;
use crate::fit::{ComputeBudget, ModelHandle};
use crate::hypothesis::{evaluate, EvidenceRatios};
use crate::summary::summarize;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// One point of the design grid, including its replication index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DesignPoint {
    pub participants: usize,
    pub trials: usize,
    pub effect_size: f64,
    pub replication: usize,
}

impl fmt::Display for DesignPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "participants={} trials={} effect={} rep={}",
            self.participants, self.trials, self.effect_size, self.replication
        )
    }
}

/// Outcome of one task; failures are kept, never coerced to a value
pub type TaskResult = Result<EvidenceRatios, TaskFailure>;

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for a design point, independent of dispatch order
pub fn derive_seed(base_seed: u64, point: &DesignPoint) -> u64 {
    let fields = [
        point.participants as u64,
        point.trials as u64,
        point.effect_size.to_bits(),
        point.replication as u64,
    ];
    fields
        .iter()
        .fold(splitmix64(base_seed), |acc, &field| splitmix64(acc ^ field))
}

/// Run one simulate → summarise → fit → evaluate cycle
pub fn run_task(
    point: &DesignPoint,
    params: &SimulationParams,
    model: &dyn ModelHandle,
    budget: &ComputeBudget,
    base_seed: u64,
) -> TaskResult {
    let seed = derive_seed(base_seed, point);

    let records = generate(
        point.participants,
        point.trials,
        &params.fixed_effects(point.effect_size),
        &params.random_effect_sds,
        &params.correlations,
        seed,
    )?;

    let table = summarize(&records);
    debug!(%point, rows = table.len(), contrast = table.interaction_contrast(), "simulated dataset");

    let posterior = model.fit_or_update(&table, budget, splitmix64(seed))?;
    if let Some(rhat) = posterior.max_rhat() {
        debug!(%point, draws = posterior.n_draws(), max_rhat = rhat, "fit finished");
    }

    evaluate(&posterior)
}

//! Synthetic dataset generator for the context × task binomial design.
//!
//! Each participant sees every context × task cell `n_trials_per_cell` times.
//! Participants deviate from the fixed effects through four correlated
//! random effects; outcomes are Bernoulli draws through the logistic link.

use crate::config::{FixedEffects, RandomEffectSds};
use crate::contrast::{Cell, Level};
use crate::covariance::{lower_mul, scale_factor, Correlations, N_EFFECTS};
use crate::error::InputError;
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One simulated trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTrialRecord {
    pub participant_id: String,
    /// 0-based participant position within the dataset
    pub participant: usize,
    pub context: Level,
    pub task: Level,
    pub context_code: f64,
    pub task_code: f64,
    /// Replication counter within the participant × cell
    pub trial: usize,
    pub linear_predictor: f64,
    pub probability: f64,
    pub outcome: u8,
}

impl SimulatedTrialRecord {
    pub fn cell(&self) -> Cell {
        Cell {
            context: self.context,
            task: self.task,
        }
    }
}

/// Deviations of one participant from the fixed effects
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRandomEffects {
    pub intercept: f64,
    pub context: f64,
    pub task: f64,
    pub interaction: f64,
}

impl ParticipantRandomEffects {
    fn from_array(b: [f64; N_EFFECTS]) -> Self {
        Self {
            intercept: b[0],
            context: b[1],
            task: b[2],
            interaction: b[3],
        }
    }
}

/// Seeded random stream with the normal and Bernoulli draws the generator needs
pub struct SimRng {
    inner: ChaCha20Rng,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Standard normal via Box-Muller
    pub fn standard_normal(&mut self) -> f64 {
        // 1 - [0, 1) keeps u1 away from zero
        let u1: f64 = 1.0 - self.inner.gen::<f64>();
        let u2: f64 = self.inner.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    pub fn bernoulli(&mut self, p: f64) -> u8 {
        u8::from(self.inner.gen::<f64>() < p)
    }
}

/// Logistic link, kept strictly inside (0, 1) for any finite predictor
pub fn inv_logit(x: f64) -> f64 {
    let p = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    p.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

/// Linear predictor for one cell given fixed and participant effects
pub fn linear_predictor(fixed: &FixedEffects, re: &ParticipantRandomEffects, cell: Cell) -> f64 {
    let c = cell.context_code();
    let t = cell.task_code();
    fixed.intercept
        + re.intercept
        + (fixed.context + re.context) * c
        + (fixed.task + re.task) * t
        + (fixed.interaction + re.interaction) * c * t
}

/// Success probability of each cell (in `Cell::ALL` order) with no participant variability
pub fn expected_cell_probabilities(fixed: &FixedEffects) -> [f64; 4] {
    let zero = ParticipantRandomEffects::from_array([0.0; N_EFFECTS]);
    let mut probs = [0.0; 4];
    for cell in Cell::ALL {
        probs[cell.index()] = inv_logit(linear_predictor(fixed, &zero, cell));
    }
    probs
}

fn check_sizes(n_participants: usize, n_trials_per_cell: usize) -> Result<(), InputError> {
    if n_participants == 0 {
        return Err(InputError::NonPositiveCount {
            name: "participant count",
            value: 0,
        });
    }
    if n_trials_per_cell == 0 {
        return Err(InputError::NonPositiveCount {
            name: "trial count",
            value: 0,
        });
    }
    Ok(())
}

/// Draw correlated random effects for `n_participants` participants
pub fn draw_random_effects(
    n_participants: usize,
    sds: &RandomEffectSds,
    correlations: &Correlations,
    rng: &mut SimRng,
) -> Result<Vec<ParticipantRandomEffects>, InputError> {
    sds.validate()?;
    let factor = scale_factor(&correlations.cholesky()?, &sds.as_array());

    let effects = (0..n_participants)
        .map(|_| {
            let mut z = [0.0; N_EFFECTS];
            for v in z.iter_mut() {
                *v = rng.standard_normal();
            }
            ParticipantRandomEffects::from_array(lower_mul(&factor, &z))
        })
        .collect();

    Ok(effects)
}

/// Participant label, zero-padded to the width of the participant count
pub fn participant_label(index: usize, n_participants: usize) -> String {
    let width = n_participants.to_string().len().max(3);
    format!("p{:0width$}", index + 1, width = width)
}

/// Generate one synthetic dataset.
///
/// Rows come out ordered by participant, then cell (AA, AB, BA, BB), then
/// trial. The same seed and parameters always give the same records.
pub fn generate(
    n_participants: usize,
    n_trials_per_cell: usize,
    fixed: &FixedEffects,
    sds: &RandomEffectSds,
    correlations: &Correlations,
    seed: u64,
) -> Result<Vec<SimulatedTrialRecord>, InputError> {
    check_sizes(n_participants, n_trials_per_cell)?;
    fixed.validate()?;

    let mut rng = SimRng::new(seed);
    let effects = draw_random_effects(n_participants, sds, correlations, &mut rng)?;

    let mut rows = Vec::with_capacity(n_participants * n_trials_per_cell * Cell::ALL.len());

    for (participant, re) in effects.iter().enumerate() {
        let participant_id = participant_label(participant, n_participants);

        for cell in Cell::ALL {
            let eta = linear_predictor(fixed, re, cell);
            let p = inv_logit(eta);

            for trial in 0..n_trials_per_cell {
                rows.push(SimulatedTrialRecord {
                    participant_id: participant_id.clone(),
                    participant,
                    context: cell.context,
                    task: cell.task,
                    context_code: cell.context_code(),
                    task_code: cell.task_code(),
                    trial,
                    linear_predictor: eta,
                    probability: p,
                    outcome: rng.bernoulli(p),
                });
            }
        }
    }

    Ok(rows)
}

/// Recover each participant's random effects from the linear predictors
/// stored in a dataset, in participant order.
///
/// The four cells of a participant determine the four coefficients exactly,
/// so this inverts the generator for inspection of a simulated draw.
pub fn recover_random_effects(
    records: &[SimulatedTrialRecord],
    fixed: &FixedEffects,
) -> Vec<ParticipantRandomEffects> {
    let n_participants = records.iter().map(|r| r.participant + 1).max().unwrap_or(0);
    let mut eta = vec![[0.0; N_EFFECTS]; n_participants];
    for r in records {
        eta[r.participant][r.cell().index()] = r.linear_predictor;
    }

    eta.iter()
        .map(|e| {
            // Codes are balanced and orthogonal over the four cells
            let mut b = [0.0; N_EFFECTS];
            for cell in Cell::ALL {
                let v = e[cell.index()];
                let (c, t) = (cell.context_code(), cell.task_code());
                b[0] += v / 4.0;
                b[1] += c * v;
                b[2] += t * v;
                b[3] += 4.0 * c * t * v;
            }
            let fixed = fixed.as_array();
            ParticipantRandomEffects::from_array([
                b[0] - fixed[0],
                b[1] - fixed[1],
                b[2] - fixed[2],
                b[3] - fixed[3],
            ])
        })
        .collect()
}

/// Sample standard deviations of a set of participant effects
pub fn empirical_sds(effects: &[ParticipantRandomEffects]) -> RandomEffectSds {
    let sd = |f: fn(&ParticipantRandomEffects) -> f64| {
        if effects.len() < 2 {
            return 0.0;
        }
        let n = effects.len() as f64;
        let mean = effects.iter().map(f).sum::<f64>() / n;
        (effects.iter().map(|e| (f(e) - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };

    RandomEffectSds {
        intercept: sd(|e| e.intercept),
        context: sd(|e| e.context),
        task: sd(|e| e.task),
        interaction: sd(|e| e.interaction),
    }
}

/// Write simulated trials to CSV
pub fn write_trials_csv(path: &Path, data: &[SimulatedTrialRecord]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(
        out,
        "participant,context,task,context_code,task_code,trial,linear_predictor,probability,outcome"
    )?;

    for row in data {
        writeln!(
            out,
            "{},{},{},{},{},{},{:.6},{:.6},{}",
            row.participant_id,
            row.context,
            row.task,
            row.context_code,
            row.task_code,
            row.trial,
            row.linear_predictor,
            row.probability,
            row.outcome
        )?;
    }

    out.flush()?;
    Ok(())
}

//! Convergence diagnostics for sampler output
//!
//! Split-Rhat and a simple bulk ESS, computed per parameter from
//! per-chain draws.

use crate::error::FitFailure;
use serde::{Deserialize, Serialize};

/// Diagnostics for a single parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDiagnostics {
    pub name: String,
    /// Split Rhat (should be < 1.01 for a production fit)
    pub rhat: f64,
    /// Effective sample size
    pub ess_bulk: f64,
    pub mean: f64,
    pub sd: f64,
    /// Quantiles [5%, 50%, 95%]
    pub quantiles: [f64; 3],
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn variance(xs: &[f64], m: f64) -> f64 {
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Compute diagnostics for one parameter from its per-chain draws.
///
/// Each chain is split in half before computing Rhat, so a single chain still
/// gets a meaningful value.
pub fn compute_diagnostics(
    name: &str,
    chain_samples: &[Vec<f64>],
) -> Result<ParamDiagnostics, FitFailure> {
    let min_len = chain_samples.iter().map(|c| c.len()).min().unwrap_or(0);
    if chain_samples.is_empty() || min_len < 4 {
        return Err(FitFailure::NoDraws(name.to_string()));
    }

    let half = min_len / 2;
    let splits: Vec<&[f64]> = chain_samples
        .iter()
        .flat_map(|c| [&c[..half], &c[half..2 * half]])
        .collect();

    let m = splits.len() as f64;
    let n = half as f64;

    let split_means: Vec<f64> = splits.iter().map(|s| mean(s)).collect();
    let split_vars: Vec<f64> = splits
        .iter()
        .zip(&split_means)
        .map(|(s, &mu)| variance(s, mu))
        .collect();

    // Between-chain variance (B)
    let grand_mean = split_means.iter().sum::<f64>() / m;
    let b = n * split_means
        .iter()
        .map(|mu| (mu - grand_mean).powi(2))
        .sum::<f64>()
        / (m - 1.0);

    // Within-chain variance (W)
    let w = split_vars.iter().sum::<f64>() / m;

    let var_plus = ((n - 1.0) * w + b) / n;
    let rhat = if w > 0.0 {
        (var_plus / w).sqrt()
    } else if b == 0.0 {
        // constant draws everywhere
        1.0
    } else {
        f64::INFINITY
    };

    let ess_bulk = if rhat.is_finite() {
        m * n / rhat.powi(2)
    } else {
        0.0
    };

    let mut all: Vec<f64> = chain_samples.iter().flatten().copied().collect();
    if all.iter().any(|x| !x.is_finite()) {
        return Err(FitFailure::OutputParse(format!(
            "non-finite draws for {}",
            name
        )));
    }
    all.sort_by(|a, b| a.total_cmp(b));

    let overall_mean = mean(&all);
    let sd = variance(&all, overall_mean).sqrt();

    Ok(ParamDiagnostics {
        name: name.to_string(),
        rhat,
        ess_bulk,
        mean: overall_mean,
        sd,
        quantiles: [
            quantile(&all, 0.05),
            quantile(&all, 0.50),
            quantile(&all, 0.95),
        ],
    })
}

//! Model fit adapter
//!
//! The hierarchical binomial-logit model is fit by an external engine. This
//! module defines the boundary the rest of the crate sees:
//! - `ModelHandle`: an immutable, compiled model that can be re-fit to new data
//! - `ComputeBudget`: sampler settings for one fit
//! - `PosteriorSummary`: fixed-effect draws plus convergence diagnostics
//!
//! `stan::CmdStanModel` is the CmdStan-backed implementation.

pub mod diagnostics;
pub mod stan;

pub use diagnostics::{compute_diagnostics, ParamDiagnostics};
pub use stan::{compile_stan_model, detect_cmdstan, write_stan_program, CmdStanModel, STAN_PROGRAM};

use crate::error::{FitFailure, InputError};
use crate::summary::BinomialTable;
use serde::{Deserialize, Serialize};

/// Names of the fixed-effect coefficients, in model order
pub const FIXED_EFFECT_NAMES: [&str; 4] = ["intercept", "context", "task", "context:task"];

/// Sampler settings for a single fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeBudget {
    pub chains: usize,
    pub warmup: usize,
    pub samples: usize,
    /// Chains run concurrently within one fit
    pub parallel_chains: usize,
    /// Adapt delta (target acceptance rate)
    pub adapt_delta: f64,
    pub max_treedepth: usize,
    /// Fits with any fixed-effect Rhat above this are treated as failed
    pub max_rhat: f64,
}

impl Default for ComputeBudget {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            samples: 1000,
            parallel_chains: 4,
            adapt_delta: 0.9,
            max_treedepth: 10,
            max_rhat: 1.05,
        }
    }
}

impl ComputeBudget {
    pub fn validate(&self) -> Result<(), InputError> {
        let counts = [
            ("chains", self.chains),
            ("samples", self.samples),
            ("parallel chains", self.parallel_chains),
            ("max treedepth", self.max_treedepth),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(InputError::NonPositiveCount { name, value });
            }
        }
        if !(self.adapt_delta > 0.0 && self.adapt_delta < 1.0) {
            return Err(InputError::InvalidConfig(format!(
                "adapt_delta must lie in (0, 1), got {}",
                self.adapt_delta
            )));
        }
        if !(self.max_rhat >= 1.0) {
            return Err(InputError::InvalidConfig(format!(
                "max_rhat must be at least 1, got {}",
                self.max_rhat
            )));
        }
        Ok(())
    }
}

/// Priors of the hierarchical model.
///
/// Fixed effects get independent normal priors; their scales are needed again
/// when computing point-hypothesis evidence ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    /// Normal(0, sd) scales for intercept, context, task, interaction
    pub fixed_sd: [f64; 4],
    /// Scale of the half student_t(3, 0, scale) prior on random-effect SDs
    pub tau_scale: f64,
    /// LKJ shape of the random-effect correlation prior
    pub lkj_eta: f64,
}

impl Default for PriorSpec {
    fn default() -> Self {
        Self {
            fixed_sd: [1.5, 1.0, 1.0, 1.0],
            tau_scale: 2.5,
            lkj_eta: 1.0,
        }
    }
}

impl PriorSpec {
    pub fn validate(&self) -> Result<(), InputError> {
        let scales = self.fixed_sd.iter().chain([&self.tau_scale, &self.lkj_eta]);
        for &value in scales {
            if !(value.is_finite() && value > 0.0) {
                return Err(InputError::InvalidConfig(format!(
                    "prior scales must be finite and positive, got {}",
                    value
                )));
            }
        }
        Ok(())
    }
}

/// Posterior of one fit, restricted to what hypothesis testing needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    /// Pooled draws of (intercept, context, task, interaction)
    pub draws: Vec<[f64; 4]>,
    pub priors: PriorSpec,
    pub diagnostics: Vec<ParamDiagnostics>,
}

impl PosteriorSummary {
    pub fn n_draws(&self) -> usize {
        self.draws.len()
    }

    pub fn max_rhat(&self) -> Option<f64> {
        self.diagnostics
            .iter()
            .map(|d| d.rhat)
            .fold(None, |acc, r| Some(acc.map_or(r, |a: f64| a.max(r))))
    }

    /// Draws of a single coefficient
    pub fn coefficient(&self, index: usize) -> Vec<f64> {
        self.draws.iter().map(|d| d[index]).collect()
    }
}

/// A compiled model that can be re-fit to new data without recompiling.
///
/// Implementations must not mutate themselves during a fit: one handle is
/// shared by reference across all workers of a grid run.
pub trait ModelHandle: Send + Sync {
    fn fit_or_update(
        &self,
        data: &BinomialTable,
        budget: &ComputeBudget,
        seed: u64,
    ) -> Result<PosteriorSummary, FitFailure>;

    fn priors(&self) -> &PriorSpec;
}

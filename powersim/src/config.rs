//! Study configuration: data-generating parameters, the design grid and
//! execution resources.
//!
//! Every section has a `Default` matching the reference study and a
//! `validate()` that reports `InputError` before any simulation starts.

use crate::covariance::Correlations;
use crate::error::InputError;
use crate::fit::{ComputeBudget, PriorSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Population-level coefficients on the log-odds scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedEffects {
    pub intercept: f64,
    pub context: f64,
    pub task: f64,
    pub interaction: f64,
}

impl FixedEffects {
    pub fn as_array(&self) -> [f64; 4] {
        [self.intercept, self.context, self.task, self.interaction]
    }

    pub fn validate(&self) -> Result<(), InputError> {
        let named = [
            ("intercept", self.intercept),
            ("context", self.context),
            ("task", self.task),
            ("interaction", self.interaction),
        ];
        for (name, value) in named {
            if !value.is_finite() {
                return Err(InputError::NonFinite { name, value });
            }
        }
        Ok(())
    }
}

/// Standard deviations of the participant random effects
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectSds {
    pub intercept: f64,
    pub context: f64,
    pub task: f64,
    pub interaction: f64,
}

impl RandomEffectSds {
    pub fn zero() -> Self {
        Self {
            intercept: 0.0,
            context: 0.0,
            task: 0.0,
            interaction: 0.0,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.intercept, self.context, self.task, self.interaction]
    }

    pub fn validate(&self) -> Result<(), InputError> {
        let named = [
            ("intercept", self.intercept),
            ("context", self.context),
            ("task", self.task),
            ("interaction", self.interaction),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(InputError::InvalidStdDev { name, value });
            }
        }
        Ok(())
    }
}

impl Default for RandomEffectSds {
    fn default() -> Self {
        Self {
            intercept: 0.5,
            context: 0.3,
            task: 0.3,
            interaction: 0.2,
        }
    }
}

/// Data-generating parameters shared by every design point.
///
/// The interaction coefficient is not stored here; it comes from the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub intercept: f64,
    pub context: f64,
    pub task: f64,
    pub random_effect_sds: RandomEffectSds,
    pub correlations: Correlations,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            intercept: 0.5,
            context: 0.3,
            task: 0.3,
            random_effect_sds: RandomEffectSds::default(),
            correlations: Correlations([0.2, 0.1, 0.0, 0.1, 0.0, 0.0]),
        }
    }
}

impl SimulationParams {
    /// Fixed effects for a given true interaction
    pub fn fixed_effects(&self, interaction: f64) -> FixedEffects {
        FixedEffects {
            intercept: self.intercept,
            context: self.context,
            task: self.task,
            interaction,
        }
    }

    pub fn validate(&self) -> Result<(), InputError> {
        self.fixed_effects(0.0).validate()?;
        self.random_effect_sds.validate()?;
        self.correlations.cholesky()?;
        Ok(())
    }
}

/// The design grid and decision rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub participant_counts: Vec<usize>,
    pub trial_counts: Vec<usize>,
    pub effect_sizes: Vec<f64>,
    pub n_replications: usize,
    #[serde(default = "default_threshold")]
    pub decision_threshold: f64,
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
}

fn default_threshold() -> f64 {
    10.0
}

fn default_base_seed() -> u64 {
    2024
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            participant_counts: vec![40, 60, 80, 100, 120],
            trial_counts: vec![25, 50, 100],
            effect_sizes: vec![0.0, 0.1, 0.2, 0.3],
            n_replications: 100,
            decision_threshold: default_threshold(),
            base_seed: default_base_seed(),
        }
    }
}

impl GridConfig {
    /// Number of design points including replications
    pub fn n_points(&self) -> usize {
        self.participant_counts.len()
            * self.trial_counts.len()
            * self.effect_sizes.len()
            * self.n_replications
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.participant_counts.is_empty() {
            return Err(InputError::EmptyAxis("participant_counts"));
        }
        if self.trial_counts.is_empty() {
            return Err(InputError::EmptyAxis("trial_counts"));
        }
        if self.effect_sizes.is_empty() {
            return Err(InputError::EmptyAxis("effect_sizes"));
        }
        for &n in &self.participant_counts {
            if n == 0 {
                return Err(InputError::NonPositiveCount {
                    name: "participant count",
                    value: n,
                });
            }
        }
        for &n in &self.trial_counts {
            if n == 0 {
                return Err(InputError::NonPositiveCount {
                    name: "trial count",
                    value: n,
                });
            }
        }
        for &e in &self.effect_sizes {
            if !e.is_finite() {
                return Err(InputError::NonFinite {
                    name: "effect size",
                    value: e,
                });
            }
        }
        if self.n_replications == 0 {
            return Err(InputError::NonPositiveCount {
                name: "replication count",
                value: 0,
            });
        }
        validate_threshold(self.decision_threshold)
    }
}

pub fn validate_threshold(threshold: f64) -> Result<(), InputError> {
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(InputError::InvalidThreshold(threshold));
    }
    Ok(())
}

/// Worker-pool sizing.
///
/// Two levels of parallelism: `workers` tasks run at once, and each model fit
/// inside a task runs up to `cores_per_fit` chains at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Explicit worker count; derived from hardware when unset
    pub workers: Option<usize>,
    pub cores_per_fit: usize,
    pub reserved_cores: usize,
    /// Log progress every this many completed tasks
    pub log_every: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: None,
            cores_per_fit: 4,
            reserved_cores: 1,
            log_every: 10,
        }
    }
}

impl ExecutionConfig {
    /// Worker count for a machine with `hardware_threads` threads
    pub fn resolve_workers(&self, hardware_threads: usize) -> usize {
        match self.workers {
            Some(w) => w.max(1),
            None => {
                let usable = hardware_threads.saturating_sub(self.reserved_cores);
                (usable / self.cores_per_fit.max(1)).max(1)
            }
        }
    }

    /// Worker count for the current machine
    pub fn workers_for_host(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.resolve_workers(hw)
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.workers == Some(0) {
            return Err(InputError::NonPositiveCount {
                name: "worker count",
                value: 0,
            });
        }
        if self.cores_per_fit == 0 {
            return Err(InputError::NonPositiveCount {
                name: "cores per fit",
                value: 0,
            });
        }
        if self.log_every == 0 {
            return Err(InputError::NonPositiveCount {
                name: "log interval",
                value: 0,
            });
        }
        Ok(())
    }
}

/// Complete configuration of a power study, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerStudyConfig {
    #[serde(default)]
    pub simulation: SimulationParams,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sampler: ComputeBudget,
    #[serde(default)]
    pub priors: PriorSpec,
}

impl PowerStudyConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn write_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), InputError> {
        self.simulation.validate()?;
        self.grid.validate()?;
        self.execution.validate()?;
        self.sampler.validate()?;
        self.priors.validate()?;
        Ok(())
    }

    /// Sampler budget with chain parallelism tied to `cores_per_fit`
    pub fn compute_budget(&self) -> ComputeBudget {
        ComputeBudget {
            parallel_chains: self.execution.cores_per_fit,
            ..self.sampler.clone()
        }
    }
}

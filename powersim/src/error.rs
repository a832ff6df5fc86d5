//! Error taxonomy for the power study
//!
//! - `InputError`: invalid design or simulation parameters, fatal before any work starts
//! - `FitFailure`: one model fit did not produce a usable posterior
//! - `TaskFailure`: one simulation-fit task failed; recorded and excluded downstream

use serde::{Deserialize, Serialize};

/// Invalid parameters detected during validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("{name} must be positive, got {value}")]
    NonPositiveCount { name: &'static str, value: usize },

    #[error("random-effect standard deviation '{name}' must be finite and non-negative, got {value}")]
    InvalidStdDev { name: &'static str, value: f64 },

    #[error("correlation {index} must lie in [-1, 1], got {value}")]
    CorrelationOutOfRange { index: usize, value: f64 },

    #[error("correlation matrix is not positive semi-definite (pivot {pivot} = {value:.3e})")]
    CorrelationNotPsd { pivot: usize, value: f64 },

    #[error("design grid axis '{0}' is empty")]
    EmptyAxis(&'static str),

    #[error("{name} must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },

    #[error("decision threshold must be finite and positive, got {0}")]
    InvalidThreshold(f64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a single fit of the hierarchical model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum FitFailure {
    #[error("sampler failed: {0}")]
    SamplerFailed(String),

    #[error("non-convergence: {param} has Rhat = {rhat:.3} (limit {limit:.3})")]
    NonConvergence { param: String, rhat: f64, limit: f64 },

    #[error("could not parse sampler output: {0}")]
    OutputParse(String),

    #[error("posterior has no draws for {0}")]
    NoDraws(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FitFailure {
    fn from(err: std::io::Error) -> Self {
        FitFailure::Io(err.to_string())
    }
}

/// Failure of one simulation-fit task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum TaskFailure {
    #[error("fit failed: {0}")]
    Fit(#[from] FitFailure),

    #[error("posterior does not support the {0} hypothesis")]
    MissingEvidence(String),

    #[error("invalid task input: {0}")]
    Input(String),

    /// Recovered from a persisted results file where only the message survives
    #[error("{0}")]
    Recorded(String),
}

impl From<InputError> for TaskFailure {
    fn from(err: InputError) -> Self {
        TaskFailure::Input(err.to_string())
    }
}

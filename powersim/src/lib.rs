//! Simulation-based power analysis for a context × task replication study.
//!
//! Participants complete binary-outcome trials in every cell of a 2 × 2
//! context × task design. For each point of a design grid (participant
//! count, trials per cell, true interaction effect) the crate repeatedly
//! simulates a dataset, fits a hierarchical binomial-logit model and records
//! evidence ratios for the interaction. Power is the share of replications
//! whose evidence ratio clears a decision threshold.
//!
//! Pipeline: [`datagen`] → [`summary`] → [`fit`] → [`hypothesis`], composed
//! per design point by [`task`], run in parallel by [`grid`] and reduced by
//! [`aggregate`].

pub mod aggregate;
pub mod config;
pub mod contrast;
pub mod covariance;
pub mod datagen;
pub mod error;
pub mod fit;
pub mod grid;
pub mod hypothesis;
pub mod ledger;
pub mod results;
pub mod summary;
pub mod task;

pub use aggregate::{aggregate, AggregatedCell, CellKey, DecisionPower, PowerTable};
pub use config::{ExecutionConfig, FixedEffects, GridConfig, PowerStudyConfig, RandomEffectSds, SimulationParams};
pub use error::{FitFailure, InputError, TaskFailure};
pub use fit::{ComputeBudget, ModelHandle, PosteriorSummary, PriorSpec};
pub use grid::{build_grid, CancelToken, GridProgress, GridRun, GridRunner};
pub use hypothesis::{evaluate, EvidenceRatios, LinearHypothesis};
pub use task::{derive_seed, run_task, DesignPoint, TaskResult};
